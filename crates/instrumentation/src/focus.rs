use std::fmt;

use thiserror::Error;

use crate::Pid;

const CODE: &str = "Code";
const PROCESS: &str = "Process";

#[derive(Error, Debug, Clone, PartialEq)]
pub enum FocusError {
    #[error("resource path must start with '/': {0}")]
    Relative(String),

    #[error("invalid process selector: {0}")]
    BadProcess(String),
}

/// A resource-tree selector.
///
/// A focus is a set of resource paths such as `/Code/libc.so/read` or
/// `/Process/42`. An empty set selects the whole program.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default)]
pub struct Focus {
    paths: Vec<Vec<String>>,
}

impl Focus {
    pub fn whole_program() -> Self {
        Self::default()
    }

    /// Parses a comma separated list of resource paths. `"/"` and `""` both
    /// select the whole program.
    pub fn parse(text: &str) -> Result<Self, FocusError> {
        let mut paths = Vec::new();
        for part in text.split(',').map(str::trim).filter(|p| !p.is_empty()) {
            if !part.starts_with('/') {
                return Err(FocusError::Relative(part.to_string()));
            }
            let path: Vec<String> = part
                .split('/')
                .filter(|c| !c.is_empty())
                .map(str::to_string)
                .collect();
            if path.is_empty() {
                continue;
            }
            if path[0] == PROCESS && (path.len() != 2 || path[1].parse::<Pid>().is_err()) {
                return Err(FocusError::BadProcess(part.to_string()));
            }
            paths.push(path);
        }
        paths.sort();
        paths.dedup();
        Ok(Self { paths })
    }

    /// Restricts the focus to a single process, replacing any process selector
    pub fn for_process(&self, pid: Pid) -> Self {
        let mut paths: Vec<Vec<String>> = self
            .paths
            .iter()
            .filter(|p| p[0] != PROCESS)
            .cloned()
            .collect();
        paths.push(vec![PROCESS.to_string(), pid.to_string()]);
        paths.sort();
        Self { paths }
    }

    pub fn is_whole_program(&self) -> bool {
        self.paths.is_empty()
    }

    /// The selected process, if the focus names one
    pub fn process(&self) -> Option<Pid> {
        self.paths
            .iter()
            .find(|p| p[0] == PROCESS)
            .and_then(|p| p.get(1))
            .and_then(|pid| pid.parse().ok())
    }

    /// The function named by a `/Code/<module>/<function>` path
    pub fn function(&self) -> Option<&str> {
        self.paths
            .iter()
            .find(|p| p[0] == CODE && p.len() >= 3)
            .map(|p| p[p.len() - 1].as_str())
    }

    /// The code part of the focus, without the process selector
    pub fn code_name(&self) -> String {
        let code: Vec<String> = self
            .paths
            .iter()
            .filter(|p| p[0] != PROCESS)
            .map(|p| format!("/{}", p.join("/")))
            .collect();
        if code.is_empty() {
            "/".to_string()
        } else {
            code.join(",")
        }
    }

    /// Canonical string form, stable across equivalent inputs
    pub fn flat_name(&self) -> String {
        self.to_string()
    }
}

impl fmt::Display for Focus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.paths.is_empty() {
            return f.write_str("/");
        }
        let joined: Vec<String> = self
            .paths
            .iter()
            .map(|p| format!("/{}", p.join("/")))
            .collect();
        f.write_str(&joined.join(","))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case("", "/")]
    #[case("/", "/")]
    #[case("/Process/12,/Code/libc/read", "/Code/libc/read,/Process/12")]
    #[case(" /Code/app/work , /Code/app/work", "/Code/app/work")]
    fn test_parse_canonical(#[case] input: &str, #[case] expected: &str) {
        assert_eq!(Focus::parse(input).unwrap().flat_name(), expected);
    }

    #[test]
    fn test_parse_errors() {
        assert_eq!(
            Focus::parse("Code/x"),
            Err(FocusError::Relative("Code/x".to_string()))
        );
        assert_eq!(
            Focus::parse("/Process/abc"),
            Err(FocusError::BadProcess("/Process/abc".to_string()))
        );
    }

    #[test]
    fn test_selectors() {
        let focus = Focus::parse("/Code/libc/read,/Process/7").unwrap();
        assert_eq!(focus.process(), Some(7));
        assert_eq!(focus.function(), Some("read"));
        assert_eq!(focus.code_name(), "/Code/libc/read");

        let whole = Focus::whole_program();
        assert!(whole.is_whole_program());
        assert_eq!(whole.function(), None);
        assert_eq!(whole.for_process(3).flat_name(), "/Process/3");
    }
}
