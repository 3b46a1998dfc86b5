use std::fmt::Debug;
use std::future::Future;

use tokio_util::sync::CancellationToken;

/// How a supervised task ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TaskOutcome {
    Completed,
    Failed(String),
    Panicked,
}

impl TaskOutcome {
    pub fn is_completed(&self) -> bool {
        matches!(self, TaskOutcome::Completed)
    }
}

/// Runs `future` on its own task and cancels `token` once it ends.
///
/// The collector stops as soon as one of its background tasks ends, whether
/// the task finished, failed or panicked.
pub async fn supervise<F, T, E>(future: F, token: CancellationToken, task_name: &'static str) -> TaskOutcome
where
    F: Future<Output = Result<T, E>> + Send + 'static,
    T: Debug + Send + 'static,
    E: Debug + Send + 'static,
{
    let handle = tokio::spawn(future);

    let outcome = match handle.await {
        Ok(Ok(result)) => {
            log::debug!("{} completed: {:?}", task_name, result);
            TaskOutcome::Completed
        }
        Ok(Err(error)) => {
            log::error!("{} failed with error: {:?}", task_name, error);
            TaskOutcome::Failed(format!("{:?}", error))
        }
        Err(join_error) => {
            log::error!("{} panicked or was cancelled: {:?}", task_name, join_error);
            TaskOutcome::Panicked
        }
    };

    token.cancel();
    outcome
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug)]
    #[allow(dead_code)]
    struct WriteError(String);

    #[tokio::test]
    async fn test_completed_task_cancels_token() {
        testing_logger::setup();
        let token = CancellationToken::new();

        let outcome = supervise(async { Ok::<u64, WriteError>(12) }, token.clone(), "output writer").await;

        assert_eq!(outcome, TaskOutcome::Completed);
        assert!(token.is_cancelled());
        testing_logger::validate(|captured_logs| {
            assert_eq!(captured_logs.len(), 1);
            assert_eq!(captured_logs[0].level, log::Level::Debug);
            assert_eq!(captured_logs[0].body, "output writer completed: 12");
        });
    }

    #[tokio::test]
    async fn test_failed_task_reports_error() {
        testing_logger::setup();
        let token = CancellationToken::new();

        let future = async { Err::<(), WriteError>(WriteError("disk full".to_string())) };
        let outcome = supervise(future, token.clone(), "output writer").await;

        assert_eq!(outcome, TaskOutcome::Failed("WriteError(\"disk full\")".to_string()));
        assert!(!outcome.is_completed());
        assert!(token.is_cancelled());
        testing_logger::validate(|captured_logs| {
            assert_eq!(captured_logs.len(), 1);
            assert_eq!(captured_logs[0].level, log::Level::Error);
            assert_eq!(
                captured_logs[0].body,
                "output writer failed with error: WriteError(\"disk full\")"
            );
        });
    }

    #[tokio::test]
    async fn test_panicked_task() {
        testing_logger::setup();
        let token = CancellationToken::new();

        let future = async {
            panic!("writer exploded");
            #[allow(unreachable_code)]
            Ok::<(), WriteError>(())
        };
        let outcome = supervise(future, token.clone(), "output writer").await;

        assert_eq!(outcome, TaskOutcome::Panicked);
        assert!(token.is_cancelled());
        testing_logger::validate(|captured_logs| {
            assert_eq!(captured_logs.len(), 1);
            assert_eq!(captured_logs[0].level, log::Level::Error);
            assert!(captured_logs[0]
                .body
                .starts_with("output writer panicked or was cancelled:"));
            assert!(captured_logs[0].body.contains("writer exploded"));
        });
    }

    #[tokio::test]
    async fn test_shared_token_cancelled_by_first_task() {
        let token = CancellationToken::new();
        let waiting = token.clone();

        let waiter = tokio::spawn(async move {
            waiting.cancelled().await;
            true
        });
        let outcome = supervise(async { Ok::<(), WriteError>(()) }, token, "short task").await;

        assert!(outcome.is_completed());
        assert!(waiter.await.unwrap());
    }
}
