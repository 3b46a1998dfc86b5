//! # instrumentation
//!
//! Tool-side bookkeeping for code inserted into running target processes.
//!
//! An [`InstRequest`] is one desired code patch (a snippet at a point) and a
//! [`DataRequest`] is one sampled value living inside the target. Both are
//! installed through the [`CodePatcher`] and [`ProcessControl`] collaborators
//! and know how to duplicate themselves into a forked child or excise
//! themselves from one.
//!
//! Values reach the tool either by polling a shared [`PollRegion`] or through
//! report messages (see [`message`]) emitted by the target's sampling routine.

mod data_request;
mod focus;
mod inst_request;
pub mod message;
mod patcher;
mod point;
mod poll_region;
pub mod sim;

pub use data_request::*;
pub use focus::*;
pub use inst_request::*;
pub use patcher::*;
pub use point::*;
pub use poll_region::*;

use thiserror::Error;

/// Process identifier
pub type Pid = u32;

/// Thread identifier
pub type Tid = u32;

/// Address inside a target process
pub type Address = u64;

/// Nanosecond timestamp
pub type Timestamp = u64;

/// Errors returned when installing instrumentation or allocating target state
#[derive(Error, Debug, Clone, PartialEq)]
pub enum InstallError {
    /// The instrumentation point cannot be resolved; retrying will not help
    #[error("instrumentation point unreachable: {0}")]
    Unreachable(String),

    /// The process cannot accept a patch right now
    #[error("process is busy")]
    ProcessBusy,

    #[error("poll region error: {0}")]
    Region(#[from] RegionError),
}

impl InstallError {
    /// True for failures that are worth retrying later on the same process
    pub fn is_transient(&self) -> bool {
        matches!(self, InstallError::ProcessBusy)
    }
}

/// Errors returned when removing a patch
#[derive(Error, Debug, Clone, PartialEq)]
pub enum PatchError {
    #[error("no patch {handle} in process {pid}")]
    UnknownPatch { pid: Pid, handle: PatchHandle },

    #[error("process {0} is busy")]
    ProcessBusy(Pid),

    #[error("process {0} does not exist")]
    NoSuchProcess(Pid),
}

/// Errors in the shared poll region
#[derive(Error, Debug, Clone, PartialEq)]
pub enum RegionError {
    #[error("poll region has no free slots")]
    Full,

    #[error("slot {0} was rewritten during every read attempt")]
    TornRead(usize),

    #[error("slot {0} is out of range or not allocated")]
    BadSlot(usize),
}

/// Errors when carrying requests across a fork
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ForkError {
    #[error("fork map has no child patch for {0}")]
    MissingPatch(PatchHandle),

    #[error("child process {0} has no poll region")]
    NoRegion(Pid),

    #[error("request was never installed")]
    NotInstalled,

    #[error("install error in child: {0}")]
    Install(#[from] InstallError),

    #[error("patch error in child: {0}")]
    Patch(#[from] PatchError),

    #[error("poll region error in child: {0}")]
    Region(#[from] RegionError),
}
