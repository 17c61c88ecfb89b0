//! Unix plumbing shared by the scriptd daemon.
//!
//! Small, dependency-light wrappers around the pipe and process-group
//! syscalls the run supervisor needs. Everything here is `unix`-only;
//! the daemon does not build on other platforms.

pub mod pipe;
pub mod process;
