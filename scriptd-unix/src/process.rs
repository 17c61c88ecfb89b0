//! Process-group signalling.
//!
//! A script child is spawned as the leader of a fresh process group, so a
//! single `SIGKILL` addressed to the negated pgid terminates the child and
//! every descendant it spawned.

use nix::sys::signal::{killpg, Signal};
use nix::unistd::{getpgid, Pid};

/// Send `SIGKILL` to the process group of `pid`.
///
/// Looks up the group id first so the kill lands on the whole tree even if
/// the leader already changed state.
pub fn kill_process_group(pid: u32) -> Result<(), nix::Error> {
    let pgid = getpgid(Some(Pid::from_raw(pid as i32)))?;
    killpg(pgid, Signal::SIGKILL)
}
