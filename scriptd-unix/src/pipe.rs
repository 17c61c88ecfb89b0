//! Pipe utilities for the extra file descriptors handed to script children.
//!
//! Provides `pipe_cloexec()` which creates a pipe with both ends marked
//! close-on-exec, and `dup_to_fd()` for re-binding a write end onto a fixed
//! descriptor number from inside a `pre_exec` hook. On Linux the pipe uses
//! the atomic `pipe2(O_CLOEXEC)`; on macOS it falls back to `pipe()` +
//! `fcntl(F_SETFD, FD_CLOEXEC)`.

use std::os::fd::{OwnedFd, RawFd};

/// Create a pipe with both ends marked `CLOEXEC`.
///
/// Uses `pipe2(O_CLOEXEC)` where available (Linux, FreeBSD, etc.),
/// falls back to `pipe()` + `fcntl` on platforms without `pipe2` (macOS).
pub fn pipe_cloexec() -> Result<(OwnedFd, OwnedFd), nix::Error> {
    pipe_cloexec_impl()
}

#[cfg(not(target_os = "macos"))]
fn pipe_cloexec_impl() -> Result<(OwnedFd, OwnedFd), nix::Error> {
    nix::unistd::pipe2(nix::fcntl::OFlag::O_CLOEXEC)
}

#[cfg(target_os = "macos")]
fn pipe_cloexec_impl() -> Result<(OwnedFd, OwnedFd), nix::Error> {
    let (read_fd, write_fd) = nix::unistd::pipe()?;
    set_cloexec(&read_fd)?;
    set_cloexec(&write_fd)?;
    Ok((read_fd, write_fd))
}

/// Set the `CLOEXEC` flag on a file descriptor.
#[cfg(target_os = "macos")]
fn set_cloexec(fd: &OwnedFd) -> Result<(), nix::Error> {
    use std::os::fd::AsRawFd;
    nix::fcntl::fcntl(
        fd.as_raw_fd(),
        nix::fcntl::FcntlArg::F_SETFD(nix::fcntl::FdFlag::FD_CLOEXEC),
    )?;
    Ok(())
}

/// Return an `OwnedFd` equivalent to `fd` whose raw number is at least
/// `min`, duplicating with `F_DUPFD_CLOEXEC` when needed.
///
/// Re-binding pipe ends onto fixed low descriptor numbers with `dup2` is only
/// collision-free when every source sits above the target range; callers move
/// sources out of the way with this before forking.
pub fn dup_above_cloexec(fd: OwnedFd, min: RawFd) -> Result<OwnedFd, nix::Error> {
    use std::os::fd::{AsRawFd, FromRawFd};

    if fd.as_raw_fd() >= min {
        return Ok(fd);
    }
    let raw = nix::fcntl::fcntl(fd.as_raw_fd(), nix::fcntl::FcntlArg::F_DUPFD_CLOEXEC(min))?;
    // SAFETY: F_DUPFD_CLOEXEC returned a fresh descriptor we now own; the
    // original closes with `fd`.
    Ok(unsafe { OwnedFd::from_raw_fd(raw) })
}

/// Duplicate `fd` onto the fixed descriptor number `target`.
///
/// `dup2` clears `CLOEXEC` on the duplicate, so a pipe end created by
/// `pipe_cloexec` survives `exec` at `target` while the original closes.
///
/// Only raw syscalls; callable between `fork` and `exec` (async-signal-safe).
pub fn dup_to_fd(fd: RawFd, target: RawFd) -> std::io::Result<()> {
    let ret = unsafe { libc::dup2(fd, target) };
    if ret == -1 {
        Err(std::io::Error::last_os_error())
    } else {
        Ok(())
    }
}
