//! Low-level sharing of Linux input devices.
//!
//! The sender side grabs evdev nodes and mirrors their events over a framed
//! binary protocol; the receiver recreates each device via uinput and
//! replays the events. The [`daemon`] module multiplexes any number of
//! inputs, outputs and control clients on a single poll loop.

use std::os::fd::RawFd;

pub use crate::error::{Error, Result};

pub mod bitfield;
pub mod command;
pub mod daemon;
pub mod device;
pub mod error;
pub mod event;
pub mod proto;
pub mod socket;
mod sys;
pub mod uinput;

/// Reads exactly `buf.len()` bytes from `fd`.
///
/// Returns `Ok(false)` on a clean end of stream before the first byte; end
/// of stream in the middle of the buffer is an error.
pub fn read_exact_fd(fd: RawFd, buf: &mut [u8]) -> Result<bool> {
    let mut off = 0;
    while off < buf.len() {
        let res = unsafe {
            libc::read(
                fd,
                buf[off..].as_mut_ptr() as *mut libc::c_void,
                buf.len() - off,
            )
        };
        match nix::errno::Errno::result(res) {
            Err(nix::errno::Errno::EINTR) => continue,
            Err(e) => return Err(e.into()),
            Ok(0) if off == 0 => return Ok(false),
            Ok(0) => return Err(Error::protocol("unexpected end of stream")),
            Ok(n) => off += n as usize,
        }
    }
    Ok(true)
}

/// Writes all of `buf` to `fd`, retrying on short writes and `EINTR`.
pub fn write_all_fd(fd: RawFd, buf: &[u8]) -> Result<()> {
    let mut off = 0;
    while off < buf.len() {
        let res = unsafe {
            libc::write(
                fd,
                buf[off..].as_ptr() as *const libc::c_void,
                buf.len() - off,
            )
        };
        match nix::errno::Errno::result(res) {
            Err(nix::errno::Errno::EINTR) => continue,
            Err(e) => return Err(e.into()),
            Ok(n) => off += n as usize,
        }
    }
    Ok(())
}
