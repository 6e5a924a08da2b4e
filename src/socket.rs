//! Unix stream sockets for the control protocol and socket outputs.
//!
//! A socket spec with a leading `@` names an abstract-namespace socket;
//! anything else is a filesystem path, unlinked before bind and again when
//! the listener goes away.

use std::os::fd::{AsFd, AsRawFd, BorrowedFd, FromRawFd, OwnedFd, RawFd};
use std::path::PathBuf;

use nix::sys::socket::{
    accept4, bind, connect, listen, socket, AddressFamily, Backlog, SockFlag, SockType, UnixAddr,
};

use crate::error::{Error, Result};

fn unix_stream_socket() -> Result<OwnedFd> {
    Ok(socket(
        AddressFamily::Unix,
        SockType::Stream,
        SockFlag::SOCK_CLOEXEC,
        None,
    )?)
}

fn unix_addr(spec: &str) -> Result<(UnixAddr, Option<PathBuf>)> {
    if let Some(name) = spec.strip_prefix('@') {
        let addr = UnixAddr::new_abstract(name.as_bytes())
            .map_err(|e| Error::config(format!("bad abstract socket name '{name}': {e}")))?;
        Ok((addr, None))
    } else {
        let addr = UnixAddr::new(spec)
            .map_err(|e| Error::config(format!("bad socket path '{spec}': {e}")))?;
        Ok((addr, Some(PathBuf::from(spec))))
    }
}

/// A listening control socket.
pub struct Listener {
    fd: OwnedFd,
    unlink: Option<PathBuf>,
}

impl Listener {
    pub fn bind(spec: &str) -> Result<Listener> {
        let (addr, path) = unix_addr(spec)?;
        let fd = unix_stream_socket()?;
        if let Some(p) = &path {
            let _ = std::fs::remove_file(p);
        }
        bind(fd.as_raw_fd(), &addr)
            .map_err(|e| Error::config(format!("failed to bind to {spec}: {e}")))?;
        listen(&fd, Backlog::new(5)?)?;
        Ok(Listener { fd, unlink: path })
    }

    /// Accepts one client with close-on-exec set.
    pub fn accept(&self) -> Result<OwnedFd> {
        let fd = accept4(self.fd.as_raw_fd(), SockFlag::SOCK_CLOEXEC)?;
        Ok(unsafe { OwnedFd::from_raw_fd(fd) })
    }
}

impl AsFd for Listener {
    fn as_fd(&self) -> BorrowedFd<'_> {
        self.fd.as_fd()
    }
}

impl AsRawFd for Listener {
    fn as_raw_fd(&self) -> RawFd {
        self.fd.as_raw_fd()
    }
}

impl Drop for Listener {
    fn drop(&mut self) {
        if let Some(p) = self.unlink.take() {
            let _ = std::fs::remove_file(p);
        }
    }
}

/// Connects to a listening socket given by spec.
pub fn connect_spec(spec: &str) -> Result<OwnedFd> {
    match try_connect_spec(spec)? {
        Ok(fd) => Ok(fd),
        Err(e) => Err(Error::config(format!("failed to connect to {spec}: {e}"))),
    }
}

/// Like [`connect_spec`], but surfaces the raw `connect(2)` errno so the
/// caller can react to `ECONNREFUSED`.
pub fn try_connect_spec(spec: &str) -> Result<std::result::Result<OwnedFd, nix::errno::Errno>> {
    let (addr, _) = unix_addr(spec)?;
    let fd = unix_stream_socket()?;
    Ok(match connect(fd.as_raw_fd(), &addr) {
        Ok(()) => Ok(fd),
        Err(e) => Err(e),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{read_exact_fd, write_all_fd};

    fn test_name(tag: &str) -> String {
        format!("@netevent-test-{}-{tag}", std::process::id())
    }

    #[test]
    fn abstract_listen_and_connect() {
        let spec = test_name("listen");
        let server = Listener::bind(&spec).unwrap();
        let client = connect_spec(&spec).unwrap();
        let conn = server.accept().unwrap();
        write_all_fd(client.as_raw_fd(), b"ping").unwrap();
        let mut buf = [0u8; 4];
        assert!(read_exact_fd(conn.as_raw_fd(), &mut buf).unwrap());
        assert_eq!(&buf, b"ping");
    }

    #[test]
    fn filesystem_socket_is_unlinked_on_drop() {
        let path = std::env::temp_dir().join(format!("netevent-test-{}.sock", std::process::id()));
        let spec = path.to_str().unwrap().to_string();
        {
            let _server = Listener::bind(&spec).unwrap();
            assert!(path.exists());
            // binding again succeeds thanks to the pre-bind unlink
            let _server2 = Listener::bind(&spec).unwrap();
        }
        assert!(!path.exists());
    }

    #[test]
    fn connect_to_missing_socket_fails() {
        assert!(connect_spec(&test_name("nobody-home")).is_err());
    }
}
