//! Edge-triggered I/O over raw socket descriptors.
//!
//! The relay pumps and the process stdio wiring both move bytes between
//! descriptors whose peers live on the other side of a vsock transport.
//! EOF must be propagated as an explicit half-close (`shutdown(SHUT_WR)`);
//! a blocking copy primitive would hold both directions open.

use std::os::fd::{AsRawFd, OwnedFd};

use tokio::io::Interest;
use tokio::io::unix::AsyncFd;

/// Make a descriptor non-blocking so it can drive an [`AsyncFd`].
pub(crate) fn set_nonblocking(fd: &impl AsRawFd) -> std::io::Result<()> {
    let raw = fd.as_raw_fd();
    let flags = unsafe { libc::fcntl(raw, libc::F_GETFL) };
    if flags < 0 {
        return Err(std::io::Error::last_os_error());
    }
    let rc = unsafe { libc::fcntl(raw, libc::F_SETFL, flags | libc::O_NONBLOCK) };
    if rc < 0 {
        return Err(std::io::Error::last_os_error());
    }
    Ok(())
}

/// Wrap an owned descriptor for readiness-driven I/O.
pub(crate) fn async_fd(fd: OwnedFd) -> std::io::Result<AsyncFd<OwnedFd>> {
    set_nonblocking(&fd)?;
    AsyncFd::with_interest(fd, Interest::READABLE | Interest::WRITABLE)
}

/// Read once from the descriptor. Returns `Ok(0)` at EOF.
pub(crate) async fn read(fd: &AsyncFd<OwnedFd>, buf: &mut [u8]) -> std::io::Result<usize> {
    loop {
        let mut guard = fd.readable().await?;
        match guard.try_io(|inner| {
            let n = unsafe {
                libc::read(
                    inner.get_ref().as_raw_fd(),
                    buf.as_mut_ptr() as *mut libc::c_void,
                    buf.len(),
                )
            };
            if n < 0 {
                Err(std::io::Error::last_os_error())
            } else {
                Ok(n as usize)
            }
        }) {
            Ok(result) => return result,
            Err(_would_block) => continue,
        }
    }
}

/// Write the whole buffer, looping over short writes.
pub(crate) async fn write_all(fd: &AsyncFd<OwnedFd>, buf: &[u8]) -> std::io::Result<()> {
    let mut written = 0;
    while written < buf.len() {
        let mut guard = fd.writable().await?;
        match guard.try_io(|inner| {
            let n = unsafe {
                libc::write(
                    inner.get_ref().as_raw_fd(),
                    buf[written..].as_ptr() as *const libc::c_void,
                    buf.len() - written,
                )
            };
            if n < 0 {
                Err(std::io::Error::last_os_error())
            } else {
                Ok(n as usize)
            }
        }) {
            Ok(Ok(n)) => written += n,
            Ok(Err(err)) => return Err(err),
            Err(_would_block) => continue,
        }
    }
    Ok(())
}

/// Half-close the write direction, propagating EOF to the peer's reader.
pub(crate) fn shutdown_write(fd: &impl AsRawFd) {
    unsafe {
        libc::shutdown(fd.as_raw_fd(), libc::SHUT_WR);
    }
}

/// Tear down both directions after an I/O error.
pub(crate) fn shutdown_both(fd: &impl AsRawFd) {
    unsafe {
        libc::shutdown(fd.as_raw_fd(), libc::SHUT_RDWR);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nix::sys::socket::{AddressFamily, SockFlag, SockType, socketpair};

    fn pair() -> (OwnedFd, OwnedFd) {
        socketpair(
            AddressFamily::Unix,
            SockType::Stream,
            None,
            SockFlag::empty(),
        )
        .unwrap()
    }

    #[tokio::test]
    async fn test_read_write_roundtrip() {
        let (a, b) = pair();
        let a = async_fd(a).unwrap();
        let b = async_fd(b).unwrap();

        write_all(&a, b"hello").await.unwrap();
        let mut buf = [0u8; 16];
        let n = read(&b, &mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"hello");
    }

    #[tokio::test]
    async fn test_half_close_yields_eof() {
        let (a, b) = pair();
        let a = async_fd(a).unwrap();
        let b = async_fd(b).unwrap();

        write_all(&a, b"tail").await.unwrap();
        shutdown_write(a.get_ref());

        let mut buf = [0u8; 16];
        let n = read(&b, &mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"tail");
        let n = read(&b, &mut buf).await.unwrap();
        assert_eq!(n, 0);
    }
}
