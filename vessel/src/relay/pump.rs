//! The bidirectional byte pump.
//!
//! One pump is two edge-triggered read sources over a pair of stream
//! descriptors. A source observing EOF shuts down the peer's write
//! direction and finishes; an I/O error shuts down both directions of the
//! peer. The descriptors close only once both sources have finished: each
//! direction holds a shared reference, and the underlying fds drop when the
//! last one does.

use std::any::Any;
use std::os::fd::OwnedFd;
use std::sync::Arc;

use tokio::io::unix::AsyncFd;
use tokio::task::JoinHandle;

use crate::util::fdio;

/// One page per read; short writes loop until drained.
const PUMP_BUFFER_SIZE: usize = 4096;

/// One endpoint of a pump. The guard keeps the owning transport object
/// alive while the dup'd descriptor is in use.
pub(crate) struct PumpEnd {
    pub fd: OwnedFd,
    pub guard: Option<Arc<dyn Any + Send + Sync>>,
}

impl PumpEnd {
    pub fn new(fd: OwnedFd) -> Self {
        Self { fd, guard: None }
    }

    pub fn with_guard(fd: OwnedFd, guard: Arc<dyn Any + Send + Sync>) -> Self {
        Self {
            fd,
            guard: Some(guard),
        }
    }
}

/// Start pumping between two endpoints. The returned task finishes when
/// both directions have observed EOF or an error.
pub(crate) fn spawn_pump(a: PumpEnd, b: PumpEnd) -> JoinHandle<()> {
    tokio::spawn(async move {
        let PumpEnd { fd: fd_a, guard: guard_a } = a;
        let PumpEnd { fd: fd_b, guard: guard_b } = b;

        let fd_a = match fdio::async_fd(fd_a) {
            Ok(fd) => Arc::new(fd),
            Err(err) => {
                tracing::warn!(error = %err, "pump endpoint registration failed");
                return;
            }
        };
        let fd_b = match fdio::async_fd(fd_b) {
            Ok(fd) => Arc::new(fd),
            Err(err) => {
                tracing::warn!(error = %err, "pump endpoint registration failed");
                return;
            }
        };

        tokio::join!(
            pump_direction(Arc::clone(&fd_a), Arc::clone(&fd_b)),
            pump_direction(Arc::clone(&fd_b), Arc::clone(&fd_a)),
        );

        // Transport guards (and with them the fds) drop here, after both
        // read sources have finished.
        drop(guard_a);
        drop(guard_b);
    })
}

async fn pump_direction(src: Arc<AsyncFd<OwnedFd>>, dst: Arc<AsyncFd<OwnedFd>>) {
    let mut buf = [0u8; PUMP_BUFFER_SIZE];
    loop {
        match fdio::read(&src, &mut buf).await {
            Ok(0) => {
                // Peer half-closed; propagate EOF to the other side's
                // reader and finish this source.
                fdio::shutdown_write(dst.get_ref());
                return;
            }
            Ok(n) => {
                if let Err(err) = fdio::write_all(&dst, &buf[..n]).await {
                    tracing::debug!(error = %err, "pump write failed");
                    fdio::shutdown_both(dst.get_ref());
                    return;
                }
            }
            Err(err) => {
                tracing::debug!(error = %err, "pump read failed");
                fdio::shutdown_both(dst.get_ref());
                return;
            }
        }
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
    async fn test_bytes_flow_both_ways() {
        // client <-> (left ... right) <-> server
        let (client, left) = pair();
        let (right, server) = pair();

        let pump = spawn_pump(PumpEnd::new(left), PumpEnd::new(right));

        let client = fdio::async_fd(client).unwrap();
        let server = fdio::async_fd(server).unwrap();

        fdio::write_all(&client, b"ping").await.unwrap();
        let mut buf = [0u8; 8];
        let n = fdio::read(&server, &mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"ping");

        fdio::write_all(&server, b"pong").await.unwrap();
        let n = fdio::read(&client, &mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"pong");

        drop(client);
        drop(server);
        pump.await.unwrap();
    }

    #[tokio::test]
    async fn test_large_transfer_survives_short_writes() {
        let (client, left) = pair();
        let (right, server) = pair();
        let pump = spawn_pump(PumpEnd::new(left), PumpEnd::new(right));

        let client = fdio::async_fd(client).unwrap();
        let server = fdio::async_fd(server).unwrap();

        let payload: Vec<u8> = (0..1024 * 1024).map(|i| (i % 251) as u8).collect();
        let expected = payload.clone();

        let writer = tokio::spawn(async move {
            fdio::write_all(&client, &payload).await.unwrap();
            fdio::shutdown_write(client.get_ref());
            client
        });

        let mut received = Vec::with_capacity(expected.len());
        let mut buf = [0u8; 4096];
        loop {
            let n = fdio::read(&server, &mut buf).await.unwrap();
            if n == 0 {
                break;
            }
            received.extend_from_slice(&buf[..n]);
        }
        assert_eq!(received, expected);

        let client = writer.await.unwrap();
        drop(client);
        drop(server);
        pump.await.unwrap();
    }

    #[tokio::test]
    async fn test_half_close_propagates_eof() {
        let (client, left) = pair();
        let (right, server) = pair();
        let pump = spawn_pump(PumpEnd::new(left), PumpEnd::new(right));

        let client = fdio::async_fd(client).unwrap();
        let server = fdio::async_fd(server).unwrap();

        fdio::write_all(&client, b"last words").await.unwrap();
        fdio::shutdown_write(client.get_ref());

        let mut buf = [0u8; 32];
        let n = fdio::read(&server, &mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"last words");
        let n = fdio::read(&server, &mut buf).await.unwrap();
        assert_eq!(n, 0, "EOF must propagate through the pump");

        // Reverse direction still works after the half-close.
        fdio::write_all(&server, b"ack").await.unwrap();
        let n = fdio::read(&client, &mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"ack");

        fdio::shutdown_write(server.get_ref());
        pump.await.unwrap();
    }

    #[tokio::test]
    async fn test_pump_finishes_when_both_sides_close() {
        let (client, left) = pair();
        let (right, server) = pair();
        let pump = spawn_pump(PumpEnd::new(left), PumpEnd::new(right));

        drop(client);
        drop(server);

        tokio::time::timeout(std::time::Duration::from_secs(5), pump)
            .await
            .expect("pump must finish once both sides are gone")
            .unwrap();
    }
}
