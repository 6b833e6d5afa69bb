//! Relay registry and lifecycle.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use tokio::net::{UnixListener, UnixStream};
use tokio::task::JoinHandle;
use vessel_shared::{VesselError, VesselResult};

use super::config::{RelayDirection, UnixSocketConfiguration};
use super::pump::{PumpEnd, spawn_pump};
use crate::vm::{VirtualMachineInstance, VsockListenerCloser};

/// Keyed registry of active relays for one VM.
///
/// `stop_all` runs during container teardown before kill-all: unix sockets
/// mounted into the guest keep the rootfs busy while their relays live.
pub struct RelayManager {
    vm: Arc<dyn VirtualMachineInstance>,
    relays: tokio::sync::Mutex<HashMap<String, RelayHandle>>,
}

struct RelayHandle {
    config: UnixSocketConfiguration,
    accept_task: JoinHandle<()>,
    teardown: RelayTeardown,
}

enum RelayTeardown {
    /// The relay created the host socket file; unlink it on stop.
    UnlinkSocket(PathBuf),
    /// The relay bound a vsock listener; close it on stop.
    CloseListener(VsockListenerCloser),
}

impl RelayManager {
    pub fn new(vm: Arc<dyn VirtualMachineInstance>) -> Self {
        Self {
            vm,
            relays: tokio::sync::Mutex::new(HashMap::new()),
        }
    }

    /// Start the host side of a relay on `port`. Rejects duplicate ids;
    /// nothing is registered when startup fails.
    pub async fn start(&self, port: u32, config: &UnixSocketConfiguration) -> VesselResult<()> {
        let mut relays = self.relays.lock().await;
        if relays.contains_key(&config.id) {
            return Err(VesselError::Exists(format!(
                "relay {} already registered",
                config.id
            )));
        }

        let handle = match config.direction {
            RelayDirection::IntoGuest => self.start_into_guest(port, config)?,
            RelayDirection::OutOfGuest => self.start_out_of_guest(port, config).await?,
        };

        tracing::info!(
            relay_id = %config.id,
            port,
            direction = ?config.direction,
            "relay started"
        );
        relays.insert(config.id.clone(), handle);
        Ok(())
    }

    /// Host listens on its unix socket; every accepted connection dials
    /// the guest port and gets its own pump.
    fn start_into_guest(
        &self,
        port: u32,
        config: &UnixSocketConfiguration,
    ) -> VesselResult<RelayHandle> {
        let path = config.host_path().to_path_buf();

        // A stale socket file from a previous run blocks the bind.
        if path.exists() {
            std::fs::remove_file(&path).map_err(|err| {
                VesselError::internal_with(
                    format!("cannot unlink stale socket {}", path.display()),
                    err,
                )
            })?;
        }

        let listener = UnixListener::bind(&path).map_err(|err| {
            VesselError::internal_with(format!("cannot bind {}", path.display()), err)
        })?;

        let vm = Arc::clone(&self.vm);
        let relay_id = config.id.clone();
        let accept_task = tokio::spawn(async move {
            loop {
                let (stream, _) = match listener.accept().await {
                    Ok(accepted) => accepted,
                    Err(err) => {
                        tracing::warn!(relay_id = %relay_id, error = %err, "relay accept loop finished");
                        break;
                    }
                };

                let conn = match vm.dial(port).await {
                    Ok(conn) => conn,
                    Err(err) => {
                        // One failed dial drops one client, not the relay.
                        tracing::warn!(relay_id = %relay_id, error = %err, "guest dial failed");
                        continue;
                    }
                };

                match unix_stream_end(stream) {
                    Ok(host_end) => {
                        spawn_pump(host_end, vsock_end(conn));
                    }
                    Err(err) => {
                        tracing::warn!(relay_id = %relay_id, error = %err, "client socket unusable");
                    }
                }
            }
        });

        Ok(RelayHandle {
            config: config.clone(),
            accept_task,
            teardown: RelayTeardown::UnlinkSocket(path),
        })
    }

    /// Host binds a vsock listener; every guest-originated connection
    /// dials the local unix service and gets its own pump.
    async fn start_out_of_guest(
        &self,
        port: u32,
        config: &UnixSocketConfiguration,
    ) -> VesselResult<RelayHandle> {
        let mut listener = self.vm.listen(port).await?;
        let closer = listener.closer();
        let host_path = config.host_path().to_path_buf();
        let relay_id = config.id.clone();

        let accept_task = tokio::spawn(async move {
            loop {
                let conn = match listener.accept().await {
                    Ok(Some(conn)) => conn,
                    Ok(None) => break,
                    Err(err) => {
                        tracing::warn!(relay_id = %relay_id, error = %err, "vsock accept loop finished");
                        break;
                    }
                };

                let stream = match UnixStream::connect(&host_path).await {
                    Ok(stream) => stream,
                    Err(err) => {
                        tracing::warn!(
                            relay_id = %relay_id,
                            path = %host_path.display(),
                            error = %err,
                            "host service dial failed"
                        );
                        continue;
                    }
                };

                match unix_stream_end(stream) {
                    Ok(host_end) => {
                        spawn_pump(vsock_end(conn), host_end);
                    }
                    Err(err) => {
                        tracing::warn!(relay_id = %relay_id, error = %err, "host socket unusable");
                    }
                }
            }
        });

        Ok(RelayHandle {
            config: config.clone(),
            accept_task,
            teardown: RelayTeardown::CloseListener(closer),
        })
    }

    /// Stop one relay. Calling stop before start is an error.
    pub async fn stop(&self, config: &UnixSocketConfiguration) -> VesselResult<()> {
        let handle = self
            .relays
            .lock()
            .await
            .remove(&config.id)
            .ok_or_else(|| {
                VesselError::InvalidState(format!("relay {} is not started", config.id))
            })?;
        stop_handle(handle).await;
        Ok(())
    }

    /// Stop every relay, best-effort.
    pub async fn stop_all(&self) {
        let handles: Vec<RelayHandle> = {
            let mut relays = self.relays.lock().await;
            relays.drain().map(|(_, handle)| handle).collect()
        };
        for handle in handles {
            stop_handle(handle).await;
        }
    }

    /// Configurations of the currently registered relays.
    pub async fn configs(&self) -> Vec<UnixSocketConfiguration> {
        self.relays
            .lock()
            .await
            .values()
            .map(|handle| handle.config.clone())
            .collect()
    }
}

async fn stop_handle(handle: RelayHandle) {
    handle.accept_task.abort();
    match handle.teardown {
        RelayTeardown::UnlinkSocket(path) => {
            if let Err(err) = std::fs::remove_file(&path) {
                if err.kind() != std::io::ErrorKind::NotFound {
                    tracing::warn!(path = %path.display(), error = %err, "socket unlink failed");
                }
            }
        }
        RelayTeardown::CloseListener(closer) => {
            if let Err(err) = closer.close().await {
                tracing::warn!(error = %err, "vsock listener close failed");
            }
        }
    }
    tracing::debug!(relay_id = %handle.config.id, "relay stopped");
}

fn unix_stream_end(stream: UnixStream) -> std::io::Result<PumpEnd> {
    let std_stream = stream.into_std()?;
    Ok(PumpEnd::new(std_stream.into()))
}

fn vsock_end(conn: crate::vm::VsockConnection) -> PumpEnd {
    let (fd, guard) = conn.into_parts();
    match guard {
        Some(guard) => PumpEnd::with_guard(fd, guard),
        None => PumpEnd::new(fd),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{MockAgent, loopback_vm, new_event_log};
    use crate::util::fdio;
    use std::os::fd::OwnedFd;
    use std::time::Duration;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    const TEST_PORT: u32 = 0x2000_0000;

    async fn relay_harness() -> (
        Arc<dyn VirtualMachineInstance>,
        Arc<crate::test_support::LoopbackBackend>,
        RelayManager,
    ) {
        let log = new_event_log();
        let agent = MockAgent::new(log.clone());
        let (vm, backend) = loopback_vm(&log, &agent);
        vm.start().await.unwrap();
        let manager = RelayManager::new(Arc::clone(&vm));
        (vm, backend, manager)
    }

    /// Poll for the guest-side peer of a host dial; the dial happens on the
    /// relay's accept task, slightly after the client connects.
    async fn wait_for_dialed(
        backend: &crate::test_support::LoopbackBackend,
        port: u32,
    ) -> OwnedFd {
        let deadline = std::time::Instant::now() + Duration::from_secs(5);
        loop {
            if let Some(fd) = backend.take_dialed(port) {
                return fd;
            }
            assert!(
                std::time::Instant::now() < deadline,
                "relay never dialed the guest"
            );
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }

    #[tokio::test]
    async fn test_into_guest_relay_carries_bytes_and_eof() {
        let (_vm, backend, manager) = relay_harness().await;
        let dir = tempfile::tempdir().unwrap();
        let sock_path = dir.path().join("svc.sock");
        let config =
            UnixSocketConfiguration::into_guest("r1", &sock_path, "/var/run/svc.sock");

        manager.start(TEST_PORT, &config).await.unwrap();
        assert!(sock_path.exists(), "relay must create the host socket");

        let mut client = UnixStream::connect(&sock_path).await.unwrap();
        let guest_fd = fdio::async_fd(wait_for_dialed(&backend, TEST_PORT).await).unwrap();

        // Host -> guest, a payload far bigger than one pump buffer.
        let payload: Vec<u8> = (0..256 * 1024).map(|i| (i % 239) as u8) .collect();
        let expected = payload.clone();
        let writer = tokio::spawn(async move {
            client.write_all(&payload).await.unwrap();
            client.shutdown().await.unwrap();
        });

        let mut received = Vec::new();
        let mut buf = [0u8; 4096];
        loop {
            let n = fdio::read(&guest_fd, &mut buf).await.unwrap();
            if n == 0 {
                break;
            }
            received.extend_from_slice(&buf[..n]);
        }
        assert_eq!(received, expected);
        writer.await.unwrap();

        manager.stop(&config).await.unwrap();
        assert!(!sock_path.exists(), "stop must unlink the host socket");
    }

    #[tokio::test]
    async fn test_into_guest_unlinks_stale_socket() {
        let (_vm, _backend, manager) = relay_harness().await;
        let dir = tempfile::tempdir().unwrap();
        let sock_path = dir.path().join("svc.sock");
        std::fs::write(&sock_path, b"stale").unwrap();

        let config =
            UnixSocketConfiguration::into_guest("r1", &sock_path, "/var/run/svc.sock");
        manager.start(TEST_PORT, &config).await.unwrap();

        let client = UnixStream::connect(&sock_path).await;
        assert!(client.is_ok(), "fresh socket must accept connections");
        manager.stop_all().await;
    }

    #[tokio::test]
    async fn test_out_of_guest_relay_dials_host_service() {
        let (_vm, backend, manager) = relay_harness().await;
        let dir = tempfile::tempdir().unwrap();
        let service_path = dir.path().join("host-svc.sock");
        let service = UnixListener::bind(&service_path).unwrap();

        let config = UnixSocketConfiguration::out_of_guest(
            "r2",
            "/run/guest-svc.sock",
            &service_path,
        );
        manager.start(TEST_PORT, &config).await.unwrap();

        // Guest-originated connection through the vsock listener.
        let guest_fd = fdio::async_fd(backend.guest_connect(TEST_PORT).unwrap()).unwrap();
        fdio::write_all(&guest_fd, b"from the guest").await.unwrap();

        let (mut server_conn, _) = service.accept().await.unwrap();
        let mut buf = [0u8; 32];
        let n = server_conn.read(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"from the guest");

        // Reply path.
        server_conn.write_all(b"ack").await.unwrap();
        let n = fdio::read(&guest_fd, &mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"ack");

        manager.stop(&config).await.unwrap();
    }

    #[tokio::test]
    async fn test_duplicate_relay_id_rejected() {
        let (_vm, _backend, manager) = relay_harness().await;
        let dir = tempfile::tempdir().unwrap();
        let config = UnixSocketConfiguration::into_guest(
            "r1",
            dir.path().join("a.sock"),
            "/var/run/a.sock",
        );
        manager.start(TEST_PORT, &config).await.unwrap();

        let other = UnixSocketConfiguration::into_guest(
            "r1",
            dir.path().join("b.sock"),
            "/var/run/b.sock",
        );
        let err = manager.start(TEST_PORT + 1, &other).await.unwrap_err();
        assert_eq!(err.kind(), "exists");
        manager.stop_all().await;
    }

    #[tokio::test]
    async fn test_stop_before_start_is_invalid_state() {
        let (_vm, _backend, manager) = relay_harness().await;
        let config =
            UnixSocketConfiguration::into_guest("ghost", "/tmp/ghost.sock", "/var/run/g.sock");
        let err = manager.stop(&config).await.unwrap_err();
        assert_eq!(err.kind(), "invalid_state");
    }

    #[tokio::test]
    async fn test_stop_all_clears_registry() {
        let (_vm, _backend, manager) = relay_harness().await;
        let dir = tempfile::tempdir().unwrap();
        for (i, name) in ["a", "b"].iter().enumerate() {
            let config = UnixSocketConfiguration::into_guest(
                *name,
                dir.path().join(format!("{name}.sock")),
                format!("/var/run/{name}.sock"),
            );
            manager.start(TEST_PORT + i as u32, &config).await.unwrap();
        }
        assert_eq!(manager.configs().await.len(), 2);

        manager.stop_all().await;
        assert!(manager.configs().await.is_empty());
        assert!(!dir.path().join("a.sock").exists());
        assert!(!dir.path().join("b.sock").exists());
    }
}
