//! Guest clock re-alignment.
//!
//! A paused VM's clock stops; even a running guest drifts on long
//! suspensions of the host. The syncer periodically pushes the host clock
//! into the guest over a short-lived agent channel. It starts after boot
//! and pauses and resumes alongside the VM.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use parking_lot::Mutex;
use tokio::task::JoinHandle;
use vessel_shared::{VesselError, VesselResult, vsock::AGENT_PORT};

use super::backend::HypervisorBackend;
use super::instance::AgentFactory;

const SYNC_INTERVAL: Duration = Duration::from_secs(30);

pub(crate) struct TimeSyncer {
    inner: Mutex<Option<SyncerHandle>>,
}

struct SyncerHandle {
    task: JoinHandle<()>,
    paused: Arc<AtomicBool>,
}

impl TimeSyncer {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(None),
        }
    }

    pub fn start(&self, backend: Arc<dyn HypervisorBackend>, agents: Arc<dyn AgentFactory>) {
        let paused = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&paused);

        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(SYNC_INTERVAL);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            // The first tick is immediate; skip it, the clock is fresh at boot.
            ticker.tick().await;
            loop {
                ticker.tick().await;
                if flag.load(Ordering::Relaxed) {
                    continue;
                }
                if let Err(err) = sync_once(&backend, &agents).await {
                    tracing::debug!(error = %err, "guest clock sync failed");
                }
            }
        });

        let mut inner = self.inner.lock();
        if let Some(previous) = inner.replace(SyncerHandle { task, paused }) {
            previous.task.abort();
        }
    }

    pub fn pause(&self) {
        if let Some(handle) = self.inner.lock().as_ref() {
            handle.paused.store(true, Ordering::Relaxed);
        }
    }

    pub fn resume(&self) {
        if let Some(handle) = self.inner.lock().as_ref() {
            handle.paused.store(false, Ordering::Relaxed);
        }
    }

    pub fn stop(&self) {
        if let Some(handle) = self.inner.lock().take() {
            handle.task.abort();
        }
    }
}

async fn sync_once(
    backend: &Arc<dyn HypervisorBackend>,
    agents: &Arc<dyn AgentFactory>,
) -> VesselResult<()> {
    let conn = backend.connect(AGENT_PORT).await?;
    let agent = agents.connect(conn).await?;

    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_err(|err| VesselError::internal_with("host clock before epoch", err))?;
    let result = agent.set_time(now.as_secs() as i64, now.subsec_nanos()).await;
    let _ = agent.close().await;
    result
}
