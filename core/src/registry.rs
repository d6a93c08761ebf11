//! Process-wide session store: live sessions, a bounded window of finished
//! ones, and the TTL sweeper that keeps retention finite.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::Mutex as StdMutex;
use std::sync::Weak;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;
use std::time::Duration;

use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::debug;

use crate::config::DEFAULT_JOB_TTL_MS;
use crate::session::OutputStream;
use crate::session::Session;
use crate::session::SessionStatus;
use crate::session::now_ms;

const SWEEP_INTERVAL: Duration = Duration::from_secs(60);

#[derive(Default)]
struct RegistryInner {
    live: HashMap<String, Arc<Session>>,
    finished: HashMap<String, Arc<Session>>,
}

/// A session is in exactly one of the two sets from `add` until `remove`.
/// The registry is shared state; tools capture one constructed instance, and
/// tests substitute a fresh one per run.
pub struct SessionRegistry {
    inner: Mutex<RegistryInner>,
    job_ttl_ms: AtomicU64,
    sweeper: StdMutex<Option<JoinHandle<()>>>,
}

impl SessionRegistry {
    pub fn new(job_ttl_ms: u64) -> Arc<Self> {
        Arc::new(Self {
            inner: Mutex::new(RegistryInner::default()),
            job_ttl_ms: AtomicU64::new(job_ttl_ms),
            sweeper: StdMutex::new(None),
        })
    }

    pub fn with_default_ttl() -> Arc<Self> {
        Self::new(DEFAULT_JOB_TTL_MS)
    }

    pub async fn add(self: &Arc<Self>, session: Arc<Session>) {
        self.ensure_sweeper();
        let mut inner = self.inner.lock().await;
        // Ids come from a UUID source; a collision is a programmer error.
        debug_assert!(
            !inner.live.contains_key(&session.id) && !inner.finished.contains_key(&session.id),
            "duplicate session id {}",
            session.id
        );
        inner.live.insert(session.id.clone(), session);
    }

    pub async fn get(&self, id: &str) -> Option<Arc<Session>> {
        self.inner.lock().await.live.get(id).cloned()
    }

    pub async fn get_finished(&self, id: &str) -> Option<Arc<Session>> {
        self.inner.lock().await.finished.get(id).cloned()
    }

    pub async fn get_any(&self, id: &str) -> Option<Arc<Session>> {
        let inner = self.inner.lock().await;
        inner.live.get(id).or_else(|| inner.finished.get(id)).cloned()
    }

    /// Cap-enforcing append; returns true when characters were appended.
    pub fn append_output(&self, session: &Session, stream: OutputStream, slice: &str) -> bool {
        session.append_slice(stream, slice)
    }

    /// Atomic consume-and-clear of the pending buffers.
    pub fn drain(&self, session: &Session) -> (String, String) {
        session.drain_pending()
    }

    pub fn mark_backgrounded(&self, session: &Session) -> bool {
        session.mark_backgrounded()
    }

    /// Record terminal state and, on the first call for this session, move
    /// it from the live set to the finished set.
    pub async fn mark_exited(
        &self,
        session: &Arc<Session>,
        exit_code: Option<i32>,
        exit_signal: Option<String>,
        status: SessionStatus,
    ) {
        let first = session.set_exit_record(exit_code, exit_signal, status);
        if !first {
            return;
        }
        let mut inner = self.inner.lock().await;
        inner.live.remove(&session.id);
        inner
            .finished
            .insert(session.id.clone(), Arc::clone(session));
    }

    pub async fn list_running(&self) -> Vec<Arc<Session>> {
        self.inner.lock().await.live.values().cloned().collect()
    }

    pub async fn list_finished(&self) -> Vec<Arc<Session>> {
        self.inner.lock().await.finished.values().cloned().collect()
    }

    /// Remove from either set, releasing any retained transport handles.
    pub async fn remove(&self, id: &str) -> Option<Arc<Session>> {
        let removed = {
            let mut inner = self.inner.lock().await;
            inner
                .live
                .remove(id)
                .or_else(|| inner.finished.remove(id))
        };
        if let Some(session) = &removed {
            session.clear_transport().await;
        }
        removed
    }

    pub fn set_job_ttl_ms(&self, ttl_ms: u64) {
        self.job_ttl_ms.store(ttl_ms, Ordering::SeqCst);
    }

    pub fn job_ttl_ms(&self) -> u64 {
        self.job_ttl_ms.load(Ordering::SeqCst)
    }

    /// Drop finished sessions older than the retention window. Never touches
    /// live sessions. A zero TTL disables sweeping entirely.
    pub async fn prune_finished(&self) {
        let ttl = self.job_ttl_ms();
        if ttl == 0 {
            return;
        }
        let now = now_ms();
        let expired: Vec<Arc<Session>> = {
            let mut inner = self.inner.lock().await;
            let expired_ids: Vec<String> = inner
                .finished
                .iter()
                .filter(|(_, session)| {
                    session
                        .exit_record()
                        .is_some_and(|record| record.ended_at.saturating_add(ttl) < now)
                })
                .map(|(id, _)| id.clone())
                .collect();
            expired_ids
                .iter()
                .filter_map(|id| inner.finished.remove(id))
                .collect()
        };
        for session in &expired {
            session.clear_transport().await;
        }
        if !expired.is_empty() {
            debug!("swept {} finished session(s)", expired.len());
        }
    }

    fn ensure_sweeper(self: &Arc<Self>) {
        let Ok(mut guard) = self.sweeper.lock() else {
            return;
        };
        if guard.is_some() {
            return;
        }
        let weak: Weak<SessionRegistry> = Arc::downgrade(self);
        *guard = Some(tokio::spawn(async move {
            loop {
                tokio::time::sleep(SWEEP_INTERVAL).await;
                let Some(registry) = weak.upgrade() else {
                    break;
                };
                registry.prune_finished().await;
            }
        }));
    }
}

impl Drop for SessionRegistry {
    fn drop(&mut self) {
        if let Ok(mut guard) = self.sweeper.lock()
            && let Some(handle) = guard.take()
        {
            handle.abort();
        }
    }
}
