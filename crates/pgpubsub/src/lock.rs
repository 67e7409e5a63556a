//! The Channel Lock: single-consumer arbitration for one channel, backed by
//! the session's own database connection.
//!
//! Deliberately reuses the Session's [`Driver`] handle rather than opening a
//! side connection — session-scoped liveness (a crashed backend's
//! `pg_stat_activity` row disappearing with it) is what makes crash
//! detection automatic, and that only works if the lock's queries run on
//! the same connection whose death we want peers to notice.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use pgpubsub_core::Result;
use tokio::task::JoinHandle;
use tokio::time::Duration;
use tokio_util::sync::CancellationToken;

use crate::driver::Driver;

type ReleaseHook = Box<dyn Fn(String) + Send + Sync>;

/// A single channel's lock handle.
///
/// `acquired` is a local cache of the last-known acquisition result; it is
/// only ever updated by `acquire`/`release`, so reading it never round-trips
/// to the database.
pub struct ChannelLock<D: Driver> {
    channel: String,
    holder_id: String,
    driver: Arc<D>,
    acquired: AtomicBool,
    release_hook: Mutex<Option<ReleaseHook>>,
}

impl<D: Driver> ChannelLock<D> {
    fn new(channel: String, holder_id: String, driver: Arc<D>) -> Self {
        Self { channel, holder_id, driver, acquired: AtomicBool::new(false), release_hook: Mutex::new(None) }
    }

    pub fn channel(&self) -> &str {
        &self.channel
    }

    /// Attempt to become the holder. Idempotent: returns `true` immediately
    /// if already held by this session, without a round-trip.
    pub async fn acquire(&self) -> Result<bool> {
        if self.acquired.load(Ordering::SeqCst) {
            return Ok(true);
        }
        let got = self.driver.lock_try_acquire(&self.channel, &self.holder_id).await?;
        self.acquired.store(got, Ordering::SeqCst);
        Ok(got)
    }

    /// Relinquish the lock if held. No-op otherwise.
    pub async fn release(&self) -> Result<()> {
        if !self.acquired.swap(false, Ordering::SeqCst) {
            return Ok(());
        }
        self.driver.lock_release(&self.channel, &self.holder_id).await
    }

    pub fn is_acquired(&self) -> bool {
        self.acquired.load(Ordering::SeqCst)
    }

    /// Register the callback invoked whenever this channel may newly be
    /// acquirable: a peer's release notification arrived, or this
    /// session's own probe just succeeded. Either way the right reaction is
    /// the same — retry `listen` now. Only one callback is kept;
    /// registering again replaces the previous one.
    pub fn on_release(&self, callback: impl Fn(String) + Send + Sync + 'static) {
        *self.release_hook.lock().unwrap() = Some(Box::new(callback));
    }

    pub(crate) fn fire_release_hook(&self) {
        let hook = self.release_hook.lock().unwrap();
        if let Some(callback) = hook.as_ref() {
            callback(self.channel.clone());
        }
    }

    /// Terminal teardown: release if held.
    pub async fn destroy(&self) -> Result<()> {
        self.release().await
    }
}

/// Owns every [`ChannelLock`] for one Session, plus the periodic probe task
/// that retries acquisition for locks not yet held.
///
/// One registry per Session (not truly process-global): each Session's
/// locks share this session's own connection, so a registry cannot be
/// shared across sessions with distinct connections. `shutdown` is
/// idempotent, matching the "tears down shared global state" contract at
/// the Session scope it actually owns.
pub struct ChannelLockRegistry<D: Driver> {
    driver: Arc<D>,
    holder_id: String,
    acquire_interval: Duration,
    locks: Mutex<std::collections::HashMap<String, Arc<ChannelLock<D>>>>,
    probe_cancel: CancellationToken,
    probe_handle: Mutex<Option<JoinHandle<()>>>,
}

impl<D: Driver> ChannelLockRegistry<D> {
    pub fn new(driver: Arc<D>, holder_id: String, acquire_interval: Duration) -> Arc<Self> {
        Arc::new(Self {
            driver,
            holder_id,
            acquire_interval,
            locks: Mutex::new(std::collections::HashMap::new()),
            probe_cancel: CancellationToken::new(),
            probe_handle: Mutex::new(None),
        })
    }

    /// Idempotent setup of the shared lock bookkeeping table.
    pub async fn init(&self) -> Result<()> {
        self.driver.lock_init().await
    }

    /// Get or create the lock handle for `channel`.
    pub fn lock_for(self: &Arc<Self>, channel: &str) -> Arc<ChannelLock<D>> {
        let mut locks = self.locks.lock().unwrap();
        locks
            .entry(channel.to_string())
            .or_insert_with(|| Arc::new(ChannelLock::new(channel.to_string(), self.holder_id.clone(), self.driver.clone())))
            .clone()
    }

    pub fn lock_if_tracked(&self, channel: &str) -> Option<Arc<ChannelLock<D>>> {
        self.locks.lock().unwrap().get(channel).cloned()
    }

    pub fn forget(&self, channel: &str) {
        self.locks.lock().unwrap().remove(channel);
    }

    /// Called by the router when a lock-protocol notification arrives for
    /// `base_channel`: fires that channel's release hook so the Session can
    /// retry `listen`.
    pub fn on_lock_notification(&self, base_channel: &str) {
        if let Some(lock) = self.locks.lock().unwrap().get(base_channel) {
            lock.fire_release_hook();
        }
    }

    /// Spawn the periodic probe: every `acquire_interval`, retry
    /// acquisition for every tracked lock not currently held, firing its
    /// release hook on success so the Session re-issues `LISTEN`.
    pub fn start_probe(self: &Arc<Self>) {
        let registry = self.clone();
        let cancel = self.probe_cancel.clone();
        let handle = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => return,
                    _ = tokio::time::sleep(registry.acquire_interval) => {}
                }

                let pending: Vec<Arc<ChannelLock<D>>> =
                    registry.locks.lock().unwrap().values().filter(|lock| !lock.is_acquired()).cloned().collect();

                for lock in pending {
                    match lock.acquire().await {
                        Ok(true) => lock.fire_release_hook(),
                        Ok(false) => {}
                        Err(error) => tracing::warn!(channel = lock.channel(), %error, "lock probe failed"),
                    }
                }
            }
        });
        *self.probe_handle.lock().unwrap() = Some(handle);
    }

    /// Terminal teardown: release every held lock, stop the probe task.
    /// Idempotent.
    pub async fn shutdown(&self) {
        self.probe_cancel.cancel();
        if let Some(handle) = self.probe_handle.lock().unwrap().take() {
            handle.abort();
        }

        let locks: Vec<Arc<ChannelLock<D>>> = self.locks.lock().unwrap().values().cloned().collect();
        let releases = locks.iter().map(|lock| lock.release());
        for result in futures::future::join_all(releases).await {
            if let Err(error) = result {
                tracing::warn!(%error, "failed to release lock during shutdown");
            }
        }
        self.locks.lock().unwrap().clear();
    }
}
