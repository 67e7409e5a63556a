//! The Pub/Sub Session: owns the connection, the tracked-channel set, the
//! per-channel Channel Locks, and the reconnect state machine.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex, RwLock};

use futures::StreamExt;
use pgpubsub_core::ident::{is_reserved_channel, lock_channel_name};
use pgpubsub_core::{pack, Error, PubSubOptions, Result};
use serde_json::Value;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::driver::{Driver, DriverEvent, Notification};
use crate::event::Event;
use crate::lock::ChannelLockRegistry;
use crate::router::{route, RouterAction};

const CHANNEL_CAPACITY: usize = 256;

/// The reconnect state machine driving one Session's connection lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconnectState {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
    Failed,
}

/// A Pub/Sub Session generic over its [`Driver`].
///
/// Cheaply cloneable: clones share the same underlying connection and
/// state (it's a thin handle over an `Arc`).
#[derive(Clone)]
pub struct PubSubSession<D: Driver> {
    inner: Arc<SessionInner<D>>,
}

struct SessionInner<D: Driver> {
    options: PubSubOptions,
    holder_id: String,
    conninfo: String,

    driver: RwLock<Option<Arc<D>>>,
    registry: RwLock<Option<Arc<ChannelLockRegistry<D>>>>,
    tracked: Mutex<HashSet<String>>,

    events_tx: broadcast::Sender<Event>,
    channel_txs: Mutex<HashMap<String, broadcast::Sender<Value>>>,

    state: Mutex<ReconnectState>,
    retry: AtomicU32,
    armed: AtomicBool,
    reconnect_cancel: CancellationToken,
    poller_cancel: Mutex<CancellationToken>,
    poller_handle: Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl<D: Driver> PubSubSession<D> {
    pub fn new(options: PubSubOptions) -> Self {
        let holder_id = Uuid::new_v4().to_string();
        let conninfo = options.connection.to_conn_string();
        let (events_tx, _) = broadcast::channel(CHANNEL_CAPACITY);

        Self {
            inner: Arc::new(SessionInner {
                options,
                holder_id,
                conninfo,
                driver: RwLock::new(None),
                registry: RwLock::new(None),
                tracked: Mutex::new(HashSet::new()),
                events_tx,
                channel_txs: Mutex::new(HashMap::new()),
                state: Mutex::new(ReconnectState::Disconnected),
                retry: AtomicU32::new(0),
                armed: AtomicBool::new(false),
                reconnect_cancel: CancellationToken::new(),
                poller_cancel: Mutex::new(CancellationToken::new()),
                poller_handle: Mutex::new(None),
            }),
        }
    }

    pub fn state(&self) -> ReconnectState {
        *self.inner.state.lock().unwrap()
    }

    /// This session's unique identifier, sent as `application_name` on
    /// connect. Peers use it to recognize this session's lock rows in
    /// `pg_stat_activity`.
    pub fn holder_id(&self) -> &str {
        &self.inner.holder_id
    }

    pub async fn connect(&self) -> Result<()> {
        self.inner.do_connect().await?;
        self.inner.retry.store(0, Ordering::SeqCst);
        self.inner.armed.store(true, Ordering::SeqCst);
        self.inner.emit(Event::Connect);
        Ok(())
    }

    pub async fn close(&self) -> Result<()> {
        self.inner.close_internal().await;
        Ok(())
    }

    pub async fn destroy(&self) -> Result<()> {
        let registry = self.inner.registry.write().unwrap().take();
        match registry {
            Some(registry) => {
                tokio::join!(registry.shutdown(), self.inner.close_internal());
            }
            None => self.inner.close_internal().await,
        }
        self.inner.tracked.lock().unwrap().clear();
        self.inner.channel_txs.lock().unwrap().clear();
        Ok(())
    }

    pub async fn listen(&self, channel: &str) -> Result<()> {
        self.inner.do_listen(channel).await
    }

    pub async fn unlisten(&self, channel: &str) -> Result<()> {
        self.inner.do_unlisten(channel).await
    }

    pub async fn unlisten_all(&self) -> Result<()> {
        self.inner.do_unlisten_all().await
    }

    pub async fn notify(&self, channel: &str, payload: &Value) -> Result<()> {
        self.inner.do_notify(channel, payload).await
    }

    pub fn active_channels(&self) -> Vec<String> {
        self.inner.active_channels()
    }

    pub fn inactive_channels(&self) -> Vec<String> {
        self.inner.inactive_channels()
    }

    pub fn all_channels(&self) -> Vec<String> {
        self.inner.tracked.lock().unwrap().iter().cloned().collect()
    }

    pub fn events(&self) -> broadcast::Receiver<Event> {
        self.inner.events_tx.subscribe()
    }

    pub fn channel(&self, name: &str) -> broadcast::Receiver<Value> {
        let mut txs = self.inner.channel_txs.lock().unwrap();
        txs.entry(name.to_string()).or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0).subscribe()
    }
}

impl<D: Driver> SessionInner<D> {
    fn emit(&self, event: Event) {
        let _ = self.events_tx.send(event);
    }

    fn emit_channel(&self, channel: &str, payload: Value) {
        if let Some(tx) = self.channel_txs.lock().unwrap().get(channel) {
            let _ = tx.send(payload);
        }
    }

    fn driver(&self) -> Result<Arc<D>> {
        self.driver.read().unwrap().clone().ok_or(Error::Closed)
    }

    fn active_channels(&self) -> Vec<String> {
        let tracked = self.tracked.lock().unwrap();
        if !self.options.single_listener {
            return tracked.iter().cloned().collect();
        }
        let registry = self.registry.read().unwrap().clone();
        tracked
            .iter()
            .filter(|channel| {
                registry.as_ref().and_then(|r| r.lock_if_tracked(channel)).map(|lock| lock.is_acquired()).unwrap_or(false)
            })
            .cloned()
            .collect()
    }

    fn inactive_channels(&self) -> Vec<String> {
        let active: HashSet<String> = self.active_channels().into_iter().collect();
        self.tracked.lock().unwrap().iter().filter(|channel| !active.contains(*channel)).cloned().collect()
    }

    async fn do_connect(self: &Arc<Self>) -> Result<()> {
        *self.state.lock().unwrap() = ReconnectState::Connecting;

        let (driver, stream) = match D::connect(&self.conninfo, &self.holder_id).await {
            Ok(pair) => pair,
            Err(error) => {
                *self.state.lock().unwrap() = ReconnectState::Disconnected;
                return Err(error);
            }
        };
        let driver = Arc::new(driver);
        *self.driver.write().unwrap() = Some(driver.clone());

        if self.options.single_listener {
            let registry = ChannelLockRegistry::new(driver.clone(), self.holder_id.clone(), self.options.acquire_interval());
            registry.init().await?;
            registry.start_probe();
            *self.registry.write().unwrap() = Some(registry);
        }

        let poller_cancel = CancellationToken::new();
        *self.poller_cancel.lock().unwrap() = poller_cancel.clone();
        let handle = tokio::spawn(run_poller(self.clone(), stream, poller_cancel));
        *self.poller_handle.lock().unwrap() = Some(handle);

        *self.state.lock().unwrap() = ReconnectState::Connected;
        tracing::info!(holder_id = %self.holder_id, "connected");
        Ok(())
    }

    async fn handle_notification(self: &Arc<Self>, notification: Notification) {
        let registry = self.registry.read().unwrap().clone();
        let action = route(&notification.channel, &notification.payload, self.options.single_listener, |channel| {
            registry.as_ref().and_then(|r| r.lock_if_tracked(channel)).map(|lock| lock.is_acquired()).unwrap_or(false)
        });

        match action {
            RouterAction::LockProtocol { base_channel } => {
                if let Some(registry) = registry {
                    registry.on_lock_notification(&base_channel);
                }
            }
            RouterAction::Dropped => {
                tracing::debug!(channel = %notification.channel, "dropped: not the active consumer");
            }
            RouterAction::Message { channel, payload } => {
                self.emit(Event::Message(channel.clone(), payload.clone()));
                self.emit_channel(&channel, payload);
            }
            RouterAction::DecodeError { channel, error } => {
                tracing::warn!(%channel, %error, "failed to decode notification payload");
                self.emit(Event::Error(Arc::new(error)));
            }
        }
    }

    async fn handle_connection_end(self: &Arc<Self>) {
        self.emit(Event::End);
        self.teardown_connection().await;
        self.maybe_schedule_reconnect();
    }

    async fn handle_connection_error(self: &Arc<Self>, message: String) {
        tracing::warn!(%message, "connection error");
        self.emit(Event::Error(Arc::new(Error::Connect(message))));
        self.teardown_connection().await;
        self.maybe_schedule_reconnect();
    }

    /// Drop the driver and registry for a connection that has ended. Locks
    /// are released best-effort (the connection they rode on may already be
    /// gone); tracked channel names are preserved so a reconnect can
    /// re-`listen` them.
    async fn teardown_connection(self: &Arc<Self>) {
        *self.driver.write().unwrap() = None;
        if let Some(registry) = self.registry.write().unwrap().take() {
            registry.shutdown().await;
        }
    }

    fn maybe_schedule_reconnect(self: &Arc<Self>) {
        if self.armed.load(Ordering::SeqCst) {
            self.clone().schedule_reconnect();
        } else {
            *self.state.lock().unwrap() = ReconnectState::Disconnected;
        }
    }

    fn schedule_reconnect(self: Arc<Self>) {
        *self.state.lock().unwrap() = ReconnectState::Reconnecting;
        let cancel = self.reconnect_cancel.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = tokio::time::sleep(self.options.retry_delay()) => {}
            }
            if !self.armed.load(Ordering::SeqCst) {
                return;
            }

            let retry = self.retry.fetch_add(1, Ordering::SeqCst) + 1;
            if retry >= self.options.retry_limit {
                *self.state.lock().unwrap() = ReconnectState::Failed;
                self.emit(Event::Error(Arc::new(Error::RetryExhausted(retry))));
                self.close_internal().await;
                return;
            }

            match self.do_connect().await {
                Ok(()) => self.clone().post_reconnect_hook(retry).await,
                Err(error) => {
                    tracing::warn!(%error, attempt = retry, "reconnect attempt failed");
                    self.schedule_reconnect();
                }
            }
        });
    }

    async fn post_reconnect_hook(self: Arc<Self>, retry: u32) {
        let channels: Vec<String> = self.tracked.lock().unwrap().iter().cloned().collect();
        let relistens = channels.into_iter().map(|channel| {
            let this = self.clone();
            async move {
                if let Err(error) = this.do_listen(&channel).await {
                    tracing::warn!(%channel, %error, "failed to re-listen after reconnect");
                }
            }
        });
        futures::future::join_all(relistens).await;

        self.emit(Event::Reconnect(retry));
        self.retry.store(0, Ordering::SeqCst);
    }

    /// Ends the connection: disarms auto-reconnect, stops the background
    /// poller, drops the driver handle. Does not touch the Channel Lock
    /// registry — locks survive `close()` and are re-acquired on the next
    /// `connect()`/reconnect. Callers that do need the registry torn down
    /// (`destroy()`, and the disconnect/error path via
    /// `teardown_connection`) take care of that themselves.
    async fn close_internal(self: &Arc<Self>) {
        self.armed.store(false, Ordering::SeqCst);
        self.reconnect_cancel.cancel();
        self.poller_cancel.lock().unwrap().cancel();
        if let Some(handle) = self.poller_handle.lock().unwrap().take() {
            handle.abort();
        }
        *self.driver.write().unwrap() = None;

        // Failed is terminal and more informative than Disconnected for a
        // session that gave up after exhausting its retry budget; don't
        // paper over it.
        let mut state = self.state.lock().unwrap();
        if *state != ReconnectState::Failed {
            *state = ReconnectState::Disconnected;
        }
        drop(state);
        self.emit(Event::Close);
        tracing::info!(holder_id = %self.holder_id, "closed");
    }

    async fn do_listen(self: &Arc<Self>, channel: &str) -> Result<()> {
        if is_reserved_channel(channel) {
            return Err(Error::ReservedChannel(channel.to_string()));
        }
        let driver = self.driver()?;
        self.tracked.lock().unwrap().insert(channel.to_string());

        if self.options.single_listener {
            let registry = self.registry.read().unwrap().clone().ok_or(Error::Closed)?;
            let is_new = registry.lock_if_tracked(channel).is_none();
            let lock = registry.lock_for(channel);

            if is_new {
                // Subscribe to the derived lock sub-channel so a peer's
                // release notification reaches this session immediately,
                // rather than waiting for the next probe tick. The router
                // never surfaces this traffic as application events.
                driver.listen(&lock_channel_name(channel)).await?;

                let weak = Arc::downgrade(self);
                let owned_channel = channel.to_string();
                lock.on_release(move |_| {
                    if let Some(inner) = weak.upgrade() {
                        let channel = owned_channel.clone();
                        tokio::spawn(async move {
                            if let Err(error) = inner.do_listen(&channel).await {
                                tracing::warn!(%channel, %error, "failed to re-listen after lock release");
                            }
                        });
                    }
                });
            }

            if lock.acquire().await? {
                driver.listen(channel).await?;
                self.emit(Event::Listen(channel.to_string()));
            }
        } else {
            driver.listen(channel).await?;
            self.emit(Event::Listen(channel.to_string()));
        }
        Ok(())
    }

    async fn do_unlisten(self: &Arc<Self>, channel: &str) -> Result<()> {
        if is_reserved_channel(channel) {
            return Err(Error::ReservedChannel(channel.to_string()));
        }
        let driver = self.driver()?;
        driver.unlisten(channel).await?;

        if self.options.single_listener {
            if let Some(registry) = self.registry.read().unwrap().clone() {
                if let Some(lock) = registry.lock_if_tracked(channel) {
                    lock.release().await?;
                    driver.unlisten(&lock_channel_name(channel)).await?;
                }
                registry.forget(channel);
            }
        }

        self.tracked.lock().unwrap().remove(channel);
        self.emit(Event::Unlisten(vec![channel.to_string()]));
        Ok(())
    }

    async fn do_unlisten_all(self: &Arc<Self>) -> Result<()> {
        let driver = self.driver()?;
        let channels: Vec<String> = self.tracked.lock().unwrap().iter().cloned().collect();
        driver.unlisten_all().await?;

        if self.options.single_listener {
            if let Some(registry) = self.registry.read().unwrap().clone() {
                for channel in &channels {
                    if let Some(lock) = registry.lock_if_tracked(channel) {
                        lock.release().await?;
                    }
                    registry.forget(channel);
                }
            }
        }

        self.tracked.lock().unwrap().clear();
        self.emit(Event::Unlisten(channels));
        Ok(())
    }

    async fn do_notify(&self, channel: &str, payload: &Value) -> Result<()> {
        if is_reserved_channel(channel) {
            return Err(Error::ReservedChannel(channel.to_string()));
        }
        let driver = self.driver()?;
        let wire = match pack(payload) {
            Ok(wire) => wire,
            Err(error) => {
                tracing::error!(%channel, %error, "failed to encode notify payload; publishing empty string");
                String::new()
            }
        };
        driver.notify(channel, &wire).await
    }
}

async fn run_poller<D: Driver>(inner: Arc<SessionInner<D>>, mut stream: D::Stream, cancel: CancellationToken) {
    loop {
        tokio::select! {
            _ = cancel.cancelled() => return,
            next = stream.next() => match next {
                Some(DriverEvent::Notification(notification)) => inner.handle_notification(notification).await,
                Some(DriverEvent::End) | None => {
                    inner.handle_connection_end().await;
                    return;
                }
                Some(DriverEvent::Error(message)) => {
                    inner.handle_connection_error(message).await;
                    return;
                }
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::driver::fake::FakeDriver;

    #[test]
    fn new_session_starts_disconnected_with_no_tracked_channels() {
        let session = PubSubSession::<FakeDriver>::new(PubSubOptions::default());
        assert_eq!(session.state(), ReconnectState::Disconnected);
        assert!(session.all_channels().is_empty());
    }
}
