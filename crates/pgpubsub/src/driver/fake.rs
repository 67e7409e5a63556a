//! An in-process [`Driver`] used by tests.
//!
//! Models just enough of PostgreSQL's `LISTEN`/`NOTIFY` and
//! `pg_stat_activity` semantics for the Session and Channel Lock to be
//! tested without a live database: a shared broker keeps per-channel
//! subscriber lists and the lock table, keyed by a "connection string" so
//! that multiple `FakeDriver::connect` calls with the same conninfo behave
//! like multiple sessions against the same database.

use std::collections::HashMap;
use std::pin::Pin;
use std::sync::{Arc, Mutex, OnceLock};
use std::task::{Context, Poll};

use futures::Stream;
use pgpubsub_core::error::{Error, Result};
use pgpubsub_core::ident::lock_channel_name;
use tokio::sync::mpsc;

use super::{Driver, DriverEvent, Notification};

type Registry = Mutex<HashMap<String, FakeBroker>>;

fn registry() -> &'static Registry {
    static REGISTRY: OnceLock<Registry> = OnceLock::new();
    REGISTRY.get_or_init(|| Mutex::new(HashMap::new()))
}

/// Look up (creating if absent) the shared broker for a conninfo string.
/// Tests that want a private, unshared database should use a unique
/// conninfo per test (e.g. `format!("fake://{test_name}")`).
pub fn broker_for(conninfo: &str) -> FakeBroker {
    registry().lock().unwrap().entry(conninfo.to_string()).or_default().clone()
}

#[derive(Default)]
struct BrokerState {
    /// channel -> subscribed sessions (holder_id, inbox).
    subscribers: HashMap<String, Vec<(String, mpsc::UnboundedSender<DriverEvent>)>>,
    /// channel -> current lock holder.
    locks: HashMap<String, String>,
    /// holder_ids currently considered live (present in `pg_stat_activity`).
    live: std::collections::HashSet<String>,
    /// holder_id -> that connection's own inbox, for simulating a dropped
    /// connection independently of channel subscriptions.
    inboxes: HashMap<String, mpsc::UnboundedSender<DriverEvent>>,
    /// When true, `FakeDriver::connect` fails, simulating a database that
    /// cannot be reached.
    unreachable: bool,
}

/// A shared fake database: channel subscriptions, the lock table, and
/// backend liveness, all in memory.
#[derive(Clone, Default)]
pub struct FakeBroker(Arc<Mutex<BrokerState>>);

impl FakeBroker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Simulate a crashed backend: its application_name stops appearing in
    /// `pg_stat_activity`, which is what lets a peer reclaim its locks.
    pub fn mark_dead(&self, holder_id: &str) {
        self.0.lock().unwrap().live.remove(holder_id);
    }

    /// Make subsequent `FakeDriver::connect` calls against this broker fail,
    /// simulating an unreachable database.
    pub fn set_unreachable(&self, unreachable: bool) {
        self.0.lock().unwrap().unreachable = unreachable;
    }

    /// Simulate this connection ending, independent of whether it is
    /// currently `LISTEN`ing on anything.
    pub fn disconnect(&self, holder_id: &str) {
        if let Some(tx) = self.0.lock().unwrap().inboxes.get(holder_id) {
            let _ = tx.send(DriverEvent::End);
        }
    }

    /// Inject a raw `(channel, payload)` notification as if some session had
    /// issued `NOTIFY` directly, bypassing `pack` and the Session API. Used
    /// to test lock-channel filtering and malformed-payload handling.
    pub fn raw_notify(&self, channel: &str, payload: &str) {
        self.deliver(channel, payload);
    }

    fn deliver(&self, channel: &str, payload: &str) {
        let state = self.0.lock().unwrap();
        if let Some(subs) = state.subscribers.get(channel) {
            for (_, tx) in subs {
                let _ = tx.send(DriverEvent::Notification(Notification {
                    channel: channel.to_string(),
                    payload: payload.to_string(),
                }));
            }
        }
    }
}

pub struct FakeDriver {
    broker: FakeBroker,
    holder_id: String,
    inbox: mpsc::UnboundedSender<DriverEvent>,
}

pub struct FakeNotificationStream {
    rx: mpsc::UnboundedReceiver<DriverEvent>,
}

impl Stream for FakeNotificationStream {
    type Item = DriverEvent;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.rx.poll_recv(cx)
    }
}

impl Driver for FakeDriver {
    type Stream = FakeNotificationStream;

    async fn connect(conninfo: &str, application_name: &str) -> Result<(Self, Self::Stream)> {
        let broker = broker_for(conninfo);

        let (tx, rx) = mpsc::unbounded_channel();
        {
            let mut state = broker.0.lock().unwrap();
            if state.unreachable {
                return Err(Error::Connect("fake broker is unreachable".to_string()));
            }
            state.live.insert(application_name.to_string());
            state.inboxes.insert(application_name.to_string(), tx.clone());
        }

        Ok((
            Self { broker, holder_id: application_name.to_string(), inbox: tx },
            FakeNotificationStream { rx },
        ))
    }

    async fn listen(&self, channel: &str) -> Result<()> {
        let mut state = self.broker.0.lock().unwrap();
        let subs = state.subscribers.entry(channel.to_string()).or_default();
        if !subs.iter().any(|(id, _)| id == &self.holder_id) {
            subs.push((self.holder_id.clone(), self.inbox.clone()));
        }
        Ok(())
    }

    async fn unlisten(&self, channel: &str) -> Result<()> {
        let mut state = self.broker.0.lock().unwrap();
        if let Some(subs) = state.subscribers.get_mut(channel) {
            subs.retain(|(id, _)| id != &self.holder_id);
        }
        Ok(())
    }

    async fn unlisten_all(&self) -> Result<()> {
        let mut state = self.broker.0.lock().unwrap();
        for subs in state.subscribers.values_mut() {
            subs.retain(|(id, _)| id != &self.holder_id);
        }
        Ok(())
    }

    async fn notify(&self, channel: &str, payload: &str) -> Result<()> {
        self.broker.deliver(channel, payload);
        Ok(())
    }

    async fn lock_init(&self) -> Result<()> {
        Ok(())
    }

    async fn lock_try_acquire(&self, channel: &str, holder_id: &str) -> Result<bool> {
        let mut state = self.broker.0.lock().unwrap();
        let can_claim = match state.locks.get(channel) {
            None => true,
            Some(current) if current == holder_id => true,
            Some(current) => !state.live.contains(current),
        };
        if can_claim {
            state.locks.insert(channel.to_string(), holder_id.to_string());
        }
        Ok(can_claim)
    }

    async fn lock_release(&self, channel: &str, holder_id: &str) -> Result<()> {
        let released = {
            let mut state = self.broker.0.lock().unwrap();
            if state.locks.get(channel).map(String::as_str) == Some(holder_id) {
                state.locks.remove(channel);
                true
            } else {
                false
            }
        };
        if released {
            self.broker.deliver(&lock_channel_name(channel), "released");
        }
        Ok(())
    }
}
