//! The connection primitive the rest of the crate is built on.
//!
//! `Driver` is the seam between the Session/Channel Lock and the actual
//! database connection. The production implementation, [`TokioPgDriver`],
//! is a thin wrapper over `tokio_postgres`; [`fake::FakeDriver`] (gated
//! behind `cfg(test)` or the `test-util` feature) is an in-process
//! stand-in used by the test suite so that reconnect and lock-arbitration
//! scenarios don't require a live database.
//!
//! The trait is deliberately narrow: every method maps to exactly one SQL
//! statement the Channel Lock or Session issues (`LISTEN`, `NOTIFY`, the
//! lock table upsert, ...), rather than exposing a generic `execute(sql)`
//! escape hatch. That keeps the fake driver a plain in-memory model instead
//! of a miniature SQL engine.

use std::future::Future;

use futures::Stream;
use pgpubsub_core::Result;

/// A single decoded `(channel, payload)` notification.
#[derive(Debug, Clone)]
pub struct Notification {
    pub channel: String,
    pub payload: String,
}

/// An event surfaced off the driver's background connection poller.
#[derive(Debug, Clone)]
pub enum DriverEvent {
    Notification(Notification),
    /// The connection ended gracefully (peer closed it, or we did).
    End,
    /// The connection failed. Carries the driver's error message.
    Error(String),
}

/// The connection primitive used by the Channel Lock and Session.
///
/// A `Driver` instance owns exactly one database connection. All methods
/// that issue SQL run on that same connection, which is what makes the
/// lock subsystem's crash detection automatic: a holder's `pg_stat_activity`
/// row disappears the moment its connection (and therefore its `Driver`)
/// dies.
pub trait Driver: Send + Sync + 'static {
    /// Stream of notifications and lifecycle events for this connection.
    type Stream: Stream<Item = DriverEvent> + Send + Unpin;

    /// Establish the connection, setting `application_name` so peers can
    /// identify this session in `pg_stat_activity`.
    fn connect(conninfo: &str, application_name: &str) -> impl Future<Output = Result<(Self, Self::Stream)>> + Send
    where
        Self: Sized;

    fn listen(&self, channel: &str) -> impl Future<Output = Result<()>> + Send;

    fn unlisten(&self, channel: &str) -> impl Future<Output = Result<()>> + Send;

    fn unlisten_all(&self) -> impl Future<Output = Result<()>> + Send;

    fn notify(&self, channel: &str, payload: &str) -> impl Future<Output = Result<()>> + Send;

    /// Idempotent setup of the lock subsystem's bookkeeping table.
    fn lock_init(&self) -> impl Future<Output = Result<()>> + Send;

    /// Attempt to claim `channel` for `holder_id`. Succeeds immediately if
    /// `holder_id` already holds it, or if the current holder (if any) no
    /// longer appears in `pg_stat_activity`.
    fn lock_try_acquire(&self, channel: &str, holder_id: &str) -> impl Future<Output = Result<bool>> + Send;

    /// Release `channel` if currently held by `holder_id`, and publish a
    /// release notification on the derived lock sub-channel. No-op
    /// (including the notification) if `holder_id` does not hold it.
    fn lock_release(&self, channel: &str, holder_id: &str) -> impl Future<Output = Result<()>> + Send;
}

mod tokio_pg;
pub use tokio_pg::{TokioNotificationStream, TokioPgDriver};

#[cfg(any(test, feature = "test-util"))]
pub mod fake;
