//! The tagged event emitted by a [`crate::session::PubSubSession`].
//!
//! Replaces the string-keyed emitter pattern you'd see in a JS client with a
//! single enum delivered over a `tokio::sync::broadcast` channel, so
//! consumers get exhaustiveness checking instead of string dispatch.

use std::sync::Arc;

use pgpubsub_core::Error as PubSubError;
use serde_json::Value;

/// An event emitted on a [`PubSubSession`](crate::session::PubSubSession)'s
/// general broadcast channel.
///
/// `Message` is also mirrored on the per-channel receiver returned by
/// `Session::channel(name)`; every other variant is only visible here.
#[derive(Debug, Clone)]
pub enum Event {
    /// The connection was established (first connect or after a reconnect
    /// cycle completes a fresh connect).
    Connect,
    /// `close()` or `destroy()` was called.
    Close,
    /// The driver connection ended without `close()`/`destroy()` having
    /// been called; a reconnect will follow if auto-reconnect is armed.
    End,
    /// `listen(channel)` took effect: the lock (if any) was acquired and
    /// `LISTEN` was issued.
    Listen(String),
    /// `unlisten(channel)` or `unlisten_all()` took effect. Carries every
    /// channel name that was unlistened as a result of the call.
    Unlisten(Vec<String>),
    /// A reconnect cycle completed and every tracked channel was re-driven
    /// through its acquisition path. Carries the retry count that preceded
    /// success.
    Reconnect(u32),
    /// A decoded application message arrived on `channel`.
    Message(String, Value),
    /// A non-fatal error: a failed decode, a dropped best-effort operation,
    /// or (wrapping `Error::RetryExhausted`) the terminal failure that
    /// precedes an automatic `close()`.
    Error(Arc<PubSubError>),
}
