//! The Notification Router: a pure demultiplexer with no connection or
//! subscription-table ownership of its own.
//!
//! Given a raw `(channel, payload)` pair and enough session context to
//! answer "is this channel currently acquired", it classifies the
//! notification and tells the caller what to do next. The caller (the
//! Session's poll loop) owns all the actual broadcast/lock-registry state
//! and performs the corresponding action.

use pgpubsub_core::ident::is_reserved_channel;
use pgpubsub_core::{unpack, Error};
use serde_json::Value;

/// What the Session should do with one incoming notification.
#[derive(Debug)]
pub enum RouterAction {
    /// The notification was on a lock sub-channel; hand it to the lock
    /// subsystem for `base_channel`. Never surfaced as an application
    /// event.
    LockProtocol { base_channel: String },
    /// Single-listener mode is enabled and this session does not hold the
    /// channel's lock; a peer will deliver it instead.
    Dropped,
    /// Decoded application payload, ready to emit as `Event::Message`.
    Message { channel: String, payload: Value },
    /// The payload failed to decode; emit `Event::Error`, do not dispatch a
    /// message.
    DecodeError { channel: String, error: Error },
}

/// Classify and (for application traffic) decode one raw notification.
///
/// `is_acquired` is only consulted for non-lock channels when
/// `single_listener` is true; it should reflect the Channel Lock's cached
/// acquisition state for `channel`; it's not called at all for channels
/// this session has no lock tracked for under the assumption that an
/// untracked channel was never `listen`ed on this session in the first
/// place (the driver would not be delivering it otherwise).
pub fn route(channel: &str, payload: &str, single_listener: bool, is_acquired: impl FnOnce(&str) -> bool) -> RouterAction {
    if is_reserved_channel(channel) {
        let base_channel = channel
            .strip_prefix("__")
            .and_then(|rest| rest.strip_suffix("__lock__"))
            .unwrap_or(channel)
            .to_string();
        return RouterAction::LockProtocol { base_channel };
    }

    if single_listener && !is_acquired(channel) {
        return RouterAction::Dropped;
    }

    match unpack(payload) {
        Ok(value) => RouterAction::Message { channel: channel.to_string(), payload: value },
        Err(error) => RouterAction::DecodeError { channel: channel.to_string(), error },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lock_traffic_is_classified_and_never_decoded() {
        match route("__jobs__lock__", "garbage", true, |_| true) {
            RouterAction::LockProtocol { base_channel } => assert_eq!(base_channel, "jobs"),
            other => panic!("expected LockProtocol, got {other:?}"),
        }
    }

    #[test]
    fn application_traffic_is_dropped_when_not_acquired() {
        match route("jobs", "{}", true, |_| false) {
            RouterAction::Dropped => {}
            other => panic!("expected Dropped, got {other:?}"),
        }
    }

    #[test]
    fn application_traffic_decodes_when_acquired() {
        match route("jobs", "{\"n\":1}", true, |_| true) {
            RouterAction::Message { channel, payload } => {
                assert_eq!(channel, "jobs");
                assert_eq!(payload, serde_json::json!({"n": 1}));
            }
            other => panic!("expected Message, got {other:?}"),
        }
    }

    #[test]
    fn multi_listener_mode_ignores_acquisition() {
        match route("jobs", "{}", false, |_| false) {
            RouterAction::Message { .. } => {}
            other => panic!("expected Message, got {other:?}"),
        }
    }

    #[test]
    fn malformed_payload_is_a_decode_error_not_a_message() {
        match route("jobs", "not-json", false, |_| true) {
            RouterAction::DecodeError { channel, .. } => assert_eq!(channel, "jobs"),
            other => panic!("expected DecodeError, got {other:?}"),
        }
    }
}
