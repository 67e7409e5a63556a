//! Shared types for `pgpubsub`: configuration, the error taxonomy, identifier
//! quoting, and the JSON payload codec.
//!
//! This crate has no database dependency of its own — it is imported by
//! `pgpubsub` for the pieces that don't need to know about the wire.

mod codec;
pub mod config;
pub mod error;
pub mod ident;

pub use codec::{pack, unpack};
pub use config::{ConnectionConfig, PubSubOptions};
pub use error::{Error, Result};
