//! Reliable pub/sub over PostgreSQL's `LISTEN`/`NOTIFY`, with optional
//! single-consumer arbitration across an arbitrary number of competing
//! processes.
//!
//! The public entry point is [`PubSubSession`], generic over the
//! connection [`Driver`](driver::Driver) it runs on. Most applications want
//! the type alias [`Session`], which fixes the driver to the real
//! `tokio_postgres`-backed implementation:
//!
//! ```no_run
//! use pgpubsub::{Session, PubSubOptions};
//!
//! # async fn run() -> pgpubsub_core::Result<()> {
//! let session = Session::new(PubSubOptions::default());
//! session.connect().await?;
//! session.listen("jobs").await?;
//!
//! let mut events = session.events();
//! while let Ok(event) = events.recv().await {
//!     println!("{event:?}");
//! }
//! # Ok(())
//! # }
//! ```

pub mod driver;
pub mod event;
pub mod lock;
pub mod router;
pub mod session;

pub use driver::{Driver, DriverEvent, Notification, TokioPgDriver};
pub use event::Event;
pub use lock::{ChannelLock, ChannelLockRegistry};
pub use pgpubsub_core::{ConnectionConfig, PubSubOptions};
pub use session::{PubSubSession, ReconnectState};

/// A [`PubSubSession`] backed by the real `tokio_postgres` driver. The
/// default choice for anything other than tests.
pub type Session = PubSubSession<TokioPgDriver>;
