//! [`Driver`] implementation backed by `tokio_postgres`.
//!
//! Grounded on the polling pattern used by real production `tokio_postgres`
//! consumers: the `Connection` object is a separate future that must be
//! driven to make progress, and asynchronous notifications arrive as
//! `AsyncMessage::Notification` values yielded by polling it directly
//! rather than through the `Client`.

use std::pin::Pin;
use std::task::{Context, Poll};

use futures::{future, Stream};
use pgpubsub_core::error::{Error, Result};
use pgpubsub_core::ident::{lock_channel_name, quote_ident, quote_literal};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;
use tokio_postgres::{AsyncMessage, NoTls};

use super::{Driver, DriverEvent, Notification};

pub struct TokioPgDriver {
    client: tokio_postgres::Client,
}

pub struct TokioNotificationStream {
    rx: mpsc::UnboundedReceiver<DriverEvent>,
}

impl Stream for TokioNotificationStream {
    type Item = DriverEvent;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.rx.poll_recv(cx)
    }
}

/// Drives the `tokio_postgres::Connection` to completion, forwarding
/// notifications and terminal events to `tx`. Runs for the lifetime of the
/// connection; exits when the connection ends or errors.
async fn drive_connection<S, T>(mut connection: tokio_postgres::Connection<S, T>, tx: mpsc::UnboundedSender<DriverEvent>)
where
    S: AsyncRead + AsyncWrite + Unpin,
    T: AsyncRead + AsyncWrite + Unpin,
{
    loop {
        match future::poll_fn(|cx| connection.poll_message(cx)).await {
            Some(Ok(AsyncMessage::Notification(n))) => {
                let event = DriverEvent::Notification(Notification {
                    channel: n.channel().to_string(),
                    payload: n.payload().to_string(),
                });
                if tx.send(event).is_err() {
                    return;
                }
            }
            Some(Ok(AsyncMessage::Notice(notice))) => {
                tracing::debug!(?notice, "postgres notice");
            }
            Some(Ok(_)) => {
                // Forward-compatible: tokio_postgres may add further
                // AsyncMessage variants we have no use for.
            }
            Some(Err(e)) => {
                let _ = tx.send(DriverEvent::Error(e.to_string()));
                return;
            }
            None => {
                let _ = tx.send(DriverEvent::End);
                return;
            }
        }
    }
}

impl Driver for TokioPgDriver {
    type Stream = TokioNotificationStream;

    async fn connect(conninfo: &str, application_name: &str) -> Result<(Self, Self::Stream)> {
        let mut config: tokio_postgres::Config =
            conninfo.parse().map_err(|e: tokio_postgres::Error| Error::Connect(e.to_string()))?;
        config.application_name(application_name);

        let (client, connection) =
            config.connect(NoTls).await.map_err(|e| Error::Connect(e.to_string()))?;

        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(drive_connection(connection, tx));

        Ok((Self { client }, TokioNotificationStream { rx }))
    }

    async fn listen(&self, channel: &str) -> Result<()> {
        let sql = format!("LISTEN {}", quote_ident(channel));
        self.client.batch_execute(&sql).await.map_err(|e| Error::Query(e.to_string()))
    }

    async fn unlisten(&self, channel: &str) -> Result<()> {
        let sql = format!("UNLISTEN {}", quote_ident(channel));
        self.client.batch_execute(&sql).await.map_err(|e| Error::Query(e.to_string()))
    }

    async fn unlisten_all(&self) -> Result<()> {
        self.client.batch_execute("UNLISTEN *").await.map_err(|e| Error::Query(e.to_string()))
    }

    async fn notify(&self, channel: &str, payload: &str) -> Result<()> {
        let sql = format!("NOTIFY {}, {}", quote_ident(channel), quote_literal(payload));
        self.client.batch_execute(&sql).await.map_err(|e| Error::Query(e.to_string()))
    }

    async fn lock_init(&self) -> Result<()> {
        self.client
            .batch_execute(
                "CREATE TABLE IF NOT EXISTS pg_pubsub_locks (\
                     channel text PRIMARY KEY, \
                     holder_id text NOT NULL, \
                     acquired_at timestamptz NOT NULL DEFAULT now()\
                 )",
            )
            .await
            .map_err(|e| Error::LockSetup(e.to_string()))
    }

    async fn lock_try_acquire(&self, channel: &str, holder_id: &str) -> Result<bool> {
        // Claim the row if it is unheld by us already, or if its recorded
        // holder's application_name no longer shows up as a live backend.
        // `ON CONFLICT ... WHERE` makes the claim atomic: at most one
        // concurrent attempt can satisfy the predicate and perform the
        // UPDATE.
        let rows = self
            .client
            .query(
                "INSERT INTO pg_pubsub_locks (channel, holder_id, acquired_at) \
                 VALUES ($1, $2, now()) \
                 ON CONFLICT (channel) DO UPDATE \
                   SET holder_id = EXCLUDED.holder_id, acquired_at = EXCLUDED.acquired_at \
                   WHERE pg_pubsub_locks.holder_id = $2 \
                      OR pg_pubsub_locks.holder_id NOT IN (SELECT application_name FROM pg_stat_activity) \
                 RETURNING holder_id",
                &[&channel, &holder_id],
            )
            .await
            .map_err(|e| Error::Query(e.to_string()))?;

        Ok(rows.len() == 1)
    }

    async fn lock_release(&self, channel: &str, holder_id: &str) -> Result<()> {
        let rows = self
            .client
            .execute(
                "DELETE FROM pg_pubsub_locks WHERE channel = $1 AND holder_id = $2",
                &[&channel, &holder_id],
            )
            .await
            .map_err(|e| Error::Query(e.to_string()))?;

        if rows == 1 {
            self.notify(&lock_channel_name(channel), "released").await?;
        }
        Ok(())
    }
}
