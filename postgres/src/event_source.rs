//! Event source over the `events` table with `LISTEN/NOTIFY` wake-ups.

use crate::error::source_error;
use crate::{from_db, to_db};
use chrono::{DateTime, Utc};
use futures::stream::{self, BoxStream, StreamExt, TryStreamExt};
use projector_core::{BoxFuture, EventNotifications, EventSource, EventSourceError, RecordedEvent};
use sqlx::postgres::{PgListener, PgPool};
use std::time::Duration;
use tokio::sync::watch;

/// Channel the `events` insert trigger notifies on.
pub const DEFAULT_CHANNEL: &str = "events_committed";

const DEFAULT_BATCH_SIZE: usize = 500;

#[derive(sqlx::FromRow)]
struct EventRow {
    global_sequence: i64,
    aggregate_id: String,
    event_type: String,
    payload: Vec<u8>,
    recorded_at: DateTime<Utc>,
}

impl TryFrom<EventRow> for RecordedEvent {
    type Error = EventSourceError;

    fn try_from(row: EventRow) -> Result<Self, Self::Error> {
        if row.global_sequence < 1 {
            return Err(EventSourceError::Malformed(format!(
                "global_sequence {} is not positive",
                row.global_sequence
            )));
        }
        Ok(Self::new(
            row.aggregate_id,
            from_db(row.global_sequence),
            row.event_type,
            row.payload,
            row.recorded_at,
        ))
    }
}

/// Read-only access to the `events` table.
///
/// # Schema
///
/// ```sql
/// CREATE TABLE events (
///     global_sequence BIGSERIAL PRIMARY KEY,
///     aggregate_id    TEXT NOT NULL,
///     event_type      TEXT NOT NULL,
///     payload         BYTEA NOT NULL,
///     recorded_at     TIMESTAMPTZ NOT NULL DEFAULT now()
/// );
/// ```
///
/// Replay reads pages of `batch_size` rows, so a full-log rebuild never holds
/// more than one page in memory.
///
/// # Notifications
///
/// [`subscribe`](EventSource::subscribe) opens a dedicated `PgListener`
/// connection and forwards every `NOTIFY` on the channel into a watch channel.
/// After a dropped connection the listener reconnects and wakes subscribers
/// anyway, since notifications sent while disconnected are lost.
#[derive(Clone, Debug)]
pub struct PostgresEventSource {
    pool: PgPool,
    batch_size: usize,
    channel: String,
}

impl PostgresEventSource {
    /// Create an event source on `pool` with default page size and channel.
    #[must_use]
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool,
            batch_size: DEFAULT_BATCH_SIZE,
            channel: DEFAULT_CHANNEL.to_string(),
        }
    }

    /// Set the number of rows fetched per replay page.
    #[must_use]
    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size.max(1);
        self
    }

    /// Listen on a different `NOTIFY` channel.
    #[must_use]
    pub fn with_channel(mut self, channel: impl Into<String>) -> Self {
        self.channel = channel.into();
        self
    }

    async fn page(pool: &PgPool, from: u64, limit: usize) -> Result<Vec<RecordedEvent>, EventSourceError> {
        let rows: Vec<EventRow> = sqlx::query_as(
            "SELECT global_sequence, aggregate_id, event_type, payload, recorded_at
             FROM events
             WHERE global_sequence >= $1
             ORDER BY global_sequence
             LIMIT $2",
        )
        .bind(to_db(from))
        .bind(i64::try_from(limit).unwrap_or(i64::MAX))
        .fetch_all(pool)
        .await
        .map_err(|e| source_error("Failed to read events", &e))?;

        rows.into_iter().map(RecordedEvent::try_from).collect()
    }
}

impl EventSource for PostgresEventSource {
    fn head(&self) -> BoxFuture<'_, Result<u64, EventSourceError>> {
        Box::pin(async move {
            let head: i64 = sqlx::query_scalar("SELECT COALESCE(MAX(global_sequence), 0) FROM events")
                .fetch_one(&self.pool)
                .await
                .map_err(|e| source_error("Failed to read head", &e))?;
            Ok(from_db(head))
        })
    }

    fn next_after(
        &self,
        sequence: u64,
    ) -> BoxFuture<'_, Result<Option<RecordedEvent>, EventSourceError>> {
        Box::pin(async move {
            let row: Option<EventRow> = sqlx::query_as(
                "SELECT global_sequence, aggregate_id, event_type, payload, recorded_at
                 FROM events
                 WHERE global_sequence > $1
                 ORDER BY global_sequence
                 LIMIT 1",
            )
            .bind(to_db(sequence))
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| source_error("Failed to read next event", &e))?;

            row.map(RecordedEvent::try_from).transpose()
        })
    }

    fn replay_from(
        &self,
        sequence: u64,
    ) -> BoxStream<'_, Result<RecordedEvent, EventSourceError>> {
        let pool = self.pool.clone();
        let batch_size = self.batch_size;

        // Pages are fetched lazily; a short page means the head was reached.
        stream::try_unfold(Some(sequence), move |cursor| {
            let pool = pool.clone();
            async move {
                let Some(from) = cursor else {
                    return Ok::<_, EventSourceError>(None);
                };
                let page = Self::page(&pool, from, batch_size).await?;
                let next = if page.len() < batch_size {
                    None
                } else {
                    page.last().map(|e| e.global_sequence + 1)
                };
                Ok(Some((
                    stream::iter(page.into_iter().map(Ok::<_, EventSourceError>)),
                    next,
                )))
            }
        })
        .try_flatten()
        .boxed()
    }

    fn subscribe(&self) -> BoxFuture<'_, Result<EventNotifications, EventSourceError>> {
        Box::pin(async move {
            let mut listener = PgListener::connect_with(&self.pool)
                .await
                .map_err(|e| EventSourceError::Subscription(e.to_string()))?;
            listener
                .listen(&self.channel)
                .await
                .map_err(|e| EventSourceError::Subscription(e.to_string()))?;

            let (tx, rx) = watch::channel(self.head().await?);
            let channel = self.channel.clone();

            tokio::spawn(async move {
                tracing::debug!(channel = %channel, "Listening for event commits");
                loop {
                    tokio::select! {
                        () = tx.closed() => break,
                        notification = listener.recv() => match notification {
                            Ok(notification) => {
                                let sequence = notification.payload().parse::<u64>().unwrap_or(0);
                                tx.send_modify(|head| *head = (*head).max(sequence));
                            }
                            Err(e) => {
                                tracing::warn!(channel = %channel, error = %e, "Event listener error, reconnecting");
                                tokio::time::sleep(Duration::from_secs(1)).await;
                                tx.send_modify(|_| {});
                            }
                        },
                    }
                }
                tracing::debug!(channel = %channel, "Event listener stopped");
            });

            Ok(rx)
        })
    }
}
