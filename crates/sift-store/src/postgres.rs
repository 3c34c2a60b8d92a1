//! Postgres-backed implementation of the store seam.
//!
//! Reads stream rows straight off the wire; writes are batched so one
//! round-trip carries many rows. The insert path upserts, so a re-run after
//! a partial failure converges instead of conflicting.
use crate::{DEFAULT_WRITE_BATCH, QUEUE_DEPTH, Store, StoreError, next_batch};
use async_trait::async_trait;
use futures::TryStreamExt;
use sift_common::{Entity, FieldValue, KeyedChecksum, SyncSubject};
use sqlx::postgres::{PgArguments, PgPoolOptions};
use sqlx::query::Query;
use sqlx::{PgPool, Postgres, QueryBuilder, Row};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::debug;

const MAX_CONNECTIONS: u32 = 16;
const ACQUIRE_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone)]
pub struct PgStore {
    pool: PgPool,
    write_batch: usize,
}

impl PgStore {
    /// Open a pool with bounded sizing and acquire timeouts; hanging
    /// forever on an unavailable database is not an option for a sync
    /// daemon.
    pub async fn connect(url: &str) -> Result<Self, StoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(MAX_CONNECTIONS)
            .acquire_timeout(ACQUIRE_TIMEOUT)
            .connect(url)
            .await?;
        Ok(Self::new(pool))
    }

    pub fn new(pool: PgPool) -> Self {
        Self {
            pool,
            write_batch: DEFAULT_WRITE_BATCH,
        }
    }

    pub fn with_write_batch(mut self, write_batch: usize) -> Self {
        self.write_batch = write_batch.max(1);
        self
    }
}

#[async_trait]
impl Store for PgStore {
    fn yield_all(
        &self,
        subject: &Arc<SyncSubject>,
        cancel: CancellationToken,
    ) -> (mpsc::Receiver<KeyedChecksum>, mpsc::Receiver<StoreError>) {
        let (out_tx, out_rx) = mpsc::channel(QUEUE_DEPTH);
        let (err_tx, err_rx) = mpsc::channel(1);
        let pool = self.pool.clone();
        let shell = subject.new_shell("");
        let stmt = select_statement(shell.table(), shell.id_column(), shell.fingerprint_column());
        debug!(stmt = %stmt, "streaming rows");

        tokio::spawn(async move {
            let mut rows = sqlx::query(&stmt).fetch(&pool);
            loop {
                let next = tokio::select! {
                    _ = cancel.cancelled() => {
                        let _ = err_tx.try_send(StoreError::Cancelled);
                        return;
                    }
                    next = rows.try_next() => next,
                };
                let row = match next {
                    Ok(Some(row)) => row,
                    Ok(None) => return,
                    Err(err) => {
                        report_and_park(&err_tx, err.into(), &cancel).await;
                        return;
                    }
                };

                let pair = match keyed_checksum_from(&row) {
                    Ok(pair) => pair,
                    Err(err) => {
                        report_and_park(&err_tx, err, &cancel).await;
                        return;
                    }
                };
                tokio::select! {
                    _ = cancel.cancelled() => return,
                    sent = out_tx.send(pair) => {
                        if sent.is_err() {
                            return;
                        }
                    }
                }
            }
        });

        (out_rx, err_rx)
    }

    async fn create_streamed(
        &self,
        mut entities: mpsc::Receiver<Box<dyn Entity>>,
        cancel: CancellationToken,
    ) -> Result<(), StoreError> {
        while let Some(batch) = next_batch(&mut entities, self.write_batch, &cancel).await? {
            let mut builder = insert_builder(&batch);
            builder.build().execute(&self.pool).await?;
        }
        Ok(())
    }

    async fn update_streamed(
        &self,
        mut entities: mpsc::Receiver<Box<dyn Entity>>,
        cancel: CancellationToken,
    ) -> Result<(), StoreError> {
        while let Some(batch) = next_batch(&mut entities, self.write_batch, &cancel).await? {
            // One transaction per batch keeps a batch atomic without
            // holding a connection for the whole stream.
            let mut tx = self.pool.begin().await?;
            let first = &batch[0];
            let stmt = update_statement(first.table(), first.id_column(), first.columns());
            for entity in &batch {
                let mut query = sqlx::query(&stmt).bind(entity.id().to_string());
                for value in entity.values() {
                    query = bind_value(query, value);
                }
                query.execute(&mut *tx).await?;
            }
            tx.commit().await?;
        }
        Ok(())
    }

    async fn delete(
        &self,
        subject: &Arc<SyncSubject>,
        ids: Vec<String>,
        cancel: CancellationToken,
    ) -> Result<(), StoreError> {
        let shell = subject.new_shell("");
        let stmt = delete_statement(shell.table(), shell.id_column());
        for chunk in ids.chunks(self.write_batch) {
            if cancel.is_cancelled() {
                return Err(StoreError::Cancelled);
            }
            sqlx::query(&stmt)
                .bind(chunk.to_vec())
                .execute(&self.pool)
                .await?;
        }
        Ok(())
    }
}

fn keyed_checksum_from(row: &sqlx::postgres::PgRow) -> Result<KeyedChecksum, StoreError> {
    let id: String = row.try_get("id")?;
    let fingerprint: Option<Vec<u8>> = row.try_get("fingerprint")?;
    Ok(KeyedChecksum::new(id, fingerprint.map(Into::into)))
}

fn select_statement(table: &str, id_column: &str, fingerprint_column: &str) -> String {
    format!("SELECT {id_column} AS id, {fingerprint_column} AS fingerprint FROM {table}")
}

/// Multi-row upsert for one batch. The column list comes from the first
/// entity; all entities of a batch belong to the same subject.
fn insert_builder(batch: &[Box<dyn Entity>]) -> QueryBuilder<'static, Postgres> {
    let first = &batch[0];
    let id_column = first.id_column();
    let columns = first.columns();

    let mut builder = QueryBuilder::new(format!(
        "INSERT INTO {} ({id_column}, {}) ",
        first.table(),
        columns.join(", "),
    ));
    builder.push_values(batch, |mut row, entity| {
        row.push_bind(entity.id().to_string());
        for value in entity.values() {
            push_value(&mut row, value);
        }
    });
    builder.push(format!(" ON CONFLICT ({id_column}) DO UPDATE SET "));
    builder.push(
        columns
            .iter()
            .map(|column| format!("{column} = EXCLUDED.{column}"))
            .collect::<Vec<_>>()
            .join(", "),
    );
    builder
}

fn update_statement(table: &str, id_column: &str, columns: &[&str]) -> String {
    let assignments = columns
        .iter()
        .enumerate()
        .map(|(index, column)| format!("{column} = ${}", index + 2))
        .collect::<Vec<_>>()
        .join(", ");
    format!("UPDATE {table} SET {assignments} WHERE {id_column} = $1")
}

fn delete_statement(table: &str, id_column: &str) -> String {
    format!("DELETE FROM {table} WHERE {id_column} = ANY($1)")
}

fn bind_value<'q>(
    query: Query<'q, Postgres, PgArguments>,
    value: FieldValue,
) -> Query<'q, Postgres, PgArguments> {
    match value {
        FieldValue::Text(text) => query.bind(text),
        FieldValue::Int(int) => query.bind(int),
        FieldValue::Float(float) => query.bind(float),
        FieldValue::Bool(boolean) => query.bind(boolean),
        FieldValue::Bytes(raw) => query.bind(raw),
        FieldValue::Null => query.bind(Option::<String>::None),
    }
}

fn push_value(
    row: &mut sqlx::query_builder::Separated<'_, '_, Postgres, &'static str>,
    value: FieldValue,
) {
    match value {
        FieldValue::Text(text) => row.push_bind(text),
        FieldValue::Int(int) => row.push_bind(int),
        FieldValue::Float(float) => row.push_bind(float),
        FieldValue::Bool(boolean) => row.push_bind(boolean),
        FieldValue::Bytes(raw) => row.push_bind(raw),
        FieldValue::Null => row.push_bind(Option::<String>::None),
    };
}

async fn report_and_park(
    err_tx: &mpsc::Sender<StoreError>,
    err: StoreError,
    cancel: &CancellationToken,
) {
    if err_tx.try_send(err).is_err() {
        return;
    }
    cancel.cancelled().await;
}
