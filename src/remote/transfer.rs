// ABOUTME: Row transfer seam and its COPY-based PostgreSQL implementation
// ABOUTME: Copies one bounded batch of a table per call so callers can fan out and report progress

use anyhow::{Context, Result};
use async_trait::async_trait;
use futures::{pin_mut, SinkExt, StreamExt};

use super::models::ConnectionInfo;
use super::postgres::connect;
use crate::schema::quote_table_path;

/// One slice of a table to move from source to target.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BatchRequest<'a> {
    /// `schema.table`
    pub table: &'a str,
    pub filter: Option<&'a str>,
    pub offset: u64,
    pub limit: u64,
    /// Use the compact binary wire format.
    pub compression: bool,
}

#[async_trait]
pub trait DataTransfer: Send + Sync {
    async fn count_rows(
        &self,
        connection: &ConnectionInfo,
        table: &str,
        filter: Option<&str>,
    ) -> Result<u64>;

    /// Copy one batch and return the number of rows written to the target.
    async fn copy_batch(
        &self,
        source: &ConnectionInfo,
        target: &ConnectionInfo,
        batch: &BatchRequest<'_>,
    ) -> Result<u64>;
}

#[derive(Debug, Default, Clone)]
pub struct PostgresTransfer;

impl PostgresTransfer {
    pub fn new() -> Self {
        Self
    }
}

fn select_sql(table: &str, filter: Option<&str>) -> String {
    match filter {
        Some(clause) => format!("SELECT * FROM {} WHERE {}", quote_table_path(table), clause),
        None => format!("SELECT * FROM {}", quote_table_path(table)),
    }
}

fn copy_out_sql(batch: &BatchRequest<'_>) -> String {
    format!(
        "COPY ({} ORDER BY ctid LIMIT {} OFFSET {}) TO STDOUT{}",
        select_sql(batch.table, batch.filter),
        batch.limit,
        batch.offset,
        if batch.compression { " (FORMAT binary)" } else { "" }
    )
}

fn copy_in_sql(batch: &BatchRequest<'_>) -> String {
    format!(
        "COPY {} FROM STDIN{}",
        quote_table_path(batch.table),
        if batch.compression { " (FORMAT binary)" } else { "" }
    )
}

#[async_trait]
impl DataTransfer for PostgresTransfer {
    async fn count_rows(
        &self,
        connection: &ConnectionInfo,
        table: &str,
        filter: Option<&str>,
    ) -> Result<u64> {
        let client = connect(connection).await?;
        let sql = format!("SELECT count(*) FROM ({}) AS t", select_sql(table, filter));
        let row = client
            .query_one(&sql, &[])
            .await
            .with_context(|| format!("Failed to count rows in {}", table))?;
        let count: i64 = row.get(0);
        Ok(count.max(0) as u64)
    }

    async fn copy_batch(
        &self,
        source: &ConnectionInfo,
        target: &ConnectionInfo,
        batch: &BatchRequest<'_>,
    ) -> Result<u64> {
        let source_client = connect(source).await?;
        let target_client = connect(target).await?;

        let reader = source_client
            .copy_out(&copy_out_sql(batch))
            .await
            .with_context(|| format!("Failed to start reading {}", batch.table))?;
        let writer = target_client
            .copy_in(&copy_in_sql(batch))
            .await
            .with_context(|| format!("Failed to start writing {}", batch.table))?;
        pin_mut!(reader);
        pin_mut!(writer);

        while let Some(chunk) = reader.next().await {
            let chunk = chunk.with_context(|| format!("Failed reading rows from {}", batch.table))?;
            writer
                .send(chunk)
                .await
                .with_context(|| format!("Failed writing rows to {}", batch.table))?;
        }

        let written = writer
            .finish()
            .await
            .with_context(|| format!("Failed to commit batch for {}", batch.table))?;
        Ok(written)
    }
}
