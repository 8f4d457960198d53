use std::path::{Component, Path, PathBuf};

use arrow_array::RecordBatch;
use futures::{Stream, StreamExt};
use parquet::arrow::AsyncArrowWriter;
use tracing::{debug, warn};

use crate::error::{Result, ServerError};

/// Writes ingested record batch streams as parquet files under the
/// configured warehouse root. Each target path accepts exactly one write
/// over the server's lifetime: an existing file fails the ingest and is
/// left untouched.
pub struct IngestSink {
    warehouse_root: PathBuf,
}

impl IngestSink {
    pub fn new(warehouse_root: PathBuf) -> Self {
        Self { warehouse_root }
    }

    /// Resolves a client supplied relative path against the warehouse root,
    /// rejecting absolute paths and parent traversal.
    fn resolve(&self, rel_path: &str) -> Result<PathBuf> {
        let rel = Path::new(rel_path);
        if rel.components().any(|c| {
            matches!(
                c,
                Component::ParentDir | Component::RootDir | Component::Prefix(_)
            )
        }) {
            return Err(ServerError::InvalidQuery(format!(
                "ingest path must be relative to the warehouse root, got {rel_path}"
            )));
        }
        Ok(self.warehouse_root.join(rel))
    }

    /// Consumes `batches` and writes them to `{warehouse}/{rel_path}`,
    /// returning the number of rows written. Fails with a conflict when the
    /// target file already exists; any mid-stream failure removes the
    /// partial file so a retry starts clean.
    pub async fn write_stream<S>(&self, rel_path: &str, mut batches: S) -> Result<i64>
    where
        S: Stream<Item = Result<RecordBatch>> + Unpin,
    {
        let target = self.resolve(rel_path)?;

        let first = match batches.next().await {
            Some(batch) => batch?,
            None => {
                return Err(ServerError::InvalidQuery(
                    "ingest stream contained no record batches".to_string(),
                ))
            }
        };
        let schema = first.schema();

        if let Some(parent) = target.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let file = tokio::fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&target)
            .await
            .map_err(|e| match e.kind() {
                std::io::ErrorKind::AlreadyExists => ServerError::Conflict(format!(
                    "ingest target {} already exists",
                    target.display()
                )),
                _ => e.into(),
            })?;

        let result = Self::write_batches(file, schema, first, &mut batches).await;
        match result {
            Ok(rows) => {
                debug!("ingested {rows} rows into {}", target.display());
                Ok(rows)
            }
            Err(e) => {
                if let Err(cleanup) = tokio::fs::remove_file(&target).await {
                    warn!(
                        "failed to remove partial ingest file {}: {cleanup}",
                        target.display()
                    );
                }
                Err(e)
            }
        }
    }

    async fn write_batches<S>(
        file: tokio::fs::File,
        schema: arrow_schema::SchemaRef,
        first: RecordBatch,
        batches: &mut S,
    ) -> Result<i64>
    where
        S: Stream<Item = Result<RecordBatch>> + Unpin,
    {
        let mut writer = AsyncArrowWriter::try_new(file, schema, None)?;
        let mut rows = first.num_rows() as i64;
        writer.write(&first).await?;
        while let Some(batch) = batches.next().await {
            let batch = batch?;
            rows += batch.num_rows() as i64;
            writer.write(&batch).await?;
        }
        writer.close().await?;
        Ok(rows)
    }
}
