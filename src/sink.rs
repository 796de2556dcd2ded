//! CSV output shared between concurrent callbacks.
use csv_async::{AsyncWriter, AsyncWriterBuilder};
use tokio::io::AsyncWrite;
use tokio::sync::Mutex;

use crate::IngestResult;

/// A CSV writer with a fixed, ordered set of columns.
///
/// Rows from concurrent callbacks are serialized through an async mutex, so a
/// row is never interleaved with another.
pub struct CsvSink<W: AsyncWrite + Unpin + Send> {
    columns: Vec<String>,
    writer: Mutex<AsyncWriter<W>>,
}

impl<W: AsyncWrite + Unpin + Send> CsvSink<W> {
    pub fn new<S: Into<String>>(writer: W, columns: impl IntoIterator<Item = S>) -> Self {
        let writer = AsyncWriterBuilder::new()
            .has_headers(false)
            .create_writer(writer);
        Self {
            columns: columns.into_iter().map(Into::into).collect(),
            writer: Mutex::new(writer),
        }
    }

    pub fn columns(&self) -> &[String] {
        &self.columns
    }

    pub async fn write_header(&self) -> IngestResult<()> {
        let mut writer = self.writer.lock().await;
        writer.write_record(&self.columns).await?;
        Ok(())
    }

    /// Write one row; values are given in column order.
    pub async fn write_row<I, T>(&self, values: I) -> IngestResult<()>
    where
        I: IntoIterator<Item = T>,
        T: AsRef<[u8]>,
    {
        let mut writer = self.writer.lock().await;
        writer.write_record(values).await?;
        Ok(())
    }

    pub async fn flush(&self) -> IngestResult<()> {
        self.writer.lock().await.flush().await?;
        Ok(())
    }

    /// Flush and hand back the underlying writer.
    pub async fn into_inner(self) -> IngestResult<W> {
        let writer = self.writer.into_inner();
        writer
            .into_inner()
            .await
            .map_err(|e| std::io::Error::other(e.to_string()).into())
    }
}
