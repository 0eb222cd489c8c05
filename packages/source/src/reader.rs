//! Row readers over a single census CSV file.
//!
//! [`RowReader`] is a plain blocking iterator. [`stream_rows`] moves a
//! reader onto the blocking thread pool and hands rows to async code over a
//! bounded channel, so a slow consumer stops the reader instead of letting
//! decoded rows pile up in memory.

use std::fs::File;
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use futures::Stream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::row::{Headers, RawRow};
use crate::{SourceError, TextEncoding};

/// Rows buffered between the blocking reader and the async consumer.
pub const ROW_CHANNEL_BUFFER: usize = 1024;

/// UTF-8 byte order mark some exports put before the first header.
const UTF8_BOM: &[u8] = b"\xEF\xBB\xBF";

/// Blocking iterator over the records of one CSV file.
pub struct RowReader {
    path: PathBuf,
    reader: csv::Reader<File>,
    headers: Arc<Headers>,
    encoding: TextEncoding,
    record: csv::ByteRecord,
}

impl RowReader {
    /// Opens `path` and reads its header row.
    ///
    /// # Errors
    ///
    /// Returns [`SourceError::Open`] if the file cannot be opened, or
    /// [`SourceError::Csv`] if the header row cannot be read.
    pub fn open(path: &Path, encoding: TextEncoding) -> Result<Self, SourceError> {
        let file = File::open(path).map_err(|source| SourceError::Open {
            path: path.to_path_buf(),
            source,
        })?;

        let mut reader = csv::ReaderBuilder::new()
            .buffer_capacity(1 << 16)
            .flexible(true)
            .from_reader(file);

        let names = reader
            .byte_headers()?
            .iter()
            .enumerate()
            .map(|(i, field)| {
                let field = if i == 0 {
                    field.strip_prefix(UTF8_BOM).unwrap_or(field)
                } else {
                    field
                };
                encoding.decode(field).trim().to_string()
            })
            .collect();

        Ok(Self {
            path: path.to_path_buf(),
            reader,
            headers: Arc::new(Headers::new(names)),
            encoding,
            record: csv::ByteRecord::new(),
        })
    }

    /// Header row of the file.
    #[must_use]
    pub fn headers(&self) -> &Headers {
        &self.headers
    }

    /// Checks that every column in `columns` is present in the header.
    ///
    /// # Errors
    ///
    /// Returns [`SourceError::MissingColumn`] naming the first absent column.
    pub fn require_columns(&self, columns: &[&str]) -> Result<(), SourceError> {
        match columns.iter().find(|c| !self.headers.contains(c)) {
            Some(column) => Err(SourceError::MissingColumn {
                path: self.path.clone(),
                column: (*column).to_string(),
            }),
            None => Ok(()),
        }
    }
}

impl Iterator for RowReader {
    type Item = Result<RawRow, SourceError>;

    fn next(&mut self) -> Option<Self::Item> {
        match self.reader.read_byte_record(&mut self.record) {
            Ok(true) => {
                let encoding = self.encoding;
                let fields = self.record.iter().map(|f| encoding.decode(f)).collect();
                let line = self.record.position().map_or(0, csv::Position::line);
                Some(Ok(RawRow::new(Arc::clone(&self.headers), fields, line)))
            }
            Ok(false) => None,
            Err(e) => Some(Err(e.into())),
        }
    }
}

/// Async stream of rows produced by a blocking [`RowReader`] task.
///
/// Dropping the stream closes the channel; the reader task notices on its
/// next send, stops, and closes the file.
pub struct RowStream {
    rx: mpsc::Receiver<Result<RawRow, SourceError>>,
}

impl Stream for RowStream {
    type Item = Result<RawRow, SourceError>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.rx.poll_recv(cx)
    }
}

/// Opens `path` and starts reading it on the blocking thread pool.
///
/// The returned [`JoinHandle`] resolves to the number of rows the task read
/// (including rows that were never consumed because the stream was dropped).
/// A read error is delivered through the stream and ends it.
///
/// Must be called from within a tokio runtime.
///
/// # Errors
///
/// Returns [`SourceError`] if the file cannot be opened or a required
/// column is missing. Nothing is spawned in that case.
pub fn stream_rows(
    path: &Path,
    encoding: TextEncoding,
    required_columns: &[&str],
) -> Result<(RowStream, JoinHandle<u64>), SourceError> {
    let reader = RowReader::open(path, encoding)?;
    reader.require_columns(required_columns)?;

    let (tx, rx) = mpsc::channel(ROW_CHANNEL_BUFFER);
    let name = crate::files::display_name(path);

    let handle = tokio::task::spawn_blocking(move || {
        let mut rows = 0u64;

        for row in reader {
            let failed = row.is_err();
            if row.is_ok() {
                rows += 1;
            }

            if tx.blocking_send(row).is_err() {
                log::debug!("{name}: row consumer went away after {rows} rows, closing file");
                break;
            }

            if failed {
                break;
            }
        }

        rows
    });

    Ok((RowStream { rx }, handle))
}
