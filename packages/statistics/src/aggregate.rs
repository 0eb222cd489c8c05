//! Two-pass aggregator.
//!
//! Phase RAW stages every relevant count under `(entity, attribute)`.
//! Phase FINAL reads each count that has a divisor again, looks up the
//! divisor's count for the same entity, and overwrites the staged value with
//! the percentage. Counts without a divisor are never rewritten, so they
//! stay bit-identical to Phase RAW.
//!
//! An attribute can have a divisor and be a divisor itself (1 <- 2 <- 3).
//! Its ratios are held back until Phase FINAL has read every file, so every
//! divisor lookup sees a raw count.
//!
//! [`Aggregator::run_raw`] returns only after every RAW write for every
//! file has completed, which is the barrier Phase FINAL depends on.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

use census_map_source::files::display_name;
use census_map_source::progress::ProgressCallback;
use census_map_source::reader::{RowStream, stream_rows};
use census_map_source::row::RawRow;
use census_map_source::{REQUIRED_COLUMNS, SourceError, TextEncoding};
use census_map_staging::{StagingError, StagingStore};
use census_map_statistics_models::{CensusRecord, PassSummary, Phase, StagedKey};
use futures::{Stream, TryStreamExt as _, future, stream::TryChunksError};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;

use crate::StatsError;
use crate::filter::{RowFilter, RowOutcome};
use crate::stream::for_each_bounded;

/// Ratio values are rounded to `1 / RATIO_PRECISION` (one decimal place).
pub const RATIO_PRECISION: f64 = 10.0;

/// Percentage of `value` relative to `divisor`, rounded to one decimal.
///
/// ```
/// assert_eq!(census_map_statistics::aggregate::ratio(50.0, 200.0), 25.0);
/// ```
#[must_use]
pub fn ratio(value: f64, divisor: f64) -> f64 {
    (100.0 * value / divisor * RATIO_PRECISION).round() / RATIO_PRECISION
}

/// Counters shared by the handlers of one pass over one file.
#[derive(Default)]
struct PassCounters {
    records: AtomicU64,
    skipped: AtomicU64,
    ratios: AtomicU64,
    divisor_missing: AtomicU64,
}

/// Settings for an [`Aggregator`].
#[derive(Debug, Clone)]
pub struct AggregatorOptions {
    /// Maximum number of in-flight handlers.
    pub concurrency: usize,
    /// Records per Phase FINAL batch.
    pub lookup_batch_size: usize,
    /// Text encoding of the input files.
    pub encoding: TextEncoding,
}

/// Runs both phases against one staging store.
pub struct Aggregator {
    store: Arc<dyn StagingStore>,
    filter: Arc<RowFilter>,
    options: AggregatorOptions,
    progress: Arc<dyn ProgressCallback>,
    /// Ratios of attributes other attributes divide by.
    deferred: Arc<Mutex<Vec<(StagedKey, f64)>>>,
}

impl Aggregator {
    /// Creates an aggregator.
    #[must_use]
    pub fn new(
        store: Arc<dyn StagingStore>,
        filter: RowFilter,
        options: AggregatorOptions,
        progress: Arc<dyn ProgressCallback>,
    ) -> Self {
        Self {
            store,
            filter: Arc::new(filter),
            options,
            progress,
            deferred: Arc::default(),
        }
    }

    /// Phase RAW over every file, one file at a time.
    ///
    /// # Errors
    ///
    /// Returns the first [`StatsError`]; later files are not read.
    pub async fn run_raw(&self, files: &[PathBuf]) -> Result<Vec<PassSummary>, StatsError> {
        log::info!("Phase RAW: staging raw counts from {} file(s)", files.len());
        let mut summaries = Vec::with_capacity(files.len());
        for path in files {
            summaries.push(self.stage_raw_file(path).await?);
        }
        Ok(summaries)
    }

    /// Phase FINAL over every file, one file at a time, then writes the
    /// held-back ratios.
    ///
    /// Must only be called after [`Self::run_raw`] has returned for all
    /// files.
    ///
    /// # Errors
    ///
    /// Returns the first [`StatsError`]; later files are not read.
    pub async fn run_final(&self, files: &[PathBuf]) -> Result<Vec<PassSummary>, StatsError> {
        log::info!("Phase FINAL: computing ratios for {} file(s)", files.len());
        let mut summaries = Vec::with_capacity(files.len());
        for path in files {
            summaries.push(self.stage_final_file(path).await?);
        }
        self.flush_deferred().await?;
        Ok(summaries)
    }

    /// Writes the ratios [`Self::stage_final_file`] held back for attributes
    /// that are divisors of others.
    ///
    /// Returns the number of values written.
    ///
    /// # Errors
    ///
    /// Returns [`StatsError::Staging`] if the write fails.
    pub async fn flush_deferred(&self) -> Result<u64, StatsError> {
        let writes = std::mem::take(&mut *self.deferred.lock().await);
        let written = writes.len() as u64;

        if written > 0 {
            log::info!("{}: writing {written} held-back ratio(s)", Phase::Final);
            self.store.put_many(writes).await?;
        }

        Ok(written)
    }

    /// Stages the raw count of every relevant row of `path`.
    ///
    /// Writes are last-write-wins: a repeated key keeps the value of the
    /// row that finished last.
    ///
    /// # Errors
    ///
    /// Returns [`StatsError::Store`] if a write fails and
    /// [`StatsError::Read`] if the file cannot be read.
    pub async fn stage_raw_file(&self, path: &Path) -> Result<PassSummary, StatsError> {
        let phase = Phase::Raw;
        let file = display_name(path);
        let started = Instant::now();
        let counters = Arc::new(PassCounters::default());

        self.progress.set_message(format!("{phase} {file}"));
        log::info!("{phase}: reading {file}");

        let (rows, reader) = self.open(path, phase)?;
        let records = self.relevant_records(rows, phase, &file, &counters);

        let dispatched = for_each_bounded(records, self.options.concurrency, |record| {
            let store = Arc::clone(&self.store);
            let progress = Arc::clone(&self.progress);
            let file = file.clone();
            async move {
                store
                    .put(record.key(), record.value)
                    .await
                    .map_err(|source| store_error(phase, &file, source))?;
                progress.inc(1);
                Ok(())
            }
        })
        .await?;

        finish_pass(phase, file, dispatched, reader, &counters, started).await
    }

    /// Rewrites the staged value of every relevant row of `path` that has a
    /// divisor.
    ///
    /// Records are dispatched in batches of `lookup_batch_size`; each batch
    /// issues one batch lookup for its divisor keys and one batch write.
    /// When the divisor's value is absent or zero the raw value stays in
    /// place.
    ///
    /// Ratios of attributes that other attributes divide by are held back
    /// until [`Self::flush_deferred`], which [`Self::run_final`] calls after
    /// its last file.
    ///
    /// # Errors
    ///
    /// Returns [`StatsError::Store`] if a lookup or write fails and
    /// [`StatsError::Read`] if the file cannot be read.
    pub async fn stage_final_file(&self, path: &Path) -> Result<PassSummary, StatsError> {
        let phase = Phase::Final;
        let file = display_name(path);
        let started = Instant::now();
        let counters = Arc::new(PassCounters::default());

        self.progress.set_message(format!("{phase} {file}"));
        log::info!("{phase}: reading {file}");

        let (rows, reader) = self.open(path, phase)?;
        let batches = self
            .relevant_records(rows, phase, &file, &counters)
            .try_chunks(self.options.lookup_batch_size.max(1))
            .map_err(|TryChunksError(_, e)| e);

        let dispatched = for_each_bounded(batches, self.options.concurrency, |batch| {
            let store = Arc::clone(&self.store);
            let filter = Arc::clone(&self.filter);
            let progress = Arc::clone(&self.progress);
            let counters = Arc::clone(&counters);
            let deferred = Arc::clone(&self.deferred);
            let file = file.clone();
            async move {
                let size = batch.len() as u64;
                finalize_batch(store.as_ref(), &filter, batch, &counters, &deferred, &file)
                    .await
                    .map_err(|source| store_error(phase, &file, source))?;
                progress.inc(size);
                Ok(())
            }
        })
        .await?;

        log::debug!("{phase}: {file} dispatched {dispatched} batch(es)");

        let records = counters.records.load(Ordering::Relaxed);
        finish_pass(phase, file, records, reader, &counters, started).await
    }

    fn open(
        &self,
        path: &Path,
        phase: Phase,
    ) -> Result<(RowStream, JoinHandle<u64>), StatsError> {
        stream_rows(path, self.options.encoding, REQUIRED_COLUMNS).map_err(|source| {
            StatsError::Read {
                phase,
                file: display_name(path),
                source,
            }
        })
    }

    /// Filters `rows` down to relevant records, logging and counting
    /// skipped rows.
    fn relevant_records<S>(
        &self,
        rows: S,
        phase: Phase,
        file: &str,
        counters: &Arc<PassCounters>,
    ) -> impl Stream<Item = Result<CensusRecord, StatsError>> + Send + 'static
    where
        S: Stream<Item = Result<RawRow, SourceError>> + Send + 'static,
    {
        let filter = Arc::clone(&self.filter);
        let counters = Arc::clone(counters);
        let file = file.to_string();

        rows.map_err({
            let file = file.clone();
            move |source| StatsError::Read {
                phase,
                file: file.clone(),
                source,
            }
        })
        .try_filter_map(move |row| {
            let record = match filter.classify(&row) {
                RowOutcome::Relevant(record) => {
                    counters.records.fetch_add(1, Ordering::Relaxed);
                    Some(record)
                }
                RowOutcome::Irrelevant => None,
                RowOutcome::Skipped(reason) => {
                    counters.skipped.fetch_add(1, Ordering::Relaxed);
                    log::warn!("{file} line {}: skipped row: {reason}", row.line());
                    None
                }
            };
            future::ready(Ok(record))
        })
    }
}

async fn finish_pass(
    phase: Phase,
    file: String,
    records: u64,
    reader: JoinHandle<u64>,
    counters: &PassCounters,
    started: Instant,
) -> Result<PassSummary, StatsError> {
    let rows_read = reader.await?;

    let summary = PassSummary {
        file,
        rows_read,
        records,
        skipped: counters.skipped.load(Ordering::Relaxed),
        ratios: counters.ratios.load(Ordering::Relaxed),
        divisor_missing: counters.divisor_missing.load(Ordering::Relaxed),
        elapsed: started.elapsed(),
    };

    log::info!(
        "{phase}: {} done in {:.1}s, {} rows read, {} records, {} skipped",
        summary.file,
        summary.elapsed.as_secs_f64(),
        summary.rows_read,
        summary.records,
        summary.skipped
    );
    if matches!(phase, Phase::Final) {
        log::info!(
            "{phase}: {} {} ratios, {} kept raw for a missing divisor",
            summary.file,
            summary.ratios,
            summary.divisor_missing
        );
    }

    Ok(summary)
}

fn store_error(phase: Phase, file: &str, source: StagingError) -> StatsError {
    StatsError::Store {
        phase,
        file: file.to_string(),
        source,
    }
}

/// One Phase FINAL batch: one lookup for all divisor keys, one write for
/// all ratios. Ratios of divisor attributes go to `deferred` instead.
async fn finalize_batch(
    store: &dyn StagingStore,
    filter: &RowFilter,
    batch: Vec<CensusRecord>,
    counters: &PassCounters,
    deferred: &Mutex<Vec<(StagedKey, f64)>>,
    file: &str,
) -> Result<(), StagingError> {
    let catalog = filter.catalog();

    let with_divisor: Vec<(CensusRecord, StagedKey)> = batch
        .into_iter()
        .filter_map(|record| {
            let divisor = catalog.divisor_of(record.attribute_id)?;
            let key = record.key_for(divisor);
            Some((record, key))
        })
        .collect();

    if with_divisor.is_empty() {
        return Ok(());
    }

    let divisor_keys: Vec<StagedKey> = with_divisor.iter().map(|(_, key)| key.clone()).collect();
    let divisors: BTreeMap<StagedKey, Option<f64>> = store.get_many(&divisor_keys).await?;

    let mut writes = Vec::with_capacity(with_divisor.len());
    let mut held = Vec::new();

    for (record, divisor_key) in with_divisor {
        match divisors.get(&divisor_key).copied().flatten() {
            Some(divisor) if divisor != 0.0 => {
                let value = (record.key(), ratio(record.value, divisor));
                if catalog.is_divisor(record.attribute_id) {
                    held.push(value);
                } else {
                    writes.push(value);
                }
            }
            _ => {
                counters.divisor_missing.fetch_add(1, Ordering::Relaxed);
                log::debug!(
                    "{file}: no divisor value at {divisor_key}, keeping raw value of {}",
                    record.key()
                );
            }
        }
    }

    counters
        .ratios
        .fetch_add((writes.len() + held.len()) as u64, Ordering::Relaxed);

    if !held.is_empty() {
        deferred.lock().await.extend(held);
    }

    store.put_many(writes).await
}
