#![cfg_attr(feature = "fail-on-warnings", deny(warnings))]
#![warn(clippy::all, clippy::pedantic, clippy::nursery, clippy::cargo)]
#![allow(clippy::multiple_crate_versions, clippy::cargo_common_metadata)]

//! Shared CLI utilities for the census map tools.
//!
//! Provides `indicatif` progress indicators behind the [`ProgressCallback`]
//! trait, plus [`init_logger`] which routes `log` output through
//! `indicatif-log-bridge` so log lines never tear a redrawing bar.

use std::sync::Arc;
use std::time::Duration;

use census_map_source::progress::ProgressCallback;
use indicatif::{ProgressBar, ProgressStyle};

pub use indicatif::MultiProgress;

const TICK: Duration = Duration::from_millis(100);

/// An `indicatif` [`ProgressBar`] that implements [`ProgressCallback`].
///
/// Starts as a spinner and switches to `sized_style` once a total is known.
pub struct IndicatifProgress {
    bar: ProgressBar,
    sized_style: ProgressStyle,
}

impl IndicatifProgress {
    fn spinner(
        multi: &MultiProgress,
        message: &str,
        spinner_template: &str,
        sized_template: &str,
    ) -> Arc<dyn ProgressCallback> {
        let bar = multi.add(ProgressBar::new_spinner());
        bar.enable_steady_tick(TICK);
        bar.set_style(
            ProgressStyle::with_template(spinner_template)
                .unwrap_or_else(|_| ProgressStyle::default_spinner()),
        );
        bar.set_message(message.to_string());

        let sized_style = ProgressStyle::with_template(sized_template)
            .unwrap_or_else(|_| ProgressStyle::default_bar())
            .progress_chars("##-");

        Arc::new(Self { bar, sized_style })
    }

    /// Spinner counting relevant records across both phases.
    ///
    /// Census extracts are too large to count up front, so this usually
    /// stays a spinner showing throughput.
    #[must_use]
    pub fn records(multi: &MultiProgress, message: &str) -> Arc<dyn ProgressCallback> {
        Self::spinner(
            multi,
            message,
            "{spinner:.cyan} {msg} {human_pos} records ({per_sec}) [{elapsed_precise}]",
            "  {msg} {wide_bar:.cyan/dim} {human_pos}/{human_len} {percent}% [{eta}]",
        )
    }

    /// Bar advancing once per catalog attribute. The total is set by the
    /// range calculator.
    #[must_use]
    pub fn attributes(multi: &MultiProgress, message: &str) -> Arc<dyn ProgressCallback> {
        Self::spinner(
            multi,
            message,
            "{spinner:.yellow} {msg}",
            "  {msg} {wide_bar:.yellow/dim} {pos}/{len} attributes [{eta}]",
        )
    }
}

impl ProgressCallback for IndicatifProgress {
    fn set_total(&self, total: u64) {
        self.bar.set_length(total);
        self.bar.set_position(0);
        self.bar.set_style(self.sized_style.clone());
    }

    fn set_position(&self, pos: u64) {
        self.bar.set_position(pos);
    }

    fn inc(&self, delta: u64) {
        self.bar.inc(delta);
    }

    fn set_message(&self, msg: String) {
        self.bar.set_message(msg);
    }

    fn finish(&self, msg: String) {
        self.bar.finish_with_message(msg);
    }

    fn finish_and_clear(&self) {
        self.bar.finish_and_clear();
    }
}

/// Initializes the global `pretty_env_logger` (filtered by `RUST_LOG`)
/// behind `indicatif-log-bridge`.
///
/// Returns the [`MultiProgress`] that all progress bars must be added to.
#[must_use]
pub fn init_logger() -> MultiProgress {
    let multi = MultiProgress::new();

    let logger = pretty_env_logger::formatted_builder()
        .parse_env("RUST_LOG")
        .build();
    let level = logger.filter();

    // Already set when called twice (tests).
    indicatif_log_bridge::LogWrapper::new(multi.clone(), logger)
        .try_init()
        .ok();

    log::set_max_level(level);

    multi
}
