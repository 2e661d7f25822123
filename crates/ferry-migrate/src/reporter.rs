//! Terminal progress for migration and verification runs.
//!
//! One counter bar tracks finished units and one spinner per in-flight unit
//! shows the stage it is in. A hidden reporter keeps the same API for tests
//! and non-interactive runs.

use indicatif::{MultiProgress, ProgressBar, ProgressDrawTarget, ProgressStyle};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

fn spinner_style() -> ProgressStyle {
    ProgressStyle::with_template("  {spinner:.cyan} {prefix:.bold} {msg}")
        .unwrap_or_else(|_| ProgressStyle::default_spinner())
}

fn counter_style() -> ProgressStyle {
    ProgressStyle::with_template("{msg} [{bar:40.cyan/blue}] {pos}/{len} units ({percent}%)")
        .map(|s| s.progress_chars("#>-"))
        .unwrap_or_else(|_| ProgressStyle::default_bar())
}

/// Progress reporter shared by unit workers.
#[derive(Debug, Clone)]
pub struct MigrationProgress {
    multi: Arc<MultiProgress>,
    overall: Arc<Mutex<Option<ProgressBar>>>,
    units: Arc<Mutex<HashMap<String, ProgressBar>>>,
}

impl MigrationProgress {
    /// Creates a reporter drawing to stderr.
    pub fn new() -> Self {
        Self::with_progress(true)
    }

    /// Creates a reporter, hidden when `enabled` is false.
    pub fn with_progress(enabled: bool) -> Self {
        let multi = if enabled {
            MultiProgress::new()
        } else {
            MultiProgress::with_draw_target(ProgressDrawTarget::hidden())
        };
        Self {
            multi: Arc::new(multi),
            overall: Arc::new(Mutex::new(None)),
            units: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Starts the unit counter.
    pub fn start(&self, total_units: u64, message: &str) {
        let bar = self.multi.add(ProgressBar::new(total_units));
        bar.set_style(counter_style());
        bar.set_message(message.to_string());
        *self.overall.lock().unwrap_or_else(|e| e.into_inner()) = Some(bar);
    }

    /// Shows `stage` on the unit's spinner, creating it on first use.
    pub fn stage(&self, unit_id: &str, stage: &str) {
        let mut units = self.units.lock().unwrap_or_else(|e| e.into_inner());
        let bar = units.entry(unit_id.to_string()).or_insert_with(|| {
            let bar = self.multi.add(ProgressBar::new_spinner());
            bar.set_style(spinner_style());
            bar.set_prefix(unit_id.to_string());
            bar.enable_steady_tick(Duration::from_millis(100));
            bar
        });
        bar.set_message(stage.to_string());
    }

    /// Removes the unit's spinner and advances the counter.
    pub fn finish_unit(&self, unit_id: &str) {
        if let Some(bar) = self
            .units
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(unit_id)
        {
            bar.finish_and_clear();
        }
        if let Some(bar) = self.overall.lock().unwrap_or_else(|e| e.into_inner()).as_ref() {
            bar.inc(1);
        }
    }

    /// Number of units with a visible spinner.
    pub fn in_flight(&self) -> usize {
        self.units.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    /// Finishes all progress bars.
    pub fn finish_all(&self, message: &str) {
        for (_, bar) in self.units.lock().unwrap_or_else(|e| e.into_inner()).drain() {
            bar.finish_and_clear();
        }
        if let Some(bar) = self.overall.lock().unwrap_or_else(|e| e.into_inner()).take() {
            bar.finish_with_message(message.to_string());
        }
    }
}

impl Default for MigrationProgress {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hidden_progress_lifecycle() {
        let progress = MigrationProgress::with_progress(false);
        progress.start(2, "Migrating");

        progress.stage("alpha", "downloading");
        progress.stage("beta", "enumerating");
        progress.stage("alpha", "archiving");
        assert_eq!(progress.in_flight(), 2);

        progress.finish_unit("alpha");
        assert_eq!(progress.in_flight(), 1);

        progress.finish_all("Done");
        assert_eq!(progress.in_flight(), 0);
    }

    #[test]
    fn test_finish_unknown_unit() {
        let progress = MigrationProgress::with_progress(false);
        progress.finish_unit("missing");
        assert_eq!(progress.in_flight(), 0);
    }
}
