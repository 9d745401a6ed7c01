//! Cooperative yield-point bookkeeping (§5: "a single cooperative task...
//! must yield to its host so progress callbacks and cancellation signals
//! can be serviced"). This pipeline is deliberately single-threaded, so
//! there is no pool to size, only a tick counter; it stays its own module,
//! kept out of the algorithm modules that use it.

use indicatif::{ProgressBar, ProgressStyle};

/// Fires every `interval` ticks. The orchestrator's scan loop calls
/// [`Ticker::tick`] once per base pointer; a `true` result means this is a
/// yield point where the host's `EventSink` should be polled/notified.
pub struct Ticker {
    interval: usize,
    count: usize,
}

impl Ticker {
    pub fn new(interval: usize) -> Self {
        Ticker {
            interval: interval.max(1),
            count: 0,
        }
    }

    /// Advance by one unit of work, returning `true` on every `interval`-th
    /// call (a yield point).
    pub fn tick(&mut self) -> bool {
        self.count += 1;
        self.count % self.interval == 0
    }

    pub fn count(&self) -> usize {
        self.count
    }
}

/// Builds the base-pointer scan progress bar, gated so non-interactive/test
/// runs don't pay for anything beyond a hidden bar (`ProgressBar::hidden`).
pub fn scan_progress_bar(total: u64, visible: bool) -> ProgressBar {
    if !visible || total == 0 {
        return ProgressBar::hidden();
    }
    let pb = ProgressBar::new(total);
    pb.set_style(
        ProgressStyle::with_template("[{elapsed_precise}] {bar:40} {pos}/{len} base pointers {msg}")
            .unwrap()
            .progress_chars("=>-"),
    );
    pb
}
