//! Per-worker byte-rate ledger used for the viewer's ETA.

use std::collections::VecDeque;
use std::time::{Duration, SystemTime};

/// window over which the byte rate is computed
pub const ETA_TIMEFRAME: Duration = Duration::from_secs(2);

#[derive(Debug, Clone, Copy)]
pub struct TransferSample {
    pub at: SystemTime,
    pub bytes: u64,
}

/// Time-ordered list of transfer samples, youngest first.
#[derive(Debug, Default)]
pub struct RateLedger {
    samples: VecDeque<TransferSample>,
}

impl RateLedger {
    pub fn new() -> RateLedger {
        RateLedger { samples: VecDeque::new() }
    }

    /// sorted insert keeping the youngest sample in front
    pub fn record(&mut self, at: SystemTime, bytes: u64) {
        let sample = TransferSample { at, bytes };
        let pos = self.samples.iter().position(|s| s.at <= at).unwrap_or(self.samples.len());
        self.samples.insert(pos, sample);
    }

    /// drop every sample older than the limit
    pub fn trim(&mut self, limit: SystemTime) {
        while let Some(oldest) = self.samples.back() {
            if oldest.at >= limit {
                break;
            }
            self.samples.pop_back();
        }
    }

    /// Mean byte rate over the surviving window.  The oldest sample only
    /// marks the start of the window, so its byte count is not summed.
    pub fn rate(&self) -> u64 {
        if self.samples.len() < 2 {
            return 0;
        }
        let youngest = match self.samples.front() {
            Some(s) => s,
            None => return 0,
        };
        let oldest = match self.samples.back() {
            Some(s) => s,
            None => return 0,
        };
        let span = match youngest.at.duration_since(oldest.at) {
            Ok(span) => span,
            Err(_) => return 0,
        };
        let secs = span.as_secs() as f64 + f64::from(span.subsec_micros()) * 0.000_001;
        if secs <= 0.0 {
            return 0;
        }
        let total: u64 = self.samples.iter().take(self.samples.len() - 1).map(|s| s.bytes).sum();
        (total as f64 / secs) as u64
    }

    pub fn clear(&mut self) {
        self.samples.clear();
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }
}

#[test]
fn test_rate_needs_two_samples() {
    let mut ledger = RateLedger::new();
    assert_eq!(ledger.rate(), 0);
    let now = SystemTime::now();
    ledger.record(now, 1000);
    assert_eq!(ledger.rate(), 0);
}

#[test]
fn test_rate_over_window() {
    let mut ledger = RateLedger::new();
    let start = SystemTime::UNIX_EPOCH + Duration::from_secs(1000);
    ledger.record(start, 0);
    ledger.record(start + Duration::from_secs(1), 4096);
    ledger.record(start + Duration::from_secs(2), 4096);
    // 8192 bytes over 2 seconds; window-start sample contributes no bytes
    assert_eq!(ledger.rate(), 4096);
}

#[test]
fn test_trim_drops_old_tail() {
    let mut ledger = RateLedger::new();
    let start = SystemTime::UNIX_EPOCH + Duration::from_secs(1000);
    ledger.record(start, 10);
    ledger.record(start + Duration::from_secs(5), 20);
    ledger.record(start + Duration::from_secs(6), 30);
    ledger.trim(start + Duration::from_secs(4));
    assert_eq!(ledger.len(), 2);
    ledger.trim(start + Duration::from_secs(10));
    assert_eq!(ledger.len(), 0);
}

#[test]
fn test_record_out_of_order_keeps_sort() {
    let mut ledger = RateLedger::new();
    let start = SystemTime::UNIX_EPOCH + Duration::from_secs(1000);
    ledger.record(start + Duration::from_secs(2), 100);
    ledger.record(start, 50);
    ledger.record(start + Duration::from_secs(1), 75);
    ledger.trim(start + Duration::from_secs(1));
    // the sample at t+0 must have been the tail
    assert_eq!(ledger.len(), 2);
}
