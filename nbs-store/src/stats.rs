//! Read/write accounting.
//!
//! Accumulates counters for a [`crate::store::NomsBlockStore`] session and
//! renders a custom `Debug` summary with derived rates (MB/s, read
//! coalescing ratio) rather than dumping raw counters.

use std::fmt;
use std::time::Instant;

#[derive(Default)]
pub struct StoreStats {
    pub chunks_written: u64,
    pub bytes_written: u64,
    pub chunks_deduped: u64,
    pub chunks_read: u64,
    pub bytes_read: u64,
    pub reads_issued: u64,
    pub tables_conjoined: u64,
    start: Option<Instant>,
}

impl StoreStats {
    pub fn new() -> Self {
        StoreStats {
            start: Some(Instant::now()),
            ..Default::default()
        }
    }

    pub fn record_write(&mut self, len: usize, deduped: bool) {
        self.chunks_written += 1;
        self.bytes_written += len as u64;
        if deduped {
            self.chunks_deduped += 1;
        }
    }

    pub fn record_read(&mut self, len: usize) {
        self.chunks_read += 1;
        self.bytes_read += len as u64;
    }

    pub fn record_physical_read(&mut self) {
        self.reads_issued += 1;
    }

    pub fn record_conjoin(&mut self, table_count: u64) {
        self.tables_conjoined += table_count;
    }

    /// Average number of chunks served per physical read issued, a measure
    /// of how effectively reads were coalesced.
    pub fn read_coalescing_ratio(&self) -> f64 {
        if self.reads_issued == 0 {
            0.0
        } else {
            self.chunks_read as f64 / self.reads_issued as f64
        }
    }
}

impl fmt::Debug for StoreStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let elapsed = self.start.map(|s| s.elapsed().as_secs_f64()).unwrap_or(0.0);
        let write_rate = if elapsed > 0.0 {
            self.bytes_written as f64 / elapsed / 1_000_000.0
        } else {
            0.0
        };
        write!(
            f,
            "wrote {} chunks ({} bytes, {} deduped, {:.2} MB/s), \
             read {} chunks ({} bytes over {} physical reads, {:.1}x coalesced), \
             conjoined {} tables",
            self.chunks_written,
            self.bytes_written,
            self.chunks_deduped,
            write_rate,
            self.chunks_read,
            self.bytes_read,
            self.reads_issued,
            self.read_coalescing_ratio(),
            self.tables_conjoined,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn coalescing_ratio_avoids_div_by_zero() {
        let stats = StoreStats::default();
        assert_eq!(stats.read_coalescing_ratio(), 0.0);
    }

    #[test]
    fn dedup_counted_separately_from_writes() {
        let mut stats = StoreStats::default();
        stats.record_write(10, false);
        stats.record_write(10, true);
        assert_eq!(stats.chunks_written, 2);
        assert_eq!(stats.chunks_deduped, 1);
    }
}
