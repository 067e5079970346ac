//! Catch-up synchronizer: backfill from the master's range read.
//!
//! After a restart the secondary pulls every entry above its apply cursor
//! and feeds it through the same apply path as live replication. Entries it
//! already holds are dedup hits, so racing with live traffic is harmless.
//!
//! ```text
//! Secondary                                 Master
//!   │── fetch_entries(from = cursor+1, n) ──▶│
//!   │◀── [e(cursor+1) .. e(cursor+n)] ───────│
//!   │   apply each                           │
//!   │── fetch_entries(from = last+1, n) ────▶│
//!   │◀── short or empty page ────────────────│  done
//! ```
//!
//! A failed fetch is retried with backoff; after the configured number of
//! attempts catch-up gives up and live replication fills the rest.

use tracing::{debug, info, warn};

use super::store::ApplyOutcome;
use crate::config::BackoffConfig;
use crate::error::SecondaryError;
use crate::time::TimeProvider;
use crate::transport::MasterSource;
use crate::types::{LogEntry, RangeQuery};

/// Counters from one catch-up run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CatchUpReport {
    /// Pages requested, including the final short or empty one.
    pub pages: usize,
    /// Entries received from the master.
    pub fetched: usize,
    /// Entries that advanced the apply cursor.
    pub applied: usize,
    /// Entries persisted but still waiting behind a gap.
    pub buffered: usize,
    /// Entries that were already held.
    pub duplicates: usize,
}

/// Paged catch-up against a [`MasterSource`].
#[derive(Debug, Clone)]
pub struct CatchUpSync<P: TimeProvider> {
    page_size: usize,
    attempts: u32,
    backoff: BackoffConfig,
    time: P,
}

impl<P: TimeProvider> CatchUpSync<P> {
    /// Create a synchronizer; `page_size` and `attempts` are at least 1.
    pub fn new(page_size: usize, attempts: u32, backoff: BackoffConfig, time: P) -> Self {
        Self {
            page_size: page_size.max(1),
            attempts: attempts.max(1),
            backoff,
            time,
        }
    }

    /// Fetch everything above `cursor` and hand each entry to `apply`.
    pub async fn run<M, F>(
        &self,
        source: &M,
        cursor: u64,
        mut apply: F,
    ) -> Result<CatchUpReport, SecondaryError>
    where
        M: MasterSource + ?Sized,
        F: FnMut(LogEntry) -> Result<ApplyOutcome, SecondaryError>,
    {
        let mut report = CatchUpReport::default();
        let mut from_seq = cursor + 1;
        info!(from_seq, page_size = self.page_size, "catch-up started");

        loop {
            let page = self
                .fetch(
                    source,
                    RangeQuery {
                        from_seq,
                        limit: self.page_size,
                    },
                )
                .await?;
            report.pages += 1;
            report.fetched += page.len();

            let full = page.len() >= self.page_size;
            let Some(last) = page.last().map(|e| e.seq) else {
                break;
            };
            for entry in page {
                match apply(entry)? {
                    ApplyOutcome::Applied { .. } => report.applied += 1,
                    ApplyOutcome::Buffered => report.buffered += 1,
                    ApplyOutcome::Duplicate => report.duplicates += 1,
                }
            }
            debug!(from_seq, last, "catch-up page applied");

            if !full {
                break;
            }
            from_seq = last + 1;
        }

        info!(
            pages = report.pages,
            fetched = report.fetched,
            applied = report.applied,
            duplicates = report.duplicates,
            "catch-up complete"
        );
        Ok(report)
    }

    async fn fetch<M>(&self, source: &M, query: RangeQuery) -> Result<Vec<LogEntry>, SecondaryError>
    where
        M: MasterSource + ?Sized,
    {
        let mut attempt = 0;
        loop {
            attempt += 1;
            match source.fetch_entries(query).await {
                Ok(page) => return Ok(page),
                Err(e) if attempt >= self.attempts => {
                    warn!(from_seq = query.from_seq, attempt, error = %e, "catch-up giving up");
                    return Err(SecondaryError::CatchUp(e));
                }
                Err(e) => {
                    let delay = self.backoff.delay(attempt);
                    warn!(
                        from_seq = query.from_seq,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "catch-up fetch failed, retrying"
                    );
                    self.time.sleep(delay).await;
                }
            }
        }
    }
}
