//! Internal metrics for the link, gated by the `statistics` config key.
//!
//! Counters are plain relaxed atomics updated from producers, workers and the
//! event loop; a snapshot is folded into the status JSON on demand. When
//! statistics are disabled every update is a no-op so the hot paths carry no
//! cost beyond a branch.

use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};

use serde::Serialize;

use crate::queue::QueryKind;

/// One counter per query kind plus the aggregate counters the original
/// status output reports.
#[derive(Debug, Default)]
pub struct LinkStats {
    enabled: bool,

    queries_queued: AtomicU32,
    queries_dispatched: AtomicU32,
    cloud_req_recvd: AtomicU32,
    cloud_req_err: AtomicU32,
    pubacks: AtomicU32,

    queries_per_type: [AtomicU32; QueryKind::COUNT],

    /// HTTP query execution time, microseconds.
    query_time_total_us: AtomicU64,
    query_time_max_us: AtomicU64,
    query_count: AtomicU64,
}

#[derive(Debug, Clone, Serialize, Default, PartialEq, Eq)]
pub struct StatsSnapshot {
    pub queries_queued: u32,
    pub queries_dispatched: u32,
    pub cloud_req_recvd: u32,
    pub cloud_req_err: u32,
    pub pubacks: u32,
    pub queries_per_type: Vec<(String, u32)>,
    pub query_time_avg_us: u64,
    pub query_time_max_us: u64,
}

impl LinkStats {
    pub fn new(enabled: bool) -> Self {
        Self {
            enabled,
            ..Default::default()
        }
    }

    pub fn enabled(&self) -> bool {
        self.enabled
    }

    pub fn query_queued(&self, kind: QueryKind) {
        if !self.enabled {
            return;
        }
        self.queries_queued.fetch_add(1, Ordering::Relaxed);
        self.queries_per_type[kind as usize].fetch_add(1, Ordering::Relaxed);
    }

    pub fn query_dispatched(&self) {
        if self.enabled {
            self.queries_dispatched.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn cloud_request_received(&self) {
        if self.enabled {
            self.cloud_req_recvd.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn cloud_request_error(&self) {
        if self.enabled {
            self.cloud_req_err.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn puback(&self) {
        if self.enabled {
            self.pubacks.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn query_executed(&self, elapsed_us: u64) {
        if !self.enabled {
            return;
        }
        self.query_time_total_us.fetch_add(elapsed_us, Ordering::Relaxed);
        self.query_count.fetch_add(1, Ordering::Relaxed);
        self.query_time_max_us.fetch_max(elapsed_us, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        let count = self.query_count.load(Ordering::Relaxed);
        StatsSnapshot {
            queries_queued: self.queries_queued.load(Ordering::Relaxed),
            queries_dispatched: self.queries_dispatched.load(Ordering::Relaxed),
            cloud_req_recvd: self.cloud_req_recvd.load(Ordering::Relaxed),
            cloud_req_err: self.cloud_req_err.load(Ordering::Relaxed),
            pubacks: self.pubacks.load(Ordering::Relaxed),
            queries_per_type: QueryKind::ALL
                .iter()
                .map(|kind| {
                    (
                        kind.name().to_string(),
                        self.queries_per_type[*kind as usize].load(Ordering::Relaxed),
                    )
                })
                .collect(),
            query_time_avg_us: if count > 0 {
                self.query_time_total_us.load(Ordering::Relaxed) / count
            } else {
                0
            },
            query_time_max_us: self.query_time_max_us.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn disabled_stats_stay_zero() {
        let stats = LinkStats::new(false);
        stats.query_queued(QueryKind::HttpApiV2);
        stats.puback();
        let snap = stats.snapshot();
        assert_eq!(snap.queries_queued, 0);
        assert_eq!(snap.pubacks, 0);
    }

    #[test]
    fn enabled_stats_count_per_type() {
        let stats = LinkStats::new(true);
        stats.query_queued(QueryKind::HttpApiV2);
        stats.query_queued(QueryKind::HttpApiV2);
        stats.query_queued(QueryKind::NodeStateUpdate);
        stats.query_executed(100);
        stats.query_executed(300);
        let snap = stats.snapshot();
        assert_eq!(snap.queries_queued, 3);
        assert_eq!(snap.query_time_avg_us, 200);
        assert_eq!(snap.query_time_max_us, 300);
        let http = snap
            .queries_per_type
            .iter()
            .find(|(name, _)| name == "http_api_request_v2")
            .unwrap();
        assert_eq!(http.1, 2);
    }
}
