//! Lock-free metrics collection and periodic reporting
//!
//! Uses atomics for hot-path operations to avoid mutex contention.
//! All counter updates are lock-free; reporting is the only operation
//! that needs synchronization (via atomic swap). `snapshot()` reads without
//! resetting and carries the cumulative latency histogram for scrapers.
//!
//! NOTE: All atomics use Relaxed ordering. These are statistical counters only;
//! do NOT use them for coordination or logic decisions.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;
use tracing::info;

/// Exponential bucket boundaries for evaluation latency (milliseconds)
/// Buckets: ≤10, ≤20, ≤40, ≤80, ≤160, ≤320, ≤640, ≤1280, ≤2560, ≤5120, >5120
pub const METRICS_BUCKET_BOUNDS: [u64; 10] = [10, 20, 40, 80, 160, 320, 640, 1280, 2560, 5120];
pub const METRICS_NUM_BUCKETS: usize = 11;

/// Compute bucket index for a latency value using binary search
#[inline]
fn bucket_index(latency_ms: u64) -> usize {
    METRICS_BUCKET_BOUNDS.partition_point(|&bound| bound < latency_ms)
}

/// Update an atomic max value using compare-and-swap loop
#[inline]
fn update_atomic_max(atomic_max: &AtomicU64, new_value: u64) {
    let mut current_max = atomic_max.load(Ordering::Relaxed);
    while new_value > current_max {
        match atomic_max.compare_exchange_weak(
            current_max,
            new_value,
            Ordering::Relaxed,
            Ordering::Relaxed,
        ) {
            Ok(_) => break,
            Err(actual) => current_max = actual,
        }
    }
}

/// Swap all buckets to zero and return their values
#[inline]
fn swap_buckets(buckets: &[AtomicU64; METRICS_NUM_BUCKETS]) -> [u64; METRICS_NUM_BUCKETS] {
    let mut result = [0u64; METRICS_NUM_BUCKETS];
    for (i, bucket) in buckets.iter().enumerate() {
        result[i] = bucket.swap(0, Ordering::Relaxed);
    }
    result
}

/// Read all buckets without resetting them
#[inline]
fn load_buckets(buckets: &[AtomicU64; METRICS_NUM_BUCKETS]) -> [u64; METRICS_NUM_BUCKETS] {
    std::array::from_fn(|i| buckets[i].load(Ordering::Relaxed))
}

/// Compute percentile from histogram buckets
/// Returns the upper bound of the bucket containing the percentile
fn percentile_from_buckets(buckets: &[u64; METRICS_NUM_BUCKETS], percentile: f64) -> u64 {
    let total: u64 = buckets.iter().sum();
    if total == 0 {
        return 0;
    }

    let target = (total as f64 * percentile) as u64;
    let mut cumulative = 0u64;

    // Last bucket uses 2x the previous bound
    const BUCKET_UPPER_BOUNDS: [u64; METRICS_NUM_BUCKETS] =
        [10, 20, 40, 80, 160, 320, 640, 1280, 2560, 5120, 10240];

    for (i, &count) in buckets.iter().enumerate() {
        cumulative += count;
        if cumulative >= target {
            return BUCKET_UPPER_BOUNDS[i];
        }
    }
    BUCKET_UPPER_BOUNDS[METRICS_NUM_BUCKETS - 1]
}

/// Which cache tier a hit or miss belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheKind {
    Token,
    Geocode,
    Reverse,
}

impl CacheKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            CacheKind::Token => "token",
            CacheKind::Geocode => "geocode",
            CacheKind::Reverse => "reverse",
        }
    }

    fn index(&self) -> usize {
        match self {
            CacheKind::Token => 0,
            CacheKind::Geocode => 1,
            CacheKind::Reverse => 2,
        }
    }
}

const CACHE_KINDS: usize = 3;

/// Lock-free metrics collector
///
/// All recording operations are lock-free using atomics.
/// The `report()` method atomically swaps periodic counters to get a snapshot.
pub struct Metrics {
    /// Location samples delivered by the sensor (monotonic)
    samples_total: AtomicU64,
    /// Sensor-level errors on an active watch (monotonic)
    sensor_errors_total: AtomicU64,
    /// Evaluation requests issued (monotonic)
    evaluations_issued: AtomicU64,
    /// Evaluation results applied to membership (monotonic)
    evaluations_applied: AtomicU64,
    /// Evaluation calls that failed (monotonic)
    evaluations_failed: AtomicU64,
    /// Evaluation responses discarded as out of date (monotonic)
    evaluations_stale: AtomicU64,
    /// Evaluations that reported entry into a new neighborhood (monotonic)
    neighborhoods_entered: AtomicU64,
    /// Evaluations completed since last report (reset on report)
    evaluations_since_report: AtomicU64,
    /// Sum of evaluation latencies in ms (reset on report)
    eval_latency_sum_ms: AtomicU64,
    /// Max evaluation latency in ms (reset on report)
    eval_latency_max_ms: AtomicU64,
    /// Evaluation latency histogram (reset on report)
    eval_latency_buckets: [AtomicU64; METRICS_NUM_BUCKETS],
    /// Sum of evaluation latencies in ms since start (monotonic)
    eval_latency_total_sum_ms: AtomicU64,
    /// Evaluation latency histogram since start (monotonic)
    eval_latency_total_buckets: [AtomicU64; METRICS_NUM_BUCKETS],
    /// Envelopes scheduled (monotonic)
    envelopes_scheduled: AtomicU64,
    /// Envelopes delivered to the sink (monotonic)
    envelopes_delivered: AtomicU64,
    /// Envelopes cancelled before firing (monotonic)
    envelopes_cancelled: AtomicU64,
    /// User events dropped due to channel full (monotonic)
    user_events_dropped: AtomicU64,
    /// Cache hits by tier (monotonic)
    cache_hits: [AtomicU64; CACHE_KINDS],
    /// Cache misses by tier (monotonic)
    cache_misses: [AtomicU64; CACHE_KINDS],
    /// Token fetch failures (monotonic)
    token_fetch_failures: AtomicU64,
    /// Last report time (only accessed from reporter)
    last_report_time: parking_lot::Mutex<Instant>,
}

impl Metrics {
    pub fn new() -> Self {
        Self {
            samples_total: AtomicU64::new(0),
            sensor_errors_total: AtomicU64::new(0),
            evaluations_issued: AtomicU64::new(0),
            evaluations_applied: AtomicU64::new(0),
            evaluations_failed: AtomicU64::new(0),
            evaluations_stale: AtomicU64::new(0),
            neighborhoods_entered: AtomicU64::new(0),
            evaluations_since_report: AtomicU64::new(0),
            eval_latency_sum_ms: AtomicU64::new(0),
            eval_latency_max_ms: AtomicU64::new(0),
            eval_latency_buckets: std::array::from_fn(|_| AtomicU64::new(0)),
            eval_latency_total_sum_ms: AtomicU64::new(0),
            eval_latency_total_buckets: std::array::from_fn(|_| AtomicU64::new(0)),
            envelopes_scheduled: AtomicU64::new(0),
            envelopes_delivered: AtomicU64::new(0),
            envelopes_cancelled: AtomicU64::new(0),
            user_events_dropped: AtomicU64::new(0),
            cache_hits: std::array::from_fn(|_| AtomicU64::new(0)),
            cache_misses: std::array::from_fn(|_| AtomicU64::new(0)),
            token_fetch_failures: AtomicU64::new(0),
            last_report_time: parking_lot::Mutex::new(Instant::now()),
        }
    }

    #[inline]
    pub fn record_sample(&self) {
        self.samples_total.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_sensor_error(&self) {
        self.sensor_errors_total.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_evaluation_issued(&self) {
        self.evaluations_issued.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a completed evaluation round trip (success or failure)
    #[inline]
    pub fn record_evaluation_latency(&self, latency_ms: u64) {
        self.evaluations_since_report.fetch_add(1, Ordering::Relaxed);
        self.eval_latency_sum_ms.fetch_add(latency_ms, Ordering::Relaxed);
        update_atomic_max(&self.eval_latency_max_ms, latency_ms);
        self.eval_latency_total_sum_ms.fetch_add(latency_ms, Ordering::Relaxed);
        let bucket = bucket_index(latency_ms);
        self.eval_latency_buckets[bucket].fetch_add(1, Ordering::Relaxed);
        self.eval_latency_total_buckets[bucket].fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_evaluation_applied(&self, entered_new: bool) {
        self.evaluations_applied.fetch_add(1, Ordering::Relaxed);
        if entered_new {
            self.neighborhoods_entered.fetch_add(1, Ordering::Relaxed);
        }
    }

    #[inline]
    pub fn record_evaluation_failed(&self) {
        self.evaluations_failed.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_evaluation_stale(&self) {
        self.evaluations_stale.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_envelopes_scheduled(&self, count: u64) {
        self.envelopes_scheduled.fetch_add(count, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_envelope_delivered(&self) {
        self.envelopes_delivered.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_envelopes_cancelled(&self, count: u64) {
        self.envelopes_cancelled.fetch_add(count, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_user_event_dropped(&self) {
        self.user_events_dropped.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_cache_hit(&self, kind: CacheKind) {
        self.cache_hits[kind.index()].fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_cache_miss(&self, kind: CacheKind) {
        self.cache_misses[kind.index()].fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_token_fetch_failure(&self) {
        self.token_fetch_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn cache_hits(&self, kind: CacheKind) -> u64 {
        self.cache_hits[kind.index()].load(Ordering::Relaxed)
    }

    pub fn cache_misses(&self, kind: CacheKind) -> u64 {
        self.cache_misses[kind.index()].load(Ordering::Relaxed)
    }

    pub fn evaluations_stale(&self) -> u64 {
        self.evaluations_stale.load(Ordering::Relaxed)
    }

    pub fn envelopes_cancelled(&self) -> u64 {
        self.envelopes_cancelled.load(Ordering::Relaxed)
    }

    /// Generate a summary report, resetting the periodic latency counters
    pub fn report(&self) -> MetricsSummary {
        let eval_count = self.evaluations_since_report.swap(0, Ordering::Relaxed);
        let latency_sum = self.eval_latency_sum_ms.swap(0, Ordering::Relaxed);
        let latency_max = self.eval_latency_max_ms.swap(0, Ordering::Relaxed);
        let lat_buckets = swap_buckets(&self.eval_latency_buckets);

        let elapsed = {
            let mut last = self.last_report_time.lock();
            let elapsed = last.elapsed();
            *last = Instant::now();
            elapsed
        };

        let evaluations_per_sec = rate(eval_count, elapsed.as_secs_f64());
        self.summarize(eval_count, latency_sum, latency_max, lat_buckets, evaluations_per_sec)
    }

    /// Read every counter without resetting anything
    ///
    /// Latency figures cover the whole process lifetime so the exported
    /// histogram stays cumulative; the max is the current report window's.
    pub fn snapshot(&self) -> MetricsSummary {
        let lat_buckets = load_buckets(&self.eval_latency_total_buckets);
        let eval_count: u64 = lat_buckets.iter().sum();
        let latency_sum = self.eval_latency_total_sum_ms.load(Ordering::Relaxed);
        let latency_max = self.eval_latency_max_ms.load(Ordering::Relaxed);

        let since_report = self.evaluations_since_report.load(Ordering::Relaxed);
        let elapsed = self.last_report_time.lock().elapsed();
        let evaluations_per_sec = rate(since_report, elapsed.as_secs_f64());

        self.summarize(eval_count, latency_sum, latency_max, lat_buckets, evaluations_per_sec)
    }

    fn summarize(
        &self,
        eval_count: u64,
        latency_sum: u64,
        latency_max: u64,
        lat_buckets: [u64; METRICS_NUM_BUCKETS],
        evaluations_per_sec: f64,
    ) -> MetricsSummary {
        let load = |a: &AtomicU64| a.load(Ordering::Relaxed);

        MetricsSummary {
            samples_total: load(&self.samples_total),
            sensor_errors_total: load(&self.sensor_errors_total),
            evaluations_issued: load(&self.evaluations_issued),
            evaluations_applied: load(&self.evaluations_applied),
            evaluations_failed: load(&self.evaluations_failed),
            evaluations_stale: load(&self.evaluations_stale),
            neighborhoods_entered: load(&self.neighborhoods_entered),
            evaluations_per_sec,
            eval_latency_avg_ms: if eval_count > 0 { latency_sum / eval_count } else { 0 },
            eval_latency_sum_ms: latency_sum,
            eval_latency_max_ms: latency_max,
            eval_latency_p99_ms: percentile_from_buckets(&lat_buckets, 0.99),
            eval_latency_buckets: lat_buckets,
            envelopes_scheduled: load(&self.envelopes_scheduled),
            envelopes_delivered: load(&self.envelopes_delivered),
            envelopes_cancelled: load(&self.envelopes_cancelled),
            user_events_dropped: load(&self.user_events_dropped),
            cache_hits: std::array::from_fn(|i| load(&self.cache_hits[i])),
            cache_misses: std::array::from_fn(|i| load(&self.cache_misses[i])),
            token_fetch_failures: load(&self.token_fetch_failures),
        }
    }
}

fn rate(count: u64, secs: f64) -> f64 {
    if secs > 0.0 {
        count as f64 / secs
    } else {
        0.0
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

/// Snapshot of metrics at report time
#[derive(Debug, Clone)]
pub struct MetricsSummary {
    pub samples_total: u64,
    pub sensor_errors_total: u64,
    pub evaluations_issued: u64,
    pub evaluations_applied: u64,
    pub evaluations_failed: u64,
    pub evaluations_stale: u64,
    pub neighborhoods_entered: u64,
    pub evaluations_per_sec: f64,
    pub eval_latency_avg_ms: u64,
    pub eval_latency_sum_ms: u64,
    pub eval_latency_max_ms: u64,
    pub eval_latency_p99_ms: u64,
    /// Bounds: ≤10, ≤20, ≤40, ≤80, ≤160, ≤320, ≤640, ≤1280, ≤2560, ≤5120, >5120 ms
    pub eval_latency_buckets: [u64; METRICS_NUM_BUCKETS],
    pub envelopes_scheduled: u64,
    pub envelopes_delivered: u64,
    pub envelopes_cancelled: u64,
    pub user_events_dropped: u64,
    /// Indexed token, geocode, reverse
    pub cache_hits: [u64; CACHE_KINDS],
    pub cache_misses: [u64; CACHE_KINDS],
    pub token_fetch_failures: u64,
}

impl MetricsSummary {
    pub fn cache_hits_for(&self, kind: CacheKind) -> u64 {
        self.cache_hits[kind.index()]
    }

    pub fn cache_misses_for(&self, kind: CacheKind) -> u64 {
        self.cache_misses[kind.index()]
    }

    pub fn log(&self) {
        info!(
            samples_total = %self.samples_total,
            sensor_errors = %self.sensor_errors_total,
            evaluations_issued = %self.evaluations_issued,
            evaluations_applied = %self.evaluations_applied,
            evaluations_failed = %self.evaluations_failed,
            evaluations_stale = %self.evaluations_stale,
            neighborhoods_entered = %self.neighborhoods_entered,
            evaluations_per_sec = format!("{:.2}", self.evaluations_per_sec),
            eval_avg_ms = %self.eval_latency_avg_ms,
            eval_p99_ms = %self.eval_latency_p99_ms,
            envelopes_delivered = %self.envelopes_delivered,
            envelopes_cancelled = %self.envelopes_cancelled,
            token_cache_hits = %self.cache_hits_for(CacheKind::Token),
            geocode_cache_hits = %self.cache_hits_for(CacheKind::Geocode),
            reverse_cache_hits = %self.cache_hits_for(CacheKind::Reverse),
            "metrics"
        );
    }
}
