// Copyright 2025 Frameflow Contributors
// SPDX-License-Identifier: Apache-2.0

/*!
Opt-in performance sampling.

Worker threads timestamp named milestones as frames pass through them; a
periodic [`ReportLoop`] aggregates the series into latency and throughput
statistics and logs a human-readable report. Recording is append-only
behind a short per-series lock, so the write side never contends with the
report loop for long.
*/

use ahash::AHashMap;
use parking_lot::{Mutex, RwLock};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tracing::{info, warn};

/// Aggregated statistics over one (start, end) milestone pair.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PerfStats {
    /// Number of paired samples.
    pub count: usize,
    pub mean_latency: Duration,
    pub max_latency: Duration,
    /// Completed pairs per second over the observed window.
    pub throughput: f64,
}

struct MilestoneSeries {
    key_field: String,
    names: Vec<String>,
    samples: Mutex<AHashMap<String, Vec<Instant>>>,
}

/// Milestone store keyed by worker-thread tag.
#[derive(Default)]
pub struct PerfSampler {
    series: RwLock<AHashMap<String, Arc<MilestoneSeries>>>,
}

impl PerfSampler {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Declares the milestone set one worker thread will record under
    /// `tag`. Returns false when the tag is already registered.
    pub fn register_milestones(&self, tag: &str, key_field: &str, names: &[&str]) -> bool {
        let mut series = self.series.write();
        if series.contains_key(tag) {
            return false;
        }
        let mut samples = AHashMap::new();
        for name in names {
            samples.insert((*name).to_string(), Vec::new());
        }
        series.insert(
            tag.to_string(),
            Arc::new(MilestoneSeries {
                key_field: key_field.to_string(),
                names: names.iter().map(|n| (*n).to_string()).collect(),
                samples: Mutex::new(samples),
            }),
        );
        true
    }

    /// Appends one timestamp. Returns false for an unregistered tag or
    /// milestone name.
    pub fn record(&self, tag: &str, milestone: &str, at: Instant) -> bool {
        let series = match self.series.read().get(tag) {
            Some(series) => Arc::clone(series),
            None => return false,
        };
        let mut samples = series.samples.lock();
        match samples.get_mut(milestone) {
            Some(points) => {
                points.push(at);
                true
            }
            None => false,
        }
    }

    /// Records a milestone stamped "now".
    pub fn record_now(&self, tag: &str, milestone: &str) -> bool {
        self.record(tag, milestone, Instant::now())
    }

    pub fn tags(&self) -> Vec<String> {
        let mut tags: Vec<String> = self.series.read().keys().cloned().collect();
        tags.sort();
        tags
    }

    pub fn key_field(&self, tag: &str) -> Option<String> {
        self.series.read().get(tag).map(|s| s.key_field.clone())
    }

    pub fn milestone_names(&self, tag: &str) -> Option<Vec<String>> {
        self.series.read().get(tag).map(|s| s.names.clone())
    }

    /// Pairs the i-th `start` sample with the i-th `end` sample and
    /// derives count, latency and throughput. `None` when the tag or
    /// either milestone is unknown, or no complete pair exists yet.
    pub fn aggregate(&self, tag: &str, start: &str, end: &str) -> Option<PerfStats> {
        let series = Arc::clone(self.series.read().get(tag)?);
        let samples = series.samples.lock();
        let starts = samples.get(start)?;
        let ends = samples.get(end)?;
        let count = starts.len().min(ends.len());
        if count == 0 {
            return None;
        }

        let mut total = Duration::ZERO;
        let mut max = Duration::ZERO;
        for i in 0..count {
            let latency = ends[i].saturating_duration_since(starts[i]);
            total += latency;
            max = max.max(latency);
        }
        let window = ends[count - 1].saturating_duration_since(starts[0]);
        let throughput = if window.is_zero() {
            0.0
        } else {
            count as f64 / window.as_secs_f64()
        };

        Some(PerfStats {
            count,
            mean_latency: total / count as u32,
            max_latency: max,
            throughput,
        })
    }
}

/// One titled (start, end) milestone pair the report loop prints.
#[derive(Debug, Clone)]
pub struct ReportSection {
    pub title: String,
    pub start: String,
    pub end: String,
}

impl ReportSection {
    pub fn new(title: &str, start: &str, end: &str) -> Self {
        Self {
            title: title.to_string(),
            start: start.to_string(),
            end: end.to_string(),
        }
    }
}

/// Granularity of the stop-flag check inside the report loop's sleep.
const STOP_POLL: Duration = Duration::from_millis(50);

/// Background thread that periodically logs aggregated statistics for
/// every registered thread tag. Stopped with a signal and a join; it never
/// outlives the module that started it.
pub struct ReportLoop {
    stop: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl ReportLoop {
    pub fn start(
        label: String,
        sampler: Arc<PerfSampler>,
        interval: Duration,
        sections: Vec<ReportSection>,
    ) -> Self {
        let stop = Arc::new(AtomicBool::new(false));
        let stop_flag = Arc::clone(&stop);
        let thread_name = format!("perf-report-{label}");

        let handle = thread::Builder::new()
            .name(thread_name.clone())
            .spawn(move || {
                while !stop_flag.load(Ordering::Relaxed) {
                    let wake = Instant::now() + interval;
                    while Instant::now() < wake {
                        if stop_flag.load(Ordering::Relaxed) {
                            return;
                        }
                        thread::sleep(STOP_POLL.min(interval));
                    }
                    Self::emit(&label, &sampler, &sections);
                }
            });

        let handle = match handle {
            Ok(handle) => Some(handle),
            Err(e) => {
                warn!(thread = %thread_name, "failed to spawn report loop: {e}");
                None
            }
        };

        Self { stop, handle }
    }

    fn emit(label: &str, sampler: &PerfSampler, sections: &[ReportSection]) {
        info!("==== [{label}] performance report ====");
        for section in sections {
            for tag in sampler.tags() {
                if let Some(stats) = sampler.aggregate(&tag, &section.start, &section.end) {
                    info!(
                        "[{label}] {} / {tag}: count={} mean={:.3}ms max={:.3}ms throughput={:.1}/s",
                        section.title,
                        stats.count,
                        stats.mean_latency.as_secs_f64() * 1e3,
                        stats.max_latency.as_secs_f64() * 1e3,
                        stats.throughput,
                    );
                }
            }
        }
    }

    /// Signals the loop to stop and joins it.
    pub fn stop(&mut self) {
        self.stop.store(true, Ordering::Relaxed);
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                warn!("report loop panicked before join");
            }
        }
    }

    pub fn is_running(&self) -> bool {
        self.handle.as_ref().map_or(false, |h| !h.is_finished())
    }
}

impl Drop for ReportLoop {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn aggregate_pairs_in_order() {
        let sampler = PerfSampler::new();
        assert!(sampler.register_milestones("th_0", "pts", &["infer_start", "infer_end"]));
        assert!(!sampler.register_milestones("th_0", "pts", &["infer_start"]));

        let t0 = Instant::now();
        for i in 0..4u64 {
            sampler.record("th_0", "infer_start", t0 + Duration::from_millis(i * 100));
            sampler.record(
                "th_0",
                "infer_end",
                t0 + Duration::from_millis(i * 100 + 10 * (i + 1)),
            );
        }

        let stats = sampler.aggregate("th_0", "infer_start", "infer_end").unwrap();
        assert_eq!(stats.count, 4);
        // Latencies are 10, 20, 30, 40 ms.
        assert_eq!(stats.mean_latency, Duration::from_millis(25));
        assert_eq!(stats.max_latency, Duration::from_millis(40));
        assert!(stats.throughput > 0.0);
    }

    #[test]
    fn unknown_tags_and_milestones_are_rejected() {
        let sampler = PerfSampler::new();
        assert!(!sampler.record_now("ghost", "infer_start"));
        sampler.register_milestones("th_1", "pts", &["a", "b"]);
        assert!(!sampler.record_now("th_1", "c"));
        assert!(sampler.aggregate("th_1", "a", "b").is_none());
    }

    #[test]
    fn report_loop_stops_within_bounded_time() {
        let sampler = PerfSampler::new();
        sampler.register_milestones("th_2", "pts", &["a", "b"]);
        let mut report = ReportLoop::start(
            "test".to_string(),
            Arc::clone(&sampler),
            Duration::from_secs(60),
            vec![ReportSection::new("whole", "a", "b")],
        );
        assert!(report.is_running());

        let begun = Instant::now();
        report.stop();
        assert!(begun.elapsed() < Duration::from_secs(2));
        assert!(!report.is_running());
        // Idempotent.
        report.stop();
    }
}
