//! Memory sampling, pressure classification and batch-size advice.

use anyhow::{Context as _, Result};
use crossbeam::channel::{self, RecvTimeoutError, Sender};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::{Arc, Weak};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};
use sysinfo::{MemoryRefreshKind, Pid, ProcessRefreshKind, ProcessesToUpdate, RefreshKind, System};

const HISTORY_LEN: usize = 100;
const TREND_WINDOW: usize = 10;
const TREND_DELTA_PERCENT: f64 = 5.0;
const BYTES_PER_MB: f64 = 1024.0 * 1024.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MemoryPressure {
    Normal,
    Warning,
    Critical,
    Emergency,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MemoryTrend {
    Increasing,
    Decreasing,
    Stable,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MemorySample {
    pub used_bytes: u64,
    /// What `used_bytes` is measured against: a configured process budget or
    /// the machine's total memory.
    pub limit_bytes: u64,
}

impl MemorySample {
    pub fn percent(&self) -> f64 {
        if self.limit_bytes == 0 {
            0.0
        } else {
            self.used_bytes as f64 / self.limit_bytes as f64 * 100.0
        }
    }

    pub fn available_bytes(&self) -> u64 {
        self.limit_bytes.saturating_sub(self.used_bytes)
    }
}

pub trait MemoryProbe: Send + Sync {
    fn sample(&self) -> Result<MemorySample>;
}

/// Samples real memory through `sysinfo`. With a budget, the process's
/// resident size is measured against it; otherwise system-wide usage is.
pub struct SystemMemoryProbe {
    system: Mutex<System>,
    pid: Option<Pid>,
    budget_bytes: Option<u64>,
}

impl SystemMemoryProbe {
    pub fn new(budget_mb: Option<u64>) -> Self {
        let system = System::new_with_specifics(
            RefreshKind::nothing().with_memory(MemoryRefreshKind::everything()),
        );
        Self {
            system: Mutex::new(system),
            pid: sysinfo::get_current_pid().ok(),
            budget_bytes: budget_mb.map(|mb| mb * 1024 * 1024),
        }
    }
}

impl MemoryProbe for SystemMemoryProbe {
    fn sample(&self) -> Result<MemorySample> {
        let mut system = self.system.lock();
        if let (Some(budget), Some(pid)) = (self.budget_bytes, self.pid) {
            system.refresh_processes_specifics(
                ProcessesToUpdate::Some(&[pid]),
                true,
                ProcessRefreshKind::nothing().with_memory(),
            );
            let process = system
                .process(pid)
                .context("current process is not visible to the memory probe")?;
            return Ok(MemorySample {
                used_bytes: process.memory(),
                limit_bytes: budget,
            });
        }

        system.refresh_memory();
        Ok(MemorySample {
            used_bytes: system.used_memory(),
            limit_bytes: system.total_memory(),
        })
    }
}

#[derive(Debug, Clone)]
pub struct MemoryConfig {
    pub warning_threshold: f64,
    pub critical_threshold: f64,
    pub emergency_threshold: f64,
    pub max_batch_size: usize,
    pub sample_interval: Duration,
    /// How often `wait_for_memory` re-checks.
    pub poll_interval: Duration,
    pub max_memory_mb: Option<u64>,
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self {
            warning_threshold: 70.0,
            critical_threshold: 85.0,
            emergency_threshold: 95.0,
            max_batch_size: 50,
            sample_interval: Duration::from_secs(1),
            poll_interval: Duration::from_millis(100),
            max_memory_mb: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchingStrategy {
    pub recommended_batch_size: usize,
    pub should_reduce_batch: bool,
    pub should_pause: bool,
    pub pressure: MemoryPressure,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MemoryStats {
    pub current: Option<MemorySample>,
    pub current_percent: f64,
    pub peak_percent: f64,
    pub pressure: MemoryPressure,
    pub trend: MemoryTrend,
    pub samples: usize,
}

/// Invoked when sampling crosses the critical threshold. Hooks should free
/// whatever memory they own.
pub type ReliefHook = Arc<dyn Fn(&MemorySample) + Send + Sync>;

struct Sampler {
    stop: Sender<()>,
    thread: JoinHandle<()>,
}

pub struct MemoryGovernor {
    config: MemoryConfig,
    probe: Arc<dyn MemoryProbe>,
    history: Mutex<VecDeque<MemorySample>>,
    pressure: Mutex<MemoryPressure>,
    relief_hooks: Mutex<Vec<ReliefHook>>,
    sampler: Mutex<Option<Sampler>>,
}

impl MemoryGovernor {
    pub fn new(config: MemoryConfig) -> Self {
        let probe = Arc::new(SystemMemoryProbe::new(config.max_memory_mb));
        Self::with_probe(config, probe)
    }

    pub fn with_probe(config: MemoryConfig, probe: Arc<dyn MemoryProbe>) -> Self {
        Self {
            config,
            probe,
            history: Mutex::new(VecDeque::with_capacity(HISTORY_LEN)),
            pressure: Mutex::new(MemoryPressure::Normal),
            relief_hooks: Mutex::new(Vec::new()),
            sampler: Mutex::new(None),
        }
    }

    pub fn config(&self) -> &MemoryConfig {
        &self.config
    }

    pub fn on_relief(&self, hook: ReliefHook) {
        self.relief_hooks.lock().push(hook);
    }

    /// Start periodic sampling on a background thread. Calling it twice is
    /// a no-op.
    pub fn start(self: &Arc<Self>) {
        let mut sampler = self.sampler.lock();
        if sampler.is_some() {
            return;
        }
        let (stop_tx, stop_rx) = channel::bounded::<()>(1);
        let governor: Weak<Self> = Arc::downgrade(self);
        let interval = self.config.sample_interval;
        let spawned = std::thread::Builder::new()
            .name("memory-governor".into())
            .spawn(move || {
                loop {
                    match governor.upgrade() {
                        Some(governor) => {
                            governor.sample();
                        }
                        None => break,
                    }
                    match stop_rx.recv_timeout(interval) {
                        Err(RecvTimeoutError::Timeout) => continue,
                        Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
                    }
                }
            });
        match spawned {
            Ok(thread) => {
                *sampler = Some(Sampler {
                    stop: stop_tx,
                    thread,
                });
                log::debug!("Memory sampling started every {interval:?}");
            }
            Err(error) => log::warn!("Failed to start memory sampling thread: {error}"),
        }
    }

    pub fn stop(&self) {
        let Some(sampler) = self.sampler.lock().take() else {
            return;
        };
        sampler.stop.send(()).ok();
        if sampler.thread.join().is_err() {
            log::warn!("Memory sampling thread panicked");
        }
        log::debug!("Memory sampling stopped");
    }

    pub fn classify(&self, percent: f64) -> MemoryPressure {
        if percent >= self.config.emergency_threshold {
            MemoryPressure::Emergency
        } else if percent >= self.config.critical_threshold {
            MemoryPressure::Critical
        } else if percent >= self.config.warning_threshold {
            MemoryPressure::Warning
        } else {
            MemoryPressure::Normal
        }
    }

    /// Take one sample, record it, and run relief hooks when it is at or
    /// above the critical threshold.
    pub fn sample(&self) -> Option<MemorySample> {
        let sample = match self.probe.sample() {
            Ok(sample) => sample,
            Err(error) => {
                log::debug!("Memory sample failed: {error:#}");
                return self.history.lock().back().copied();
            }
        };

        {
            let mut history = self.history.lock();
            if history.len() == HISTORY_LEN {
                history.pop_front();
            }
            history.push_back(sample);
        }

        let percent = sample.percent();
        let pressure = self.classify(percent);
        let previous = std::mem::replace(&mut *self.pressure.lock(), pressure);
        if previous != pressure {
            log::info!("Memory pressure {previous:?} -> {pressure:?} ({percent:.1}%)");
        }

        if pressure >= MemoryPressure::Critical {
            self.run_relief_hooks(&sample);
        }
        Some(sample)
    }

    fn run_relief_hooks(&self, sample: &MemorySample) {
        let hooks = self.relief_hooks.lock().clone();
        for hook in hooks {
            hook(sample);
        }
    }

    pub fn pressure(&self) -> MemoryPressure {
        *self.pressure.lock()
    }

    /// Whether usage is below the critical threshold. An unreadable probe
    /// counts as safe.
    pub fn is_memory_safe(&self) -> bool {
        self.sample()
            .is_none_or(|sample| sample.percent() < self.config.critical_threshold)
    }

    pub fn batching_strategy(&self) -> BatchingStrategy {
        let max = self.config.max_batch_size.max(1);
        let pressure = self
            .sample()
            .map_or(MemoryPressure::Normal, |sample| self.classify(sample.percent()));
        let (recommended_batch_size, should_pause) = match pressure {
            MemoryPressure::Emergency => (1, true),
            MemoryPressure::Critical => ((max / 4).max(1), false),
            MemoryPressure::Warning => ((max / 2).max(1), false),
            MemoryPressure::Normal => (max, false),
        };
        BatchingStrategy {
            recommended_batch_size,
            should_reduce_batch: recommended_batch_size < max,
            should_pause,
            pressure,
        }
    }

    /// Poll until memory is safe again or `timeout` elapses. Returns whether
    /// memory recovered.
    pub async fn wait_for_memory(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        loop {
            if self.is_memory_safe() {
                return true;
            }
            if Instant::now() >= deadline {
                log::warn!("Memory did not recover within {timeout:?}");
                return false;
            }
            if let Some(sample) = self.history.lock().back().copied() {
                self.run_relief_hooks(&sample);
            }
            smol::Timer::after(self.config.poll_interval).await;
        }
    }

    /// Batch size that fits in the currently available memory with a 30%
    /// reserve, never above `max_batch_size` or `total_files` and never
    /// below one.
    pub fn calculate_optimal_batch_size(&self, avg_file_size_mb: f64, total_files: usize) -> usize {
        let upper = self.config.max_batch_size.min(total_files).max(1);
        let Some(sample) = self.sample() else {
            return upper;
        };
        let usable_bytes = sample.available_bytes() / 10 * 7;
        let per_file_bytes = avg_file_size_mb.max(0.001) * BYTES_PER_MB;
        let fitting = (usable_bytes as f64 / per_file_bytes).floor();
        if !fitting.is_finite() || fitting < 1.0 {
            return 1;
        }
        (fitting as usize).clamp(1, upper)
    }

    pub fn trend(&self) -> MemoryTrend {
        let history = self.history.lock();
        let window: Vec<f64> = history
            .iter()
            .rev()
            .take(TREND_WINDOW)
            .rev()
            .map(MemorySample::percent)
            .collect();
        if window.len() < 4 {
            return MemoryTrend::Stable;
        }
        let half = window.len() / 2;
        let average = |values: &[f64]| values.iter().sum::<f64>() / values.len() as f64;
        let delta = average(&window[half..]) - average(&window[..half]);
        if delta > TREND_DELTA_PERCENT {
            MemoryTrend::Increasing
        } else if delta < -TREND_DELTA_PERCENT {
            MemoryTrend::Decreasing
        } else {
            MemoryTrend::Stable
        }
    }

    pub fn stats(&self) -> MemoryStats {
        let (current, peak_percent, samples) = {
            let history = self.history.lock();
            let peak = history
                .iter()
                .map(MemorySample::percent)
                .fold(0.0_f64, f64::max);
            (history.back().copied(), peak, history.len())
        };
        MemoryStats {
            current,
            current_percent: current.map_or(0.0, |sample| sample.percent()),
            peak_percent,
            pressure: self.pressure(),
            trend: self.trend(),
            samples,
        }
    }
}

impl Drop for MemoryGovernor {
    fn drop(&mut self) {
        if let Some(sampler) = self.sampler.get_mut().take() {
            sampler.stop.send(()).ok();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

    /// Reports a settable percentage of a 1000 MB budget.
    struct FixedProbe {
        percent: AtomicU64,
    }

    impl FixedProbe {
        fn new(percent: u64) -> Arc<Self> {
            Arc::new(Self {
                percent: AtomicU64::new(percent),
            })
        }

        fn set(&self, percent: u64) {
            self.percent.store(percent, Ordering::SeqCst);
        }
    }

    impl MemoryProbe for FixedProbe {
        fn sample(&self) -> Result<MemorySample> {
            let limit_bytes = 1000 * 1024 * 1024;
            Ok(MemorySample {
                used_bytes: limit_bytes / 100 * self.percent.load(Ordering::SeqCst),
                limit_bytes,
            })
        }
    }

    fn governor(probe: Arc<FixedProbe>) -> MemoryGovernor {
        MemoryGovernor::with_probe(
            MemoryConfig {
                max_batch_size: 40,
                poll_interval: Duration::from_millis(1),
                ..Default::default()
            },
            probe,
        )
    }

    #[test]
    fn test_batching_strategy_by_pressure() {
        let probe = FixedProbe::new(10);
        let governor = governor(probe.clone());

        let strategy = governor.batching_strategy();
        assert_eq!(strategy.recommended_batch_size, 40);
        assert!(!strategy.should_reduce_batch);

        probe.set(75);
        assert_eq!(governor.batching_strategy().recommended_batch_size, 20);

        probe.set(90);
        let strategy = governor.batching_strategy();
        assert_eq!(strategy.recommended_batch_size, 10);
        assert!(!strategy.should_pause);
        assert!(!governor.is_memory_safe());

        probe.set(97);
        let strategy = governor.batching_strategy();
        assert_eq!(strategy.recommended_batch_size, 1);
        assert!(strategy.should_pause);
        assert_eq!(strategy.pressure, MemoryPressure::Emergency);
    }

    #[test]
    fn test_critical_sample_runs_relief_hooks() {
        let probe = FixedProbe::new(50);
        let governor = governor(probe.clone());
        let calls = Arc::new(AtomicUsize::new(0));
        let hook_calls = calls.clone();
        governor.on_relief(Arc::new(move |_| {
            hook_calls.fetch_add(1, Ordering::SeqCst);
        }));

        governor.sample();
        assert_eq!(calls.load(Ordering::SeqCst), 0);
        probe.set(86);
        governor.sample();
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(governor.pressure(), MemoryPressure::Critical);
    }

    #[test]
    fn test_wait_for_memory() {
        let probe = FixedProbe::new(90);
        let governor = governor(probe.clone());
        assert!(!smol::block_on(governor.wait_for_memory(Duration::from_millis(5))));

        // A relief hook that frees memory lets the wait succeed.
        let relieved = probe.clone();
        governor.on_relief(Arc::new(move |_| relieved.set(20)));
        assert!(smol::block_on(governor.wait_for_memory(Duration::from_secs(5))));
    }

    #[test]
    fn test_optimal_batch_size() {
        let probe = FixedProbe::new(90);
        let governor = governor(probe.clone());
        // 100 MB free, 70 MB usable, 10 MB per file.
        assert_eq!(governor.calculate_optimal_batch_size(10.0, 100), 7);
        assert_eq!(governor.calculate_optimal_batch_size(10.0, 3), 3);
        assert_eq!(governor.calculate_optimal_batch_size(500.0, 100), 1);

        probe.set(0);
        assert_eq!(governor.calculate_optimal_batch_size(0.01, 1000), 40);
    }

    #[test]
    fn test_trend_and_history_bound() {
        let probe = FixedProbe::new(10);
        let governor = governor(probe.clone());
        for percent in [10, 10, 10, 10, 10, 40, 40, 40, 40, 40] {
            probe.set(percent);
            governor.sample();
        }
        assert_eq!(governor.trend(), MemoryTrend::Increasing);

        for _ in 0..200 {
            governor.sample();
        }
        let stats = governor.stats();
        assert_eq!(stats.samples, HISTORY_LEN);
        assert_eq!(stats.trend, MemoryTrend::Stable);
        assert!((stats.peak_percent - 40.0).abs() < 1e-9);
    }

    #[test]
    fn test_background_sampling_start_stop() {
        let probe = FixedProbe::new(10);
        let governor = Arc::new(MemoryGovernor::with_probe(
            MemoryConfig {
                sample_interval: Duration::from_millis(1),
                ..Default::default()
            },
            probe,
        ));
        governor.start();
        governor.start();
        let deadline = Instant::now() + Duration::from_secs(5);
        while governor.stats().samples < 3 && Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(1));
        }
        governor.stop();
        assert!(governor.stats().samples >= 3);
    }
}
