//! Periodic resource sampling against configured limits.
//!
//! [`ResourceMonitor::start`] spawns a background sampler that reads the
//! process's resident memory and the session's elapsed time on every tick.
//! Each breached limit produces one [`LimitExceeded`] per tick, delivered
//! to the callback supplied at construction. How to react (log, pause,
//! stop) is left to the host.
//!
//! Sampling never propagates failures: probe errors and callback panics
//! are logged and the sampler keeps running.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, info_span, warn, Instrument};

use crate::models::resource::{LimitExceeded, LimitKind, ResourceUsage};
use crate::models::state::ResourceLimits;
use crate::{AppError, Result};

/// Default interval between samples.
pub const DEFAULT_SAMPLE_INTERVAL: Duration = Duration::from_secs(30);

/// Callback invoked for each breached limit.
pub type LimitCallback = Arc<dyn Fn(LimitExceeded) + Send + Sync>;

/// Source of the current resident memory in MB.
pub type MemoryProbe = Arc<dyn Fn() -> Result<u64> + Send + Sync>;

/// Limits the monitor enforces, with durations resolved.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MonitorLimits {
    /// Resident memory ceiling in MB.
    pub max_memory_mb: Option<u64>,
    /// Session wall-clock ceiling.
    pub max_session_time: Option<Duration>,
}

impl From<&ResourceLimits> for MonitorLimits {
    fn from(limits: &ResourceLimits) -> Self {
        Self {
            max_memory_mb: limits.max_memory_mb,
            max_session_time: limits.session_time_limit(),
        }
    }
}

#[derive(Debug, Default)]
struct Sample {
    current_memory_mb: u64,
    peak_memory_mb: u64,
}

struct MonitorInner {
    limits: MonitorLimits,
    on_limit: LimitCallback,
    probe: MemoryProbe,
    session_start: Instant,
    sample: Mutex<Sample>,
}

impl MonitorInner {
    fn sample(&self) -> MutexGuard<'_, Sample> {
        self.sample.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn tick(&self) -> Vec<LimitExceeded> {
        let memory = match (self.probe)() {
            Ok(mb) => {
                let mut sample = self.sample();
                sample.current_memory_mb = mb;
                sample.peak_memory_mb = sample.peak_memory_mb.max(mb);
                Some(mb)
            }
            Err(err) => {
                warn!(%err, "memory sample failed");
                None
            }
        };

        let elapsed = self.session_start.elapsed();
        let mut breaches = Vec::new();

        if let (Some(max), Some(current)) = (self.limits.max_memory_mb, memory) {
            if current > max {
                #[allow(clippy::cast_precision_loss)] // MB values stay far below 2^52.
                breaches.push(LimitExceeded::new(
                    LimitKind::Memory,
                    current as f64,
                    max as f64,
                ));
            }
        }

        if let Some(max) = self.limits.max_session_time {
            if elapsed > max {
                breaches.push(LimitExceeded::new(
                    LimitKind::SessionTime,
                    minutes(elapsed),
                    minutes(max),
                ));
            }
        }

        debug!(
            memory_mb = memory.unwrap_or_default(),
            elapsed_secs = elapsed.as_secs(),
            breaches = breaches.len(),
            "resource sample"
        );

        for breach in &breaches {
            warn!(limit = %breach.limit, current = breach.current, max = breach.max, "{}", breach.message);
            let callback = Arc::clone(&self.on_limit);
            let notification = breach.clone();
            if catch_unwind(AssertUnwindSafe(move || callback(notification))).is_err() {
                warn!(limit = %breach.limit, "resource limit callback panicked");
            }
        }

        breaches
    }
}

fn minutes(duration: Duration) -> f64 {
    duration.as_secs_f64() / 60.0
}

struct Sampler {
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

/// Samples memory and session time, notifying on limit breaches.
pub struct ResourceMonitor {
    inner: Arc<MonitorInner>,
    sampler: Mutex<Option<Sampler>>,
}

impl ResourceMonitor {
    /// Monitor using the `/proc/self/status` memory probe; the session
    /// clock starts now.
    #[must_use]
    pub fn new(limits: MonitorLimits, on_limit: LimitCallback) -> Self {
        Self::with_probe(limits, on_limit, Arc::new(read_rss_mb), Instant::now())
    }

    /// Monitor with an explicit memory probe and session start.
    #[must_use]
    pub fn with_probe(
        limits: MonitorLimits,
        on_limit: LimitCallback,
        probe: MemoryProbe,
        session_start: Instant,
    ) -> Self {
        Self {
            inner: Arc::new(MonitorInner {
                limits,
                on_limit,
                probe,
                session_start,
                sample: Mutex::new(Sample::default()),
            }),
            sampler: Mutex::new(None),
        }
    }

    /// Begin sampling every `interval`. A no-op if already sampling.
    ///
    /// Must be called from within a tokio runtime.
    pub fn start(&self, interval: Duration) {
        let mut sampler = self.sampler.lock().unwrap_or_else(PoisonError::into_inner);
        if sampler.as_ref().is_some_and(|s| !s.handle.is_finished()) {
            debug!("resource monitor already running");
            return;
        }

        let cancel = CancellationToken::new();
        let task_cancel = cancel.clone();
        let inner = Arc::clone(&self.inner);
        let interval = interval.max(Duration::from_millis(1));

        let handle = tokio::spawn(
            async move {
                let mut ticker = tokio::time::interval(interval);
                ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
                loop {
                    tokio::select! {
                        biased;
                        () = task_cancel.cancelled() => {
                            debug!("resource monitor cancelled");
                            break;
                        }
                        _ = ticker.tick() => {
                            inner.tick();
                        }
                    }
                }
            }
            .instrument(info_span!("resource_monitor")),
        );

        info!(interval_ms = interval.as_millis(), "resource monitor started");
        *sampler = Some(Sampler { cancel, handle });
    }

    /// Stop sampling. A no-op if not sampling.
    pub fn stop(&self) {
        let taken = self
            .sampler
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(sampler) = taken {
            sampler.cancel.cancel();
            info!("resource monitor stopped");
        }
    }

    /// Whether the background sampler is active.
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.sampler
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .is_some_and(|s| !s.handle.is_finished())
    }

    /// Take one sample immediately, invoking the callback for any breach.
    pub fn sample_now(&self) -> Vec<LimitExceeded> {
        self.inner.tick()
    }

    /// Usage as of the last sample, with elapsed time read now.
    #[must_use]
    pub fn current_usage(&self) -> ResourceUsage {
        let elapsed = self.inner.session_start.elapsed();
        let sample = self.inner.sample();
        let memory_ok = self
            .inner
            .limits
            .max_memory_mb
            .is_none_or(|max| sample.current_memory_mb <= max);
        let time_ok = self
            .inner
            .limits
            .max_session_time
            .is_none_or(|max| elapsed <= max);
        ResourceUsage {
            current_memory_mb: sample.current_memory_mb,
            peak_memory_mb: sample.peak_memory_mb,
            elapsed_ms: u64::try_from(elapsed.as_millis()).unwrap_or(u64::MAX),
            within_limits: memory_ok && time_ok,
        }
    }

    /// Memory as a percentage of the configured limit.
    #[must_use]
    #[allow(clippy::cast_precision_loss)] // MB values stay far below 2^52.
    pub fn memory_percent(&self) -> Option<f64> {
        let max = self.inner.limits.max_memory_mb.filter(|max| *max > 0)?;
        let current = self.inner.sample().current_memory_mb;
        Some(current as f64 / max as f64 * 100.0)
    }

    /// Elapsed session time as a percentage of the configured limit.
    #[must_use]
    pub fn session_time_percent(&self) -> Option<f64> {
        let max = self
            .inner
            .limits
            .max_session_time
            .filter(|max| !max.is_zero())?;
        Some(self.inner.session_start.elapsed().as_secs_f64() / max.as_secs_f64() * 100.0)
    }
}

impl Drop for ResourceMonitor {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Read resident memory (`VmRSS`) for this process in MB.
///
/// # Errors
///
/// Returns `AppError::Io` if `/proc/self/status` is unavailable or lacks
/// a parsable `VmRSS` line.
pub fn read_rss_mb() -> Result<u64> {
    let status = std::fs::read_to_string("/proc/self/status")
        .map_err(|err| AppError::Io(format!("cannot read /proc/self/status: {err}")))?;
    parse_vm_rss_mb(&status)
        .ok_or_else(|| AppError::Io("VmRSS missing from /proc/self/status".into()))
}

fn parse_vm_rss_mb(status: &str) -> Option<u64> {
    status
        .lines()
        .find(|line| line.starts_with("VmRSS:"))
        .and_then(|line| line.split_whitespace().nth(1))
        .and_then(|kb| kb.parse::<u64>().ok())
        .map(|kb| kb / 1024)
}
