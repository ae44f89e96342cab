//! Live resource sampling for a running execution.
//!
//! A [`ResourceMonitor`] belongs to exactly one execution. It samples the engine through a
//! [`ProbeSlot`] on a fixed interval, overwrites the current [`ResourceUsage`], notifies
//! subscribers, and raises threshold alerts. The monitor only observes: termination on a
//! critical alert is decided by the environment manager.

use crate::error::SandboxError;
use crate::limits::ResourceLimits;
use crate::Result;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::io;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock, Weak};
use std::time::{Duration, Instant};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

/// Default sampling interval
pub const DEFAULT_SAMPLE_INTERVAL: Duration = Duration::from_millis(500);

const STOP_JOIN_TIMEOUT: Duration = Duration::from_secs(1);
const ALERT_CHANNEL_CAPACITY: usize = 64;
const MIB: f64 = 1024.0 * 1024.0;

/// Live usage of the current execution
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourceUsage {
    #[serde(rename = "memoryMB")]
    pub memory_mb: f64,
    pub cpu_percent: f64,
    pub cpu_time_ms: u64,
    pub execution_time_ms: u64,
    pub network_requests: u64,
    pub dom_modifications: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AlertSeverity {
    Warning,
    Error,
    Critical,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AlertResource {
    Memory,
    Cpu,
    Sampling,
}

/// Threshold alert raised during an execution
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceAlert {
    pub severity: AlertSeverity,
    pub resource: AlertResource,
    pub message: String,
    pub timestamp: DateTime<Utc>,
}

impl ResourceAlert {
    pub fn new(
        severity: AlertSeverity,
        resource: AlertResource,
        message: impl Into<String>,
    ) -> Self {
        Self {
            severity,
            resource,
            message: message.into(),
            timestamp: Utc::now(),
        }
    }

    pub fn is_critical(&self) -> bool {
        self.severity == AlertSeverity::Critical
    }
}

/// Raw counters read from an engine
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RawCounters {
    pub memory_bytes: u64,
    pub cpu_time_ms: u64,
    pub network_requests: u64,
    pub dom_modifications: u64,
}

/// Source of usage samples for a running engine
pub trait UsageProbe: Send + Sync {
    /// Read current counters. `Ok(None)` means nothing is running to sample yet (or any
    /// more); the previous sample is kept.
    fn sample(&self) -> io::Result<Option<RawCounters>>;
}

/// Slot through which an engine exposes its probe to the monitor
#[derive(Clone, Default)]
pub struct ProbeSlot {
    inner: Arc<RwLock<Option<Arc<dyn UsageProbe>>>>,
}

impl ProbeSlot {
    pub fn attach(&self, probe: Arc<dyn UsageProbe>) {
        *self.inner.write().unwrap_or_else(PoisonError::into_inner) = Some(probe);
    }

    pub fn detach(&self) {
        *self.inner.write().unwrap_or_else(PoisonError::into_inner) = None;
    }

    pub fn is_attached(&self) -> bool {
        self.inner
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .is_some()
    }

    pub fn sample(&self) -> io::Result<Option<RawCounters>> {
        let probe = self
            .inner
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        match probe {
            Some(probe) => probe.sample(),
            None => Ok(None),
        }
    }
}

impl std::fmt::Debug for ProbeSlot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProbeSlot")
            .field("attached", &self.is_attached())
            .finish()
    }
}

/// Fractions of a limit at which alerts fire
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct AlertThresholds {
    pub warning: f64,
    pub critical: f64,
}

impl Default for AlertThresholds {
    fn default() -> Self {
        Self {
            warning: 0.5,
            critical: 0.9,
        }
    }
}

type UsageCallback = Arc<dyn Fn(&ResourceUsage) + Send + Sync>;

#[derive(Default)]
struct MonitorState {
    usage: ResourceUsage,
    alerts: Vec<ResourceAlert>,
    fired: HashSet<(AlertResource, AlertSeverity)>,
    samples: u64,
    started_at: Option<Instant>,
    last_cpu: Option<(Instant, u64)>,
    probe_failed: bool,
}

struct Shared {
    limits: ResourceLimits,
    thresholds: AlertThresholds,
    state: Mutex<MonitorState>,
    subscribers: Mutex<Vec<(u64, UsageCallback)>>,
    next_subscriber: AtomicU64,
    alerts_tx: broadcast::Sender<ResourceAlert>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl Shared {
    fn record(&self, reading: io::Result<Option<RawCounters>>, raise_alerts: bool) {
        let now = Instant::now();
        let mut raised = Vec::new();

        let usage = {
            let mut state = lock(&self.state);
            state.samples += 1;
            if let Some(started) = state.started_at {
                state.usage.execution_time_ms = now.duration_since(started).as_millis() as u64;
            }
            match reading {
                Ok(Some(counters)) => {
                    let cpu_percent = match state.last_cpu {
                        Some((at, cpu)) => {
                            let wall_ms = now.duration_since(at).as_secs_f64() * 1000.0;
                            if wall_ms > 0.0 {
                                counters.cpu_time_ms.saturating_sub(cpu) as f64 / wall_ms * 100.0
                            } else {
                                state.usage.cpu_percent
                            }
                        }
                        None => 0.0,
                    };
                    state.last_cpu = Some((now, counters.cpu_time_ms));
                    state.usage.memory_mb = counters.memory_bytes as f64 / MIB;
                    state.usage.cpu_percent = cpu_percent;
                    state.usage.cpu_time_ms = counters.cpu_time_ms;
                    state.usage.network_requests = counters.network_requests;
                    state.usage.dom_modifications = counters.dom_modifications;
                    if raise_alerts {
                        raised = self.check_thresholds(&mut state);
                    }
                }
                Ok(None) => {}
                Err(err) => {
                    if raise_alerts && !state.probe_failed {
                        state.probe_failed = true;
                        raised.push(ResourceAlert::new(
                            AlertSeverity::Error,
                            AlertResource::Sampling,
                            format!("Failed to sample resource usage: {}", err),
                        ));
                    }
                }
            }
            state.alerts.extend(raised.iter().cloned());
            state.usage.clone()
        };

        for alert in raised {
            tracing::warn!(
                severity = ?alert.severity,
                resource = ?alert.resource,
                "{}",
                alert.message
            );
            // No receivers is fine; alerts stay readable through get_alerts
            let _ = self.alerts_tx.send(alert);
        }

        let callbacks: Vec<UsageCallback> = lock(&self.subscribers)
            .iter()
            .map(|(_, cb)| cb.clone())
            .collect();
        for callback in callbacks {
            callback(&usage);
        }
    }

    fn check_thresholds(&self, state: &mut MonitorState) -> Vec<ResourceAlert> {
        let memory_fraction = state.usage.memory_mb / self.limits.max_memory_mb as f64;
        let cpu_fraction = state.usage.cpu_time_ms as f64 / self.limits.max_cpu_time_ms as f64;
        let mut raised = Vec::new();

        for (resource, fraction) in [
            (AlertResource::Memory, memory_fraction),
            (AlertResource::Cpu, cpu_fraction),
        ] {
            for (severity, threshold) in [
                (AlertSeverity::Warning, self.thresholds.warning),
                (AlertSeverity::Critical, self.thresholds.critical),
            ] {
                if fraction >= threshold && state.fired.insert((resource, severity)) {
                    let message = match resource {
                        AlertResource::Memory => format!(
                            "Memory usage {:.1} MB is {:.0}% of the {} MB limit",
                            state.usage.memory_mb,
                            fraction * 100.0,
                            self.limits.max_memory_mb
                        ),
                        _ => format!(
                            "CPU time {} ms is {:.0}% of the {} ms budget",
                            state.usage.cpu_time_ms,
                            fraction * 100.0,
                            self.limits.max_cpu_time_ms
                        ),
                    };
                    raised.push(ResourceAlert::new(severity, resource, message));
                }
            }
        }
        raised
    }
}

/// Read the probe on the blocking pool; probes scan `/proc` synchronously
async fn read_probe(probe: &ProbeSlot) -> io::Result<Option<RawCounters>> {
    let probe = probe.clone();
    tokio::task::spawn_blocking(move || probe.sample())
        .await
        .unwrap_or_else(|err| Err(io::Error::other(err)))
}

/// Handle for a usage callback registered with [`ResourceMonitor::subscribe`]
#[derive(Debug)]
pub struct Subscription {
    id: u64,
    shared: Weak<Shared>,
}

impl Subscription {
    /// Stop receiving usage updates
    pub fn unsubscribe(self) {
        if let Some(shared) = self.shared.upgrade() {
            lock(&shared.subscribers).retain(|(id, _)| *id != self.id);
        }
    }
}

/// Per-execution resource monitor
pub struct ResourceMonitor {
    shared: Arc<Shared>,
    probe: ProbeSlot,
    interval: Duration,
    cancel: CancellationToken,
    task: Mutex<Option<JoinHandle<()>>>,
    started: AtomicBool,
    stopped: AtomicBool,
}

impl ResourceMonitor {
    pub fn new(limits: ResourceLimits, thresholds: AlertThresholds, interval: Duration) -> Self {
        let (alerts_tx, _) = broadcast::channel(ALERT_CHANNEL_CAPACITY);
        Self {
            shared: Arc::new(Shared {
                limits,
                thresholds,
                state: Mutex::new(MonitorState::default()),
                subscribers: Mutex::new(Vec::new()),
                next_subscriber: AtomicU64::new(0),
                alerts_tx,
            }),
            probe: ProbeSlot::default(),
            interval,
            cancel: CancellationToken::new(),
            task: Mutex::new(None),
            started: AtomicBool::new(false),
            stopped: AtomicBool::new(false),
        }
    }

    /// Slot the engine attaches its probe to
    pub fn probe_slot(&self) -> ProbeSlot {
        self.probe.clone()
    }

    /// Start periodic sampling. Must be called inside a tokio runtime.
    pub fn start(&self) -> Result<()> {
        if self.started.swap(true, Ordering::SeqCst) {
            return Err(SandboxError::MonitorAlreadyStarted);
        }
        lock(&self.shared.state).started_at = Some(Instant::now());

        let shared = self.shared.clone();
        let probe = self.probe.clone();
        let cancel = self.cancel.clone();
        let interval = self.interval;
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => shared.record(read_probe(&probe).await, true),
                }
            }
        });
        *lock(&self.task) = Some(handle);
        tracing::debug!(interval_ms = interval.as_millis() as u64, "Resource monitor started");
        Ok(())
    }

    /// Stop sampling and capture a final sample.
    ///
    /// Returns `true` for the call that actually stopped the monitor and `false` for any
    /// later call.
    pub async fn stop(&self) -> bool {
        if self.stopped.swap(true, Ordering::SeqCst) {
            return false;
        }
        self.cancel.cancel();
        let handle = lock(&self.task).take();
        if let Some(mut handle) = handle {
            if tokio::time::timeout(STOP_JOIN_TIMEOUT, &mut handle)
                .await
                .is_err()
            {
                tracing::warn!("Sampling task did not stop in time; aborting");
                handle.abort();
            }
        }
        if self.started.load(Ordering::SeqCst) {
            self.shared.record(read_probe(&self.probe).await, false);
        }
        tracing::debug!(samples = self.sample_count(), "Resource monitor stopped");
        true
    }

    pub fn is_running(&self) -> bool {
        self.started.load(Ordering::SeqCst) && !self.stopped.load(Ordering::SeqCst)
    }

    /// Register a callback invoked with every new sample
    pub fn subscribe<F>(&self, callback: F) -> Subscription
    where
        F: Fn(&ResourceUsage) + Send + Sync + 'static,
    {
        let id = self.shared.next_subscriber.fetch_add(1, Ordering::Relaxed);
        lock(&self.shared.subscribers).push((id, Arc::new(callback)));
        Subscription {
            id,
            shared: Arc::downgrade(&self.shared),
        }
    }

    /// Receive alerts as they are raised
    pub fn subscribe_alerts(&self) -> broadcast::Receiver<ResourceAlert> {
        self.shared.alerts_tx.subscribe()
    }

    /// Alerts raised so far, oldest first
    pub fn get_alerts(&self) -> Vec<ResourceAlert> {
        lock(&self.shared.state).alerts.clone()
    }

    pub fn usage(&self) -> ResourceUsage {
        lock(&self.shared.state).usage.clone()
    }

    pub fn sample_count(&self) -> u64 {
        lock(&self.shared.state).samples
    }

    #[cfg(test)]
    fn tick(&self) {
        self.shared.record(self.probe.sample(), true);
    }
}

impl std::fmt::Debug for ResourceMonitor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResourceMonitor")
            .field("interval", &self.interval)
            .field("running", &self.is_running())
            .finish()
    }
}

impl Drop for ResourceMonitor {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}
