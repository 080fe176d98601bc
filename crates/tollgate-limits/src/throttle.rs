//! Load-driven global throttle.
//!
//! Samples of CPU, memory, and in-flight work are mapped to a throttle level.
//! Each level carries a multiplier applied to every admission decision.
//! Escalation is immediate; stepping down requires consecutive samples with
//! lower pressure.

use std::collections::{BTreeMap, VecDeque};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

/// Discrete system-load state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ThrottleLevel {
    /// Normal operation.
    #[default]
    None,
    /// Slight pressure.
    Low,
    /// Noticeable pressure.
    Medium,
    /// Heavy pressure.
    High,
    /// Overload.
    Critical,
}

impl ThrottleLevel {
    /// Stable lowercase label.
    pub fn as_str(&self) -> &'static str {
        match self {
            ThrottleLevel::None => "none",
            ThrottleLevel::Low => "low",
            ThrottleLevel::Medium => "medium",
            ThrottleLevel::High => "high",
            ThrottleLevel::Critical => "critical",
        }
    }
}

impl std::fmt::Display for ThrottleLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Thresholds at which a level is entered. Any one resource crossing is enough.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct LevelThresholds {
    /// CPU utilization percent.
    pub cpu_pct: f64,
    /// Memory utilization percent.
    pub memory_pct: f64,
    /// Concurrent in-flight work items.
    pub workers: u64,
}

/// Auto-throttle configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ThrottleConfig {
    /// Thresholds for `low`.
    pub low: LevelThresholds,
    /// Thresholds for `medium`.
    pub medium: LevelThresholds,
    /// Thresholds for `high`.
    pub high: LevelThresholds,
    /// Thresholds for `critical`.
    pub critical: LevelThresholds,
    /// Multiplier at `low`.
    pub low_multiplier: f64,
    /// Multiplier at `medium`.
    pub medium_multiplier: f64,
    /// Multiplier at `high`.
    pub high_multiplier: f64,
    /// Multiplier at `critical`.
    pub critical_multiplier: f64,
    /// Time between samples.
    pub sample_interval_ms: u64,
    /// Consecutive lower-pressure samples needed to step down.
    pub step_down_samples: u32,
    /// Throttle events kept in memory.
    pub history_limit: usize,
}

impl Default for ThrottleConfig {
    fn default() -> Self {
        Self {
            low: LevelThresholds {
                cpu_pct: 50.0,
                memory_pct: 60.0,
                workers: 1_000,
            },
            medium: LevelThresholds {
                cpu_pct: 70.0,
                memory_pct: 75.0,
                workers: 5_000,
            },
            high: LevelThresholds {
                cpu_pct: 85.0,
                memory_pct: 85.0,
                workers: 10_000,
            },
            critical: LevelThresholds {
                cpu_pct: 95.0,
                memory_pct: 95.0,
                workers: 50_000,
            },
            low_multiplier: 0.9,
            medium_multiplier: 0.7,
            high_multiplier: 0.5,
            critical_multiplier: 0.3,
            sample_interval_ms: 10_000,
            step_down_samples: 2,
            history_limit: 1_000,
        }
    }
}

impl ThrottleConfig {
    /// Multiplier of a level.
    pub fn multiplier(&self, level: ThrottleLevel) -> f64 {
        match level {
            ThrottleLevel::None => 1.0,
            ThrottleLevel::Low => self.low_multiplier,
            ThrottleLevel::Medium => self.medium_multiplier,
            ThrottleLevel::High => self.high_multiplier,
            ThrottleLevel::Critical => self.critical_multiplier,
        }
    }

    fn thresholds(&self, level: ThrottleLevel) -> Option<&LevelThresholds> {
        match level {
            ThrottleLevel::None => None,
            ThrottleLevel::Low => Some(&self.low),
            ThrottleLevel::Medium => Some(&self.medium),
            ThrottleLevel::High => Some(&self.high),
            ThrottleLevel::Critical => Some(&self.critical),
        }
    }

    /// Map a sample to the most severe level whose thresholds it crosses.
    pub fn classify(&self, sample: &LoadSample) -> ThrottleLevel {
        [
            ThrottleLevel::Critical,
            ThrottleLevel::High,
            ThrottleLevel::Medium,
            ThrottleLevel::Low,
        ]
        .into_iter()
        .find(|level| {
            self.thresholds(*level).is_some_and(|t| {
                sample.cpu_pct >= t.cpu_pct || sample.memory_pct >= t.memory_pct || sample.workers >= t.workers
            })
        })
        .unwrap_or(ThrottleLevel::None)
    }

    /// Human-readable list of what pushed a sample to `level`.
    pub fn reason(&self, level: ThrottleLevel, sample: &LoadSample) -> String {
        let Some(t) = self.thresholds(level) else {
            return "System load normalized".to_string();
        };
        let mut reasons = Vec::new();
        if sample.cpu_pct >= t.cpu_pct {
            reasons.push(format!("CPU {} ({:.1}%)", level, sample.cpu_pct));
        }
        if sample.memory_pct >= t.memory_pct {
            reasons.push(format!("Memory {} ({:.1}%)", level, sample.memory_pct));
        }
        if sample.workers >= t.workers {
            reasons.push(format!("Workers {} ({})", level, sample.workers));
        }
        if reasons.is_empty() {
            return format!("Load eased to {}", level);
        }
        reasons.join(", ")
    }

    /// Multipliers must be in `(0, 1]` and thresholds must rise with the level.
    pub fn validate(&self) -> Result<(), String> {
        let levels = [self.low, self.medium, self.high, self.critical];
        for pair in levels.windows(2) {
            if pair[0].cpu_pct > pair[1].cpu_pct
                || pair[0].memory_pct > pair[1].memory_pct
                || pair[0].workers > pair[1].workers
            {
                return Err("throttle thresholds must not decrease with level".to_string());
            }
        }
        let multipliers = [
            self.low_multiplier,
            self.medium_multiplier,
            self.high_multiplier,
            self.critical_multiplier,
        ];
        if multipliers.iter().any(|m| *m <= 0.0 || *m > 1.0) {
            return Err("throttle multipliers must be within (0, 1]".to_string());
        }
        if self.step_down_samples == 0 {
            return Err("step_down_samples must be at least 1".to_string());
        }
        Ok(())
    }
}

/// One reading of system load.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct LoadSample {
    /// CPU utilization percent.
    pub cpu_pct: f64,
    /// Memory utilization percent.
    pub memory_pct: f64,
    /// In-flight work items.
    pub workers: u64,
    /// When the sample was taken.
    pub taken_at_ms: u64,
}

/// Record of a throttle level change.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ThrottleEvent {
    /// Level before.
    pub from: ThrottleLevel,
    /// Level after.
    pub to: ThrottleLevel,
    /// Multiplier now in effect.
    pub multiplier: f64,
    /// Sample that triggered the change (last known sample for manual overrides).
    pub sample: LoadSample,
    /// Why the level changed.
    pub reason: String,
    /// Set by an operator rather than a sample.
    pub manual: bool,
    /// When the change happened.
    pub timestamp_ms: u64,
    /// Time until the next sample is due.
    pub hold_ms: u64,
}

/// Summary of throttle activity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ThrottleStats {
    /// Current level.
    pub level: ThrottleLevel,
    /// Current multiplier.
    pub multiplier: f64,
    /// Most recent sample.
    pub last_sample: Option<LoadSample>,
    /// Transitions into each level.
    pub events_per_level: BTreeMap<ThrottleLevel, u64>,
    /// All transitions.
    pub total_transitions: u64,
    /// Samples observed.
    pub samples: u64,
}

#[derive(Debug, Default)]
struct ThrottleState {
    level: ThrottleLevel,
    lower_streak: u32,
    streak_level: ThrottleLevel,
    last_sample: Option<LoadSample>,
    events_per_level: BTreeMap<ThrottleLevel, u64>,
    total_transitions: u64,
    samples: u64,
}

/// Auto-throttle controller.
pub struct AutoThrottle {
    config: ThrottleConfig,
    multiplier_bits: AtomicU64,
    state: Mutex<ThrottleState>,
    history: Mutex<VecDeque<ThrottleEvent>>,
}

impl AutoThrottle {
    /// Create a controller at level `none`.
    pub fn new(config: ThrottleConfig) -> Self {
        Self {
            config,
            multiplier_bits: AtomicU64::new(1.0f64.to_bits()),
            state: Mutex::new(ThrottleState::default()),
            history: Mutex::new(VecDeque::new()),
        }
    }

    /// Configuration in use.
    pub fn config(&self) -> &ThrottleConfig {
        &self.config
    }

    /// Multiplier applied to every decision. Lock-free.
    pub fn multiplier(&self) -> f64 {
        f64::from_bits(self.multiplier_bits.load(Ordering::Acquire))
    }

    /// Current level.
    pub fn level(&self) -> ThrottleLevel {
        self.state.lock().level
    }

    /// Feed a sample; returns the event if the level changed.
    pub fn observe(&self, sample: LoadSample) -> Option<ThrottleEvent> {
        let target = self.config.classify(&sample);
        let mut state = self.state.lock();
        state.samples += 1;
        state.last_sample = Some(sample);

        let next = if target > state.level {
            state.lower_streak = 0;
            Some(target)
        } else if target == state.level {
            state.lower_streak = 0;
            None
        } else {
            state.streak_level = if state.lower_streak == 0 {
                target
            } else {
                state.streak_level.max(target)
            };
            state.lower_streak += 1;
            if state.lower_streak >= self.config.step_down_samples {
                state.lower_streak = 0;
                Some(state.streak_level)
            } else {
                None
            }
        }?;

        let reason = self.config.reason(next, &sample);
        Some(self.transition(&mut state, next, sample, reason, false, sample.taken_at_ms))
    }

    /// Force a level until later samples move it.
    pub fn set_level(&self, level: ThrottleLevel, reason: &str, now_ms: u64) -> ThrottleEvent {
        let mut state = self.state.lock();
        state.lower_streak = 0;
        let sample = state.last_sample.unwrap_or_default();
        let reason = format!("Manual override (was {}): {}", state.level, reason);
        self.transition(&mut state, level, sample, reason, true, now_ms)
    }

    fn transition(
        &self,
        state: &mut ThrottleState,
        to: ThrottleLevel,
        sample: LoadSample,
        reason: String,
        manual: bool,
        now_ms: u64,
    ) -> ThrottleEvent {
        let from = state.level;
        state.level = to;
        *state.events_per_level.entry(to).or_default() += 1;
        state.total_transitions += 1;

        let multiplier = self.config.multiplier(to);
        self.multiplier_bits.store(multiplier.to_bits(), Ordering::Release);

        let event = ThrottleEvent {
            from,
            to,
            multiplier,
            sample,
            reason,
            manual,
            timestamp_ms: now_ms,
            hold_ms: self.config.sample_interval_ms,
        };
        if to > from {
            warn!(from = %from, to = %to, multiplier, reason = %event.reason, "throttle level raised");
        } else {
            info!(from = %from, to = %to, multiplier, reason = %event.reason, "throttle level changed");
        }

        let mut history = self.history.lock();
        history.push_back(event.clone());
        while history.len() > self.config.history_limit {
            history.pop_front();
        }
        event
    }

    /// Most recent events, newest first.
    pub fn history(&self, limit: usize) -> Vec<ThrottleEvent> {
        self.history.lock().iter().rev().take(limit).cloned().collect()
    }

    /// Activity summary.
    pub fn stats(&self) -> ThrottleStats {
        let state = self.state.lock();
        ThrottleStats {
            level: state.level,
            multiplier: self.multiplier(),
            last_sample: state.last_sample,
            events_per_level: state.events_per_level.clone(),
            total_transitions: state.total_transitions,
            samples: state.samples,
        }
    }
}

/// Source of load samples.
pub trait LoadSampler: Send + Sync {
    /// Take one sample.
    fn sample(&self, now_ms: u64) -> LoadSample;
}

/// Counts work currently being admitted.
#[derive(Debug, Default)]
pub struct InFlight {
    count: AtomicUsize,
}

impl InFlight {
    /// Create a zeroed counter.
    pub fn new() -> Self {
        Self::default()
    }

    /// Mark one unit of work as started; it ends when the guard drops.
    pub fn enter(&self) -> InFlightGuard<'_> {
        self.count.fetch_add(1, Ordering::Relaxed);
        InFlightGuard { owner: self }
    }

    /// Units currently in flight.
    pub fn current(&self) -> usize {
        self.count.load(Ordering::Relaxed)
    }
}

/// Decrements the in-flight counter on drop.
pub struct InFlightGuard<'a> {
    owner: &'a InFlight,
}

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        self.owner.count.fetch_sub(1, Ordering::Relaxed);
    }
}

/// Reads CPU and memory utilization from `/proc` on Linux.
///
/// CPU is computed from the delta between consecutive `/proc/stat` reads, so
/// the first sample reports 0%. Unreadable files report 0%.
pub struct ProcLoadSampler {
    in_flight: std::sync::Arc<InFlight>,
    last_cpu: Mutex<Option<(u64, u64)>>,
}

impl ProcLoadSampler {
    /// Create a sampler that reports `in_flight` as the worker count.
    pub fn new(in_flight: std::sync::Arc<InFlight>) -> Self {
        Self {
            in_flight,
            last_cpu: Mutex::new(None),
        }
    }

    fn cpu_pct(&self) -> f64 {
        let Some((idle, total)) = std::fs::read_to_string("/proc/stat")
            .ok()
            .and_then(|s| parse_proc_stat(&s))
        else {
            return 0.0;
        };
        let mut last = self.last_cpu.lock();
        let pct = match *last {
            Some((prev_idle, prev_total)) if total > prev_total => {
                let d_total = (total - prev_total) as f64;
                let d_idle = idle.saturating_sub(prev_idle) as f64;
                ((d_total - d_idle) / d_total * 100.0).clamp(0.0, 100.0)
            }
            _ => 0.0,
        };
        *last = Some((idle, total));
        pct
    }

    fn memory_pct(&self) -> f64 {
        std::fs::read_to_string("/proc/meminfo")
            .ok()
            .and_then(|s| parse_meminfo(&s))
            .unwrap_or(0.0)
    }
}

impl LoadSampler for ProcLoadSampler {
    fn sample(&self, now_ms: u64) -> LoadSample {
        LoadSample {
            cpu_pct: self.cpu_pct(),
            memory_pct: self.memory_pct(),
            workers: self.in_flight.current() as u64,
            taken_at_ms: now_ms,
        }
    }
}

/// Parse the aggregate `cpu` line of `/proc/stat` into (idle, total) jiffies.
pub fn parse_proc_stat(contents: &str) -> Option<(u64, u64)> {
    let line = contents.lines().find(|l| l.starts_with("cpu "))?;
    let fields: Vec<u64> = line
        .split_whitespace()
        .skip(1)
        .filter_map(|f| f.parse().ok())
        .collect();
    if fields.len() < 4 {
        return None;
    }
    // idle + iowait
    let idle = fields[3] + fields.get(4).copied().unwrap_or(0);
    Some((idle, fields.iter().sum()))
}

/// Parse `/proc/meminfo` into a used-memory percentage.
pub fn parse_meminfo(contents: &str) -> Option<f64> {
    let field = |name: &str| -> Option<f64> {
        contents
            .lines()
            .find(|l| l.starts_with(name))?
            .split_whitespace()
            .nth(1)?
            .parse()
            .ok()
    };
    let total = field("MemTotal:")?;
    let available = field("MemAvailable:")?;
    if total <= 0.0 {
        return None;
    }
    Some(((total - available) / total * 100.0).clamp(0.0, 100.0))
}
