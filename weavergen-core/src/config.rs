use crate::error::{EngineError, EngineResult};
use crate::types::Backoff;
use std::time::Duration;

/// Engine configuration. Every field has a default; the string-keyed
/// `apply` path exists so embedding callers and the CLI can pass
/// `key=value` options without knowing the struct.
#[derive(Clone, Debug)]
pub struct EngineConfig {
    /// Verdict pass threshold (`threshold.quality`).
    pub quality_threshold: f64,
    /// Worker pool cap (`parallelism.max_workers`).
    pub max_workers: usize,
    /// Default per-task timeout (`timeout.default_task`). Zero means none.
    pub default_task_timeout: Duration,
    /// Wall-clock cap on a run (`timeout.run_deadline`). Zero means none.
    pub run_deadline: Duration,
    /// Default attempt count (`retry.default_max_attempts`).
    pub default_max_attempts: u32,
    /// Default backoff strategy (`retry.default_backoff`).
    pub default_backoff: Backoff,
    /// Time allowed for handlers to unwind on cancel (`cancel.grace_period`).
    pub cancel_grace_period: Duration,
    /// Run every task in mock mode (`mock.enabled_globally`).
    pub mock_enabled_globally: bool,
    /// Permit per-task mock fallback (`mock.on_fallback`).
    pub mock_on_fallback: bool,
    /// p95 task-duration budget feeding the performance component of the
    /// quality score (`quality.performance_budget`).
    pub performance_budget: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        EngineConfig {
            quality_threshold: 0.80,
            max_workers: default_workers(),
            default_task_timeout: Duration::from_secs(30),
            run_deadline: Duration::ZERO,
            default_max_attempts: 3,
            default_backoff: Backoff::Exponential,
            cancel_grace_period: Duration::from_secs(5),
            mock_enabled_globally: false,
            mock_on_fallback: true,
            performance_budget: Duration::from_secs(2),
        }
    }
}

fn default_workers() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(4)
}

impl EngineConfig {
    /// Apply one `key=value` option using the recognized option names.
    pub fn apply(&mut self, key: &str, value: &str) -> EngineResult<()> {
        let bad = |message: &str| EngineError::Config {
            key: key.to_string(),
            message: message.to_string(),
        };
        match key {
            "threshold.quality" => {
                let v: f64 = value.parse().map_err(|_| bad("expected a float"))?;
                if !(0.0..=1.0).contains(&v) {
                    return Err(bad("threshold must be in [0, 1]"));
                }
                self.quality_threshold = v;
            }
            "parallelism.max_workers" => {
                let v: usize = value.parse().map_err(|_| bad("expected an integer"))?;
                if v == 0 {
                    return Err(bad("worker pool must have at least one worker"));
                }
                self.max_workers = v;
            }
            "timeout.default_task" => {
                self.default_task_timeout = parse_millis(value).ok_or_else(|| bad("expected milliseconds"))?;
            }
            "timeout.run_deadline" => {
                self.run_deadline = parse_millis(value).ok_or_else(|| bad("expected milliseconds"))?;
            }
            "retry.default_max_attempts" => {
                let v: u32 = value.parse().map_err(|_| bad("expected an integer"))?;
                if v == 0 {
                    return Err(bad("max_attempts must be >= 1"));
                }
                self.default_max_attempts = v;
            }
            "retry.default_backoff" => {
                self.default_backoff = match value {
                    "constant" => Backoff::Constant,
                    "exponential" => Backoff::Exponential,
                    _ => return Err(bad("expected 'constant' or 'exponential'")),
                };
            }
            "cancel.grace_period" => {
                self.cancel_grace_period = parse_millis(value).ok_or_else(|| bad("expected milliseconds"))?;
            }
            "mock.enabled_globally" => {
                self.mock_enabled_globally = value.parse().map_err(|_| bad("expected a bool"))?;
            }
            "mock.on_fallback" => {
                self.mock_on_fallback = value.parse().map_err(|_| bad("expected a bool"))?;
            }
            "quality.performance_budget" => {
                self.performance_budget = parse_millis(value).ok_or_else(|| bad("expected milliseconds"))?;
            }
            _ => return Err(bad("unknown option")),
        }
        Ok(())
    }
}

fn parse_millis(value: &str) -> Option<Duration> {
    value.parse::<u64>().ok().map(Duration::from_millis)
}
