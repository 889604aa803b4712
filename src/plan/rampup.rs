use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::time::Instant;

use crate::error::PlanError;

use super::parse_duration;

/// Phase windows synthesised when a step strategy carries no explicit phases.
const DEFAULT_STEP_COUNT: usize = 3;
/// Fallback applied to unparseable phase durations at execution time.
const FALLBACK_PHASE_DURATION: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RampUpType {
    Immediate,
    Linear,
    Step,
    Custom,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PhaseMode {
    Parallel,
    Sequential,
}

/// One segment of a phase-based ramp-up.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RampPhase {
    pub duration: String,
    pub concurrency: u32,
    pub mode: PhaseMode,
}

impl RampPhase {
    pub fn parsed_duration(&self) -> Duration {
        super::parse_duration_or(&self.duration, FALLBACK_PHASE_DURATION)
    }
}

/// Rule mapping elapsed run time to a target concurrency.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RampUpStrategy {
    #[serde(rename = "type")]
    pub kind: RampUpType,
    pub duration: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub phases: Vec<RampPhase>,
}

impl RampUpStrategy {
    pub fn immediate() -> Self {
        Self {
            kind: RampUpType::Immediate,
            duration: "0s".to_owned(),
            phases: Vec::new(),
        }
    }

    pub fn linear(duration: impl Into<String>) -> Self {
        Self {
            kind: RampUpType::Linear,
            duration: duration.into(),
            phases: Vec::new(),
        }
    }

    /// Step strategy with `steps` equal-duration windows. Per-window targets
    /// are derived from the window index at calculation time, so the stored
    /// phase concurrency is zero.
    pub fn step(duration: impl Into<String>, steps: usize) -> Self {
        let duration = duration.into();
        let steps = if steps == 0 { DEFAULT_STEP_COUNT } else { steps };
        let total = super::parse_duration_or(&duration, Duration::from_secs(60));
        let window = humantime::format_duration(total / steps as u32).to_string();
        let phases = (0..steps)
            .map(|_| RampPhase {
                duration: window.clone(),
                concurrency: 0,
                mode: PhaseMode::Parallel,
            })
            .collect();
        Self {
            kind: RampUpType::Step,
            duration,
            phases,
        }
    }

    pub fn custom(duration: impl Into<String>, phases: Vec<RampPhase>) -> Self {
        Self {
            kind: RampUpType::Custom,
            duration: duration.into(),
            phases,
        }
    }

    /// Whether any phase requires coordinator-side sequencing.
    pub fn has_sequential_phases(&self) -> bool {
        self.kind == RampUpType::Custom
            && self
                .phases
                .iter()
                .any(|phase| phase.mode == PhaseMode::Sequential)
    }

    /// Validates the strategy against the plan's peak concurrency.
    ///
    /// # Errors
    ///
    /// Returns an error for unparseable durations, missing phases on
    /// phase-based strategies, or a phase target above `max_concurrency`.
    pub fn validate(&self, max_concurrency: u32) -> Result<(), PlanError> {
        humantime::parse_duration(&self.duration).map_err(|source| {
            PlanError::InvalidRampUpDuration {
                value: self.duration.clone(),
                source,
            }
        })?;

        match self.kind {
            RampUpType::Immediate | RampUpType::Linear => Ok(()),
            RampUpType::Step | RampUpType::Custom => {
                if self.phases.is_empty() {
                    return Err(PlanError::EmptyPhases);
                }
                for (index, phase) in self.phases.iter().enumerate() {
                    humantime::parse_duration(&phase.duration).map_err(|source| {
                        PlanError::InvalidPhaseDuration { index, source }
                    })?;
                    if phase.concurrency > max_concurrency {
                        return Err(PlanError::PhaseConcurrencyTooHigh {
                            index,
                            concurrency: phase.concurrency,
                            max: max_concurrency,
                        });
                    }
                }
                Ok(())
            }
        }
    }
}

/// Pure mapping of elapsed time to a target concurrency in
/// `[0, max_concurrency]` for one agent.
#[derive(Debug, Clone)]
pub struct RampUpCalculator {
    strategy: RampUpStrategy,
    max_concurrency: u32,
    duration: Duration,
    windows: Vec<Duration>,
}

impl RampUpCalculator {
    /// # Errors
    ///
    /// Returns an error if the strategy's total duration does not parse.
    pub fn new(strategy: RampUpStrategy, max_concurrency: u32) -> Result<Self, PlanError> {
        let duration =
            humantime::parse_duration(&strategy.duration).map_err(|source| {
                PlanError::InvalidRampUpDuration {
                    value: strategy.duration.clone(),
                    source,
                }
            })?;

        let windows = match strategy.kind {
            RampUpType::Immediate | RampUpType::Linear => Vec::new(),
            RampUpType::Custom => strategy.phases.iter().map(RampPhase::parsed_duration).collect(),
            RampUpType::Step => {
                if strategy.phases.is_empty() {
                    let window = duration
                        .checked_div(DEFAULT_STEP_COUNT as u32)
                        .unwrap_or(Duration::ZERO);
                    vec![window; DEFAULT_STEP_COUNT]
                } else {
                    strategy.phases.iter().map(RampPhase::parsed_duration).collect()
                }
            }
        };

        Ok(Self {
            strategy,
            max_concurrency,
            duration,
            windows,
        })
    }

    pub fn strategy(&self) -> &RampUpStrategy {
        &self.strategy
    }

    pub fn max_concurrency(&self) -> u32 {
        self.max_concurrency
    }

    /// Target concurrency after `elapsed` time in the run.
    pub fn target_at(&self, elapsed: Duration) -> u32 {
        match self.strategy.kind {
            RampUpType::Immediate => self.max_concurrency,
            RampUpType::Linear => {
                if elapsed >= self.duration || self.duration.is_zero() {
                    return self.max_concurrency;
                }
                let progress = elapsed.as_secs_f64() / self.duration.as_secs_f64();
                (f64::from(self.max_concurrency) * progress).floor() as u32
            }
            RampUpType::Custom => {
                let Some(index) = self.window_index(elapsed) else {
                    return self.max_concurrency;
                };
                self.strategy
                    .phases
                    .get(index)
                    .map_or(self.max_concurrency, |phase| {
                        phase.concurrency.min(self.max_concurrency)
                    })
            }
            RampUpType::Step => {
                let steps = self.windows.len();
                let Some(index) = self.window_index(elapsed) else {
                    return self.max_concurrency;
                };
                step_target(index, steps, self.max_concurrency)
            }
        }
    }

    pub fn is_complete(&self, elapsed: Duration) -> bool {
        elapsed >= self.duration
    }

    pub fn remaining(&self, elapsed: Duration) -> Duration {
        self.duration.saturating_sub(elapsed)
    }

    /// Active window for phase-based strategies: the first window whose
    /// cumulative end is at or past `elapsed`. `None` once all windows are
    /// exhausted.
    fn window_index(&self, elapsed: Duration) -> Option<usize> {
        let mut cumulative = Duration::ZERO;
        for (index, window) in self.windows.iter().enumerate() {
            cumulative += *window;
            if elapsed <= cumulative {
                return Some(index);
            }
        }
        None
    }
}

/// Step target for 0-indexed window `k` of `n`: `round((k + 1) * max / n)`.
fn step_target(index: usize, steps: usize, max_concurrency: u32) -> u32 {
    if steps == 0 {
        return max_concurrency;
    }
    let fraction = (index as f64 + 1.0) / steps as f64;
    (f64::from(max_concurrency) * fraction).round() as u32
}

/// Runtime state for an agent's ramp-up: a calculator anchored to the
/// moment the run (or registration into a running test) began.
#[derive(Debug, Clone)]
pub struct RampUpExecution {
    calculator: RampUpCalculator,
    started_at: Instant,
}

impl RampUpExecution {
    pub fn start(calculator: RampUpCalculator) -> Self {
        Self {
            calculator,
            started_at: Instant::now(),
        }
    }

    pub fn current_target(&self) -> u32 {
        self.calculator.target_at(self.started_at.elapsed())
    }

    pub fn is_complete(&self) -> bool {
        self.calculator.is_complete(self.started_at.elapsed())
    }

    pub fn remaining(&self) -> Duration {
        self.calculator.remaining(self.started_at.elapsed())
    }

    pub fn max_concurrency(&self) -> u32 {
        self.calculator.max_concurrency()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn secs(value: u64) -> Duration {
        Duration::from_secs(value)
    }

    #[test]
    fn immediate_is_always_max() {
        let calc = RampUpCalculator::new(RampUpStrategy::immediate(), 40).unwrap();
        assert_eq!(calc.target_at(Duration::ZERO), 40);
        assert_eq!(calc.target_at(secs(3600)), 40);
        assert!(calc.is_complete(Duration::ZERO));
    }

    #[test]
    fn linear_follows_the_ramp() {
        let calc = RampUpCalculator::new(RampUpStrategy::linear("10s"), 100).unwrap();
        assert_eq!(calc.target_at(Duration::ZERO), 0);
        assert_eq!(calc.target_at(secs(5)), 50);
        assert_eq!(calc.target_at(secs(10)), 100);
        assert_eq!(calc.target_at(secs(15)), 100);
    }

    #[test]
    fn linear_is_monotonic() {
        let calc = RampUpCalculator::new(RampUpStrategy::linear("7s"), 33).unwrap();
        let mut previous = 0;
        for ms in (0..9000).step_by(250) {
            let target = calc.target_at(Duration::from_millis(ms));
            assert!(target >= previous, "dropped at {}ms", ms);
            previous = target;
        }
    }

    #[test]
    fn step_targets_round_toward_even_splits() {
        let strategy = RampUpStrategy::step("9s", 3);
        let calc = RampUpCalculator::new(strategy, 10).unwrap();
        assert_eq!(calc.target_at(secs(1)), 3);
        assert_eq!(calc.target_at(secs(4)), 7);
        assert_eq!(calc.target_at(secs(8)), 10);
        assert_eq!(calc.target_at(secs(20)), 10);
    }

    #[test]
    fn step_without_phases_synthesises_three_windows() {
        let strategy = RampUpStrategy {
            kind: RampUpType::Step,
            duration: "6s".to_owned(),
            phases: Vec::new(),
        };
        let calc = RampUpCalculator::new(strategy, 9).unwrap();
        assert_eq!(calc.target_at(secs(1)), 3);
        assert_eq!(calc.target_at(secs(3)), 6);
        assert_eq!(calc.target_at(secs(5)), 9);
    }

    #[test]
    fn custom_walks_phases_cumulatively() {
        let strategy = RampUpStrategy::custom(
            "30s",
            vec![
                RampPhase {
                    duration: "10s".to_owned(),
                    concurrency: 2,
                    mode: PhaseMode::Parallel,
                },
                RampPhase {
                    duration: "20s".to_owned(),
                    concurrency: 8,
                    mode: PhaseMode::Parallel,
                },
            ],
        );
        let calc = RampUpCalculator::new(strategy, 10).unwrap();
        assert_eq!(calc.target_at(secs(1)), 2);
        assert_eq!(calc.target_at(secs(10)), 2);
        // Just past the boundary the next phase's value applies.
        assert_eq!(calc.target_at(Duration::from_millis(10_001)), 8);
        assert_eq!(calc.target_at(secs(29)), 8);
        assert_eq!(calc.target_at(secs(31)), 10);
    }

    #[test]
    fn custom_clamps_to_max() {
        let strategy = RampUpStrategy::custom(
            "10s",
            vec![RampPhase {
                duration: "10s".to_owned(),
                concurrency: 50,
                mode: PhaseMode::Parallel,
            }],
        );
        let calc = RampUpCalculator::new(strategy, 8).unwrap();
        assert_eq!(calc.target_at(secs(5)), 8);
    }

    #[test]
    fn validation_rejects_empty_phases() {
        let strategy = RampUpStrategy {
            kind: RampUpType::Custom,
            duration: "10s".to_owned(),
            phases: Vec::new(),
        };
        assert!(matches!(
            strategy.validate(10),
            Err(PlanError::EmptyPhases)
        ));
    }

    #[test]
    fn validation_rejects_bad_phase_duration() {
        let strategy = RampUpStrategy::custom(
            "10s",
            vec![RampPhase {
                duration: "whenever".to_owned(),
                concurrency: 1,
                mode: PhaseMode::Sequential,
            }],
        );
        assert!(matches!(
            strategy.validate(10),
            Err(PlanError::InvalidPhaseDuration { index: 0, .. })
        ));
    }

    #[test]
    fn validation_rejects_phase_above_plan_concurrency() {
        let strategy = RampUpStrategy::custom(
            "10s",
            vec![RampPhase {
                duration: "10s".to_owned(),
                concurrency: 11,
                mode: PhaseMode::Parallel,
            }],
        );
        assert!(matches!(
            strategy.validate(10),
            Err(PlanError::PhaseConcurrencyTooHigh { index: 0, .. })
        ));
    }

    #[test]
    fn sequential_detection_only_applies_to_custom() {
        let mut strategy = RampUpStrategy::custom(
            "10s",
            vec![RampPhase {
                duration: "10s".to_owned(),
                concurrency: 2,
                mode: PhaseMode::Sequential,
            }],
        );
        assert!(strategy.has_sequential_phases());
        strategy.kind = RampUpType::Step;
        assert!(!strategy.has_sequential_phases());
    }

    #[test]
    fn strategy_round_trips_through_json() {
        let strategy = RampUpStrategy::custom(
            "1m",
            vec![RampPhase {
                duration: "30s".to_owned(),
                concurrency: 5,
                mode: PhaseMode::Sequential,
            }],
        );
        let json = serde_json::to_string(&strategy).unwrap();
        assert!(json.contains("\"type\":\"custom\""));
        assert!(json.contains("\"mode\":\"sequential\""));
        let back: RampUpStrategy = serde_json::from_str(&json).unwrap();
        assert_eq!(back.kind, RampUpType::Custom);
        assert_eq!(back.phases.len(), 1);
    }
}
