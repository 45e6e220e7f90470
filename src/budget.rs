use serde::{Deserialize, Serialize};

use crate::error::ContextError;

/// Projected system-prompt size used when the caller has not measured one.
pub const DEFAULT_SYSTEM_RESERVE: u32 = 4_000;

/// Output reserve for a given context window. Small windows reserve a fixed
/// floor; very large windows reserve a fifth of the window.
pub fn calculate_output_reserve(total_window: u32) -> u32 {
    if total_window <= 64_000 {
        27_000
    } else if total_window <= 128_000 {
        30_000
    } else if total_window <= 200_000 {
        40_000
    } else {
        40_000.max(total_window / 5)
    }
}

/// The split of a model's context window into reserved and usable space.
/// `history_budget` is what conversation messages may occupy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenBudget {
    pub total_window: u32,
    pub output_reserve: u32,
    pub system_reserve: u32,
    pub history_budget: u32,
}

/// Inputs to [`TokenBudget::calculate`]. A measured `system_prompt_tokens`
/// overrides the projected `system_reserve` when both are present.
#[derive(Debug, Clone, Default)]
pub struct BudgetParams {
    pub total_window: u32,
    pub system_reserve: Option<u32>,
    pub system_prompt_tokens: Option<u32>,
    pub output_reserve: Option<u32>,
}

impl TokenBudget {
    pub fn calculate(params: BudgetParams) -> Self {
        let output_reserve = params
            .output_reserve
            .unwrap_or_else(|| calculate_output_reserve(params.total_window));
        let system_reserve = params
            .system_prompt_tokens
            .or(params.system_reserve)
            .unwrap_or(DEFAULT_SYSTEM_RESERVE);
        let history_budget = params
            .total_window
            .saturating_sub(output_reserve)
            .saturating_sub(system_reserve);
        Self {
            total_window: params.total_window,
            output_reserve,
            system_reserve,
            history_budget,
        }
    }

    /// Budget with defaults for a plain window size.
    pub fn for_window(total_window: u32) -> Self {
        Self::calculate(BudgetParams {
            total_window,
            ..Default::default()
        })
    }
}

/// Fractions of `history_budget` at which each pressure level begins.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Thresholds {
    pub warning: f64,
    pub critical: f64,
    pub overflow: f64,
}

impl Default for Thresholds {
    fn default() -> Self {
        Self {
            warning: 0.75,
            critical: 0.85,
            overflow: 0.95,
        }
    }
}

impl Thresholds {
    /// Validated construction. Rejects inverted or out-of-range fractions.
    pub fn new(warning: f64, critical: f64, overflow: f64) -> Result<Self, ContextError> {
        let t = Self {
            warning,
            critical,
            overflow,
        };
        t.validate()?;
        Ok(t)
    }

    /// Profile for model families that tolerate running closer to the limit.
    pub fn aggressive() -> Self {
        Self {
            warning: 0.85,
            critical: 0.92,
            overflow: 0.98,
        }
    }

    pub fn validate(&self) -> Result<(), ContextError> {
        if !(self.warning > 0.0 && self.warning < self.critical && self.critical < self.overflow)
            || self.overflow > 1.0
        {
            return Err(ContextError::Configuration(format!(
                "thresholds must satisfy 0 < warning < critical < overflow <= 1, got {}/{}/{}",
                self.warning, self.critical, self.overflow
            )));
        }
        Ok(())
    }
}

/// Pressure on the context window, derived from usage against thresholds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContextState {
    Healthy,
    Warning,
    Critical,
    Overflow,
}

impl std::fmt::Display for ContextState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Healthy => "healthy",
            Self::Warning => "warning",
            Self::Critical => "critical",
            Self::Overflow => "overflow",
        };
        f.write_str(s)
    }
}

/// Fraction of the history budget in use. Infinite for a zero budget with
/// any usage, zero for an empty transcript.
pub fn usage_ratio(token_count: u32, budget: &TokenBudget) -> f64 {
    if token_count == 0 {
        return 0.0;
    }
    if budget.history_budget == 0 {
        return f64::INFINITY;
    }
    f64::from(token_count) / f64::from(budget.history_budget)
}

/// Classify pressure. Overflow is tested before critical, critical before
/// warning.
pub fn classify(token_count: u32, budget: &TokenBudget, thresholds: &Thresholds) -> ContextState {
    let ratio = usage_ratio(token_count, budget);
    if ratio >= thresholds.overflow {
        ContextState::Overflow
    } else if ratio >= thresholds.critical {
        ContextState::Critical
    } else if ratio >= thresholds.warning {
        ContextState::Warning
    } else {
        ContextState::Healthy
    }
}
