//! Retry policy evaluation
//!
//! Pure decision function consulted whenever a stage timer fires. It never
//! reads the clock or any store, so a recorded sequence of inputs always
//! replays to the same decisions.

use serde::{Deserialize, Serialize};

use crate::chain::EscalationStage;

/// What to do once the current attempt's window has elapsed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RetryDecision {
    /// Redispatch the same stage's fan-out
    Retry,
    /// Move on to the next stage
    Advance,
    /// No attempts and no stages left
    Exhaust,
}

impl std::fmt::Display for RetryDecision {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Retry => write!(f, "retry"),
            Self::Advance => write!(f, "advance"),
            Self::Exhaust => write!(f, "exhaust"),
        }
    }
}

/// Reaction when every method of an attempt reports a transport failure
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AllFailedPolicy {
    /// Keep the armed timer; the wait window still runs to completion
    #[default]
    WaitFullDuration,
    /// Cancel the timer and evaluate the retry policy immediately
    ShortCircuit,
}

/// Decide the next step for a stage after `attempt_in_stage` attempts.
///
/// `attempt_in_stage` counts attempts already issued in this stage (1 after
/// the first dispatch). Delay-only stages never retry.
pub fn evaluate(
    stage: &EscalationStage,
    attempt_in_stage: u32,
    has_next_stage: bool,
) -> RetryDecision {
    if attempt_in_stage < stage.max_attempts && !stage.is_delay_only() {
        RetryDecision::Retry
    } else if has_next_stage {
        RetryDecision::Advance
    } else {
        RetryDecision::Exhaust
    }
}
