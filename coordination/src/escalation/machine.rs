//! Notification instance state machine
//!
//! Consumes inputs (start, timer fire, dispatch result, ack) together with a
//! freshly resolved chain and returns the [`Effect`]s the owning actor must
//! carry out. No I/O happens here: dispatching, timer arming and publishing
//! are the actor's job, which keeps every transition replayable.

use std::collections::BTreeMap;
use std::time::Duration;

use chrono::Utc;
use tracing::{error, info};

use super::policy::{self, RetryDecision};
use super::state::{DispatchRecord, InstanceStatus, NotificationInstance};
use crate::chain::{EscalationChain, MethodId};

/// Work requested by a transition
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Effect {
    /// The instance moved into a new stage
    StageEntered { stage_index: usize, stage_order: u32 },
    /// Fan the current attempt out to these methods
    Dispatch(DispatchOrder),
    /// Arm the instance's single timer, superseding any previous one
    ArmTimer { delay: Duration },
    /// Drop the instance's outstanding timer
    CancelTimer,
    /// The instance reached a terminal status
    Finished { status: InstanceStatus },
}

/// One attempt's fan-out
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DispatchOrder {
    pub stage_index: usize,
    pub stage_order: u32,
    pub attempt: u32,
    pub method_ids: Vec<MethodId>,
}

/// Outcome of a single method send, as fed back to the machine
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DispatchOutcome {
    pub method_id: MethodId,
    pub stage_index: usize,
    pub attempt: u32,
    pub success: bool,
    pub error: Option<String>,
    pub delivery_id: Option<String>,
}

/// Result tracking for the attempt currently in flight
#[derive(Debug, Clone, Default)]
struct FanOut {
    stage_index: usize,
    attempt: u32,
    outcomes: BTreeMap<MethodId, Option<bool>>,
}

impl FanOut {
    fn all_failed(&self) -> bool {
        !self.outcomes.is_empty() && self.outcomes.values().all(|o| *o == Some(false))
    }
}

/// Deterministic driver of one [`NotificationInstance`]
#[derive(Debug, Clone)]
pub struct InstanceMachine {
    instance: NotificationInstance,
    fan_out: Option<FanOut>,
}

impl InstanceMachine {
    pub fn new(instance: NotificationInstance) -> Self {
        Self {
            instance,
            fan_out: None,
        }
    }

    pub fn instance(&self) -> &NotificationInstance {
        &self.instance
    }

    pub fn status(&self) -> InstanceStatus {
        self.instance.status
    }

    pub fn is_terminal(&self) -> bool {
        self.instance.is_terminal()
    }

    /// Enter the first stage. An inert chain exhausts immediately.
    pub fn start(&mut self, chain: &EscalationChain) -> Vec<Effect> {
        let mut effects = Vec::new();
        if self.instance.status != InstanceStatus::Pending {
            return effects;
        }
        if chain.is_inert() {
            self.finish(
                InstanceStatus::Exhausted,
                "chain has no stages",
                &mut effects,
            );
            return effects;
        }
        self.enter_stage(chain, 0, &mut effects);
        effects
    }

    /// The armed timer fired: retry, advance or exhaust
    pub fn on_timer(&mut self, chain: &EscalationChain) -> Vec<Effect> {
        let mut effects = Vec::new();
        if self.instance.status != InstanceStatus::WaitingAck {
            return effects;
        }

        let index = self.instance.current_stage_index;
        let Some(stage) = chain.stage(index) else {
            error!(
                instance_id = %self.instance.id,
                stage_index = index,
                stages = chain.stages.len(),
                "Stage index beyond chain length"
            );
            self.finish(
                InstanceStatus::Failed,
                format!(
                    "stage index {} beyond chain length {}",
                    index,
                    chain.stages.len()
                ),
                &mut effects,
            );
            return effects;
        };

        let decision = policy::evaluate(
            stage,
            self.instance.attempt_in_stage,
            chain.has_stage_after(index),
        );
        match decision {
            RetryDecision::Retry => self.dispatch_attempt(chain, &mut effects),
            RetryDecision::Advance => {
                if self.advance_to(InstanceStatus::Escalating, None, &mut effects) {
                    self.enter_stage(chain, index + 1, &mut effects);
                }
            }
            RetryDecision::Exhaust => {
                self.finish(
                    InstanceStatus::Exhausted,
                    "all stages exhausted without acknowledgment",
                    &mut effects,
                );
            }
        }
        effects
    }

    /// Every method of the current attempt failed and the chain short-circuits.
    ///
    /// A pending retry keeps its interval timer; otherwise the remaining wait
    /// window is skipped and the instance advances or exhausts now.
    pub fn short_circuit(&mut self, chain: &EscalationChain) -> Vec<Effect> {
        if self.instance.status != InstanceStatus::WaitingAck {
            return Vec::new();
        }
        let index = self.instance.current_stage_index;
        if let Some(stage) = chain.stage(index) {
            let decision = policy::evaluate(
                stage,
                self.instance.attempt_in_stage,
                chain.has_stage_after(index),
            );
            if decision == RetryDecision::Retry {
                return Vec::new();
            }
        }
        let mut effects = vec![Effect::CancelTimer];
        effects.extend(self.on_timer(chain));
        effects
    }

    /// Record a dispatch result.
    ///
    /// Returns `true` when this result completes an all-failed fan-out for
    /// the current attempt. The caller decides whether that short-circuits.
    pub fn record_dispatch(&mut self, outcome: DispatchOutcome) -> bool {
        let late = self.instance.is_terminal();
        self.instance.dispatches.push(DispatchRecord {
            method_id: outcome.method_id.clone(),
            stage_index: outcome.stage_index,
            attempt: outcome.attempt,
            success: outcome.success,
            error: outcome.error,
            delivery_id: outcome.delivery_id,
            recorded_at: Utc::now(),
            late,
        });
        if late || self.instance.status != InstanceStatus::WaitingAck {
            return false;
        }

        let Some(fan_out) = self.fan_out.as_mut() else {
            return false;
        };
        if fan_out.stage_index != outcome.stage_index || fan_out.attempt != outcome.attempt {
            return false;
        }
        let was_all_failed = fan_out.all_failed();
        let Some(slot) = fan_out.outcomes.get_mut(&outcome.method_id) else {
            return false;
        };
        *slot = Some(outcome.success);
        !was_all_failed && fan_out.all_failed()
    }

    /// External acknowledgment; wins over any pending escalation
    pub fn acknowledge(&mut self, acknowledged_by: Option<String>) -> Vec<Effect> {
        let mut effects = Vec::new();
        if self.instance.is_terminal() {
            return effects;
        }
        self.instance.acknowledged_at = Some(Utc::now());
        self.instance.acknowledged_by = acknowledged_by;
        self.finish(InstanceStatus::Acknowledged, "acknowledged", &mut effects);
        effects
    }

    /// Force the instance to `Failed`
    pub fn fail(&mut self, reason: impl Into<String>) -> Vec<Effect> {
        let mut effects = Vec::new();
        if !self.instance.is_terminal() {
            self.finish(InstanceStatus::Failed, reason, &mut effects);
        }
        effects
    }

    fn enter_stage(&mut self, chain: &EscalationChain, index: usize, effects: &mut Vec<Effect>) {
        self.instance.current_stage_index = index;
        self.instance.attempt_in_stage = 0;
        if let Some(stage) = chain.stage(index) {
            info!(
                instance_id = %self.instance.id,
                chain_id = %chain.id,
                stage = stage.stage_order,
                methods = stage.delivery_methods.len(),
                "Entering escalation stage"
            );
            effects.push(Effect::StageEntered {
                stage_index: index,
                stage_order: stage.stage_order,
            });
        }
        self.dispatch_attempt(chain, effects);
    }

    fn dispatch_attempt(&mut self, chain: &EscalationChain, effects: &mut Vec<Effect>) {
        let index = self.instance.current_stage_index;
        let Some(stage) = chain.stage(index) else {
            self.finish(
                InstanceStatus::Failed,
                format!("stage index {} beyond chain length", index),
                effects,
            );
            return;
        };

        self.instance.attempt_in_stage += 1;
        let attempt = self.instance.attempt_in_stage;
        if !self.advance_to(
            InstanceStatus::Dispatching,
            Some(format!("stage {} attempt {}", stage.stage_order, attempt)),
            effects,
        ) {
            return;
        }

        if stage.is_delay_only() {
            self.fan_out = None;
        } else {
            self.fan_out = Some(FanOut {
                stage_index: index,
                attempt,
                outcomes: stage
                    .delivery_methods
                    .iter()
                    .map(|m| (m.clone(), None))
                    .collect(),
            });
            effects.push(Effect::Dispatch(DispatchOrder {
                stage_index: index,
                stage_order: stage.stage_order,
                attempt,
                method_ids: stage.delivery_methods.clone(),
            }));
        }

        if !self.advance_to(InstanceStatus::WaitingAck, None, effects) {
            return;
        }

        let delay = match policy::evaluate(stage, attempt, chain.has_stage_after(index)) {
            RetryDecision::Retry => stage.retry_delay(),
            RetryDecision::Advance | RetryDecision::Exhaust => stage.wait_duration(),
        };
        effects.push(Effect::ArmTimer { delay });
    }

    /// Non-terminal transition; an illegal edge is a bug and fails the instance.
    fn advance_to(
        &mut self,
        to: InstanceStatus,
        reason: Option<String>,
        effects: &mut Vec<Effect>,
    ) -> bool {
        match self.instance.transition(to, reason) {
            Ok(()) => true,
            Err(illegal) => {
                error!(instance_id = %self.instance.id, %illegal, "Escalation invariant violated");
                self.finish(InstanceStatus::Failed, illegal.to_string(), effects);
                false
            }
        }
    }

    fn finish(
        &mut self,
        status: InstanceStatus,
        reason: impl Into<String>,
        effects: &mut Vec<Effect>,
    ) {
        let reason = reason.into();
        if let Err(illegal) = self.instance.transition(status, Some(reason.clone())) {
            // Only reachable when already terminal
            error!(instance_id = %self.instance.id, %illegal, "Terminal transition rejected");
            return;
        }
        self.instance.terminal_reason = Some(reason);
        self.fan_out = None;
        effects.push(Effect::CancelTimer);
        effects.push(Effect::Finished { status });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chain::EscalationStage;
    use InstanceStatus::*;

    fn scenario_chain() -> EscalationChain {
        EscalationChain::new("ops", "Ops")
            .with_stage(EscalationStage::new(0, vec!["slack".into()], 60).with_retries(2, 30))
            .with_stage(EscalationStage::new(0, vec!["voice".into()], 300))
    }

    fn machine() -> InstanceMachine {
        InstanceMachine::new(NotificationInstance::new("ops", serde_json::json!({"a": 1})))
    }

    fn timer_delay(effects: &[Effect]) -> Option<Duration> {
        effects.iter().find_map(|e| match e {
            Effect::ArmTimer { delay } => Some(*delay),
            _ => None,
        })
    }

    fn dispatched(effects: &[Effect]) -> Vec<MethodId> {
        effects
            .iter()
            .filter_map(|e| match e {
                Effect::Dispatch(order) => Some(order.method_ids.clone()),
                _ => None,
            })
            .flatten()
            .collect()
    }

    #[test]
    fn test_scenario_sequence_without_ack() {
        let chain = scenario_chain();
        let mut m = machine();

        let effects = m.start(&chain);
        assert_eq!(dispatched(&effects), vec!["slack"]);
        assert_eq!(timer_delay(&effects), Some(Duration::from_secs(30)));
        assert_eq!(m.status(), WaitingAck);

        let effects = m.on_timer(&chain);
        assert_eq!(dispatched(&effects), vec!["slack"]);
        assert_eq!(timer_delay(&effects), Some(Duration::from_secs(60)));
        assert_eq!(m.instance().attempt_in_stage, 2);

        let effects = m.on_timer(&chain);
        assert_eq!(dispatched(&effects), vec!["voice"]);
        assert_eq!(timer_delay(&effects), Some(Duration::from_secs(300)));
        assert_eq!(m.instance().current_stage_index, 1);
        assert_eq!(m.instance().attempt_in_stage, 1);

        let effects = m.on_timer(&chain);
        assert!(effects.contains(&Effect::Finished { status: Exhausted }));
        assert!(m.is_terminal());
        assert_eq!(
            m.instance().status_path(),
            vec![
                Pending,
                Dispatching,
                WaitingAck,
                Dispatching,
                WaitingAck,
                Escalating,
                Dispatching,
                WaitingAck,
                Exhausted
            ]
        );
    }

    #[test]
    fn test_ack_cancels_and_ignores_later_timer() {
        let chain = scenario_chain();
        let mut m = machine();
        m.start(&chain);

        let effects = m.acknowledge(Some("alice".into()));
        assert_eq!(
            effects,
            vec![Effect::CancelTimer, Effect::Finished { status: Acknowledged }]
        );
        assert!(m.instance().acknowledged_at.is_some());
        assert_eq!(m.instance().acknowledged_by.as_deref(), Some("alice"));

        assert!(m.on_timer(&chain).is_empty());
        assert!(m.acknowledge(None).is_empty());
        assert_eq!(m.status(), Acknowledged);
    }

    #[test]
    fn test_inert_chain_exhausts_on_start() {
        let chain = EscalationChain::new("empty", "empty");
        let mut m = machine();
        let effects = m.start(&chain);
        assert!(dispatched(&effects).is_empty());
        assert!(effects.contains(&Effect::Finished { status: Exhausted }));
    }

    #[test]
    fn test_delay_only_stage_arms_wait_without_dispatch() {
        let chain = EscalationChain::new("c", "c")
            .with_stage(EscalationStage::new(0, vec![], 120).with_retries(3, 10))
            .with_stage(EscalationStage::new(0, vec!["email".into()], 60));
        let mut m = machine();

        let effects = m.start(&chain);
        assert!(dispatched(&effects).is_empty());
        assert_eq!(timer_delay(&effects), Some(Duration::from_secs(120)));
        assert_eq!(m.status(), WaitingAck);

        let effects = m.on_timer(&chain);
        assert_eq!(dispatched(&effects), vec!["email"]);
    }

    #[test]
    fn test_all_failed_detection_only_for_current_attempt() {
        let chain = EscalationChain::new("c", "c").with_stage(
            EscalationStage::new(0, vec!["a".into(), "b".into()], 60).with_retries(2, 20),
        );
        let mut m = machine();
        m.start(&chain);

        let outcome = |method: &str, attempt: u32, success: bool| DispatchOutcome {
            method_id: method.into(),
            stage_index: 0,
            attempt,
            success,
            error: (!success).then(|| "boom".to_string()),
            delivery_id: None,
        };

        assert!(!m.record_dispatch(outcome("a", 1, false)));
        // stale attempt number does not count
        assert!(!m.record_dispatch(outcome("b", 7, false)));
        assert!(m.record_dispatch(outcome("b", 1, false)));
        // already reported
        assert!(!m.record_dispatch(outcome("b", 1, false)));
        assert_eq!(m.instance().dispatches.len(), 4);
    }

    #[test]
    fn test_mixed_results_are_not_all_failed() {
        let chain = EscalationChain::new("c", "c")
            .with_stage(EscalationStage::new(0, vec!["a".into(), "b".into()], 60));
        let mut m = machine();
        m.start(&chain);
        let ok = DispatchOutcome {
            method_id: "a".into(),
            stage_index: 0,
            attempt: 1,
            success: true,
            error: None,
            delivery_id: Some("d-1".into()),
        };
        let failed = DispatchOutcome {
            method_id: "b".into(),
            success: false,
            delivery_id: None,
            error: Some("smtp down".into()),
            ..ok.clone()
        };
        assert!(!m.record_dispatch(ok));
        assert!(!m.record_dispatch(failed));
    }

    #[test]
    fn test_duplicate_failure_reports_signal_all_failed_once() {
        let chain = EscalationChain::new("c", "c")
            .with_stage(EscalationStage::new(0, vec!["pager".into()], 60));
        let mut m = machine();
        m.start(&chain);
        let failed = DispatchOutcome {
            method_id: "pager".into(),
            stage_index: 0,
            attempt: 1,
            success: false,
            error: Some("503".into()),
            delivery_id: None,
        };
        assert!(m.record_dispatch(failed.clone()));
        assert!(!m.record_dispatch(failed.clone()));
        assert!(!m.record_dispatch(failed));
    }

    #[test]
    fn test_short_circuit_keeps_pending_retry_interval() {
        let chain = EscalationChain::new("c", "c")
            .with_stage(EscalationStage::new(0, vec!["pager".into()], 60).with_retries(3, 30))
            .with_stage(EscalationStage::new(0, vec!["slack".into()], 120));
        let mut m = machine();
        m.start(&chain);

        // attempts 1 and 2 still have a retry ahead
        assert!(m.short_circuit(&chain).is_empty());
        assert_eq!(m.instance().attempt_in_stage, 1);
        m.on_timer(&chain);
        assert!(m.short_circuit(&chain).is_empty());
        m.on_timer(&chain);
        assert_eq!(m.instance().attempt_in_stage, 3);

        let effects = m.short_circuit(&chain);
        assert_eq!(effects.first(), Some(&Effect::CancelTimer));
        assert_eq!(dispatched(&effects), vec!["slack"]);
        assert_eq!(timer_delay(&effects), Some(Duration::from_secs(120)));
        assert_eq!(m.instance().current_stage_index, 1);
    }

    #[test]
    fn test_short_circuit_on_last_stage_exhausts() {
        let chain = EscalationChain::new("c", "c")
            .with_stage(EscalationStage::new(0, vec!["pager".into()], 60));
        let mut m = machine();
        m.start(&chain);
        let effects = m.short_circuit(&chain);
        assert!(effects.contains(&Effect::Finished { status: Exhausted }));
        assert!(m.short_circuit(&chain).is_empty());
    }

    #[test]
    fn test_late_result_recorded_after_terminal() {
        let chain = scenario_chain();
        let mut m = machine();
        m.start(&chain);
        m.acknowledge(None);
        let fired = m.record_dispatch(DispatchOutcome {
            method_id: "slack".into(),
            stage_index: 0,
            attempt: 1,
            success: true,
            error: None,
            delivery_id: None,
        });
        assert!(!fired);
        assert!(m.instance().dispatches[0].late);
    }

    #[test]
    fn test_stage_removed_mid_flight_fails() {
        let chain = scenario_chain();
        let mut m = machine();
        m.start(&chain);
        m.on_timer(&chain);
        m.on_timer(&chain);
        assert_eq!(m.instance().current_stage_index, 1);

        let shrunk = EscalationChain::new("ops", "Ops")
            .with_stage(EscalationStage::new(0, vec!["slack".into()], 60));
        let effects = m.on_timer(&shrunk);
        assert!(effects.contains(&Effect::Finished { status: Failed }));
        assert!(m
            .instance()
            .terminal_reason
            .as_deref()
            .unwrap_or_default()
            .contains("beyond chain length"));
    }

    #[test]
    fn test_edited_wait_applies_at_next_transition() {
        let mut chain = scenario_chain();
        let mut m = machine();
        m.start(&chain);
        m.on_timer(&chain);

        chain.stages[0].wait_duration_secs = 5;
        chain.stages[1].wait_duration_secs = 7;
        let effects = m.on_timer(&chain);
        assert_eq!(timer_delay(&effects), Some(Duration::from_secs(7)));
    }
}
