//! Per-instance actor
//!
//! Each live notification instance is owned by exactly one task. All inputs
//! for it (acks, timer fires, dispatch results, watchdog pokes) arrive on
//! two queues and are applied one at a time, so the state machine never sees
//! concurrent mutation. Acks are polled first.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::{mpsc, watch};
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use super::registry::{AckOutcome, AckRequest, InstanceInput};
use super::EngineContext;
use crate::chain::{DeliveryMethod, EscalationChain, MethodId};
use crate::dispatch::{DispatchPayload, DispatchReport};
use crate::error::{ConfigurationError, DispatchError, TimerError};
use crate::escalation::{
    AllFailedPolicy, DispatchOrder, DispatchOutcome, Effect, InstanceMachine, InstanceStatus,
    NotificationInstance,
};
use crate::events::EscalationEvent;
use crate::timer::{TimerFired, TimerHandle};

/// Acks arriving this close after a stage deadline still beat the deadline
const ACK_GRACE: Duration = Duration::from_millis(1);

struct ArmedTimer {
    handle: TimerHandle,
    deadline: Instant,
}

pub(crate) struct InstanceActor {
    ctx: Arc<EngineContext>,
    machine: InstanceMachine,
    armed: Option<ArmedTimer>,
    acks: mpsc::UnboundedReceiver<AckRequest>,
    inputs: mpsc::UnboundedReceiver<InstanceInput>,
    snapshot: watch::Sender<NotificationInstance>,
}

/// Stage orders are dense and 1-based
fn stage_index_of(stage_order: u32) -> usize {
    (stage_order as usize).saturating_sub(1)
}

impl InstanceActor {
    pub fn new(
        ctx: Arc<EngineContext>,
        instance: NotificationInstance,
        acks: mpsc::UnboundedReceiver<AckRequest>,
        inputs: mpsc::UnboundedReceiver<InstanceInput>,
        snapshot: watch::Sender<NotificationInstance>,
    ) -> Self {
        Self {
            ctx,
            machine: InstanceMachine::new(instance),
            armed: None,
            acks,
            inputs,
            snapshot,
        }
    }

    fn id(&self) -> &str {
        &self.machine.instance().id
    }

    #[tracing::instrument(
        level = "debug",
        skip_all,
        fields(instance_id = %self.machine.instance().id, chain_id = %chain.id)
    )]
    pub async fn run(mut self, chain: EscalationChain) {
        let effects = self.machine.start(&chain);
        self.apply(effects);
        self.publish_snapshot();

        while !self.machine.is_terminal() {
            tokio::select! {
                biased;
                Some(request) = self.acks.recv() => self.on_ack(request),
                Some(input) = self.inputs.recv() => match input {
                    InstanceInput::Timer(fired) => self.on_timer_fired(fired).await,
                    InstanceInput::DispatchResult(report) => self.on_dispatch_result(report),
                    InstanceInput::Rearm(reply) => {
                        let rearmed = self.on_rearm();
                        let _ = reply.send(rearmed);
                    }
                },
                _ = self.ctx.shutdown.cancelled() => {
                    debug!("Instance actor stopping on shutdown");
                    return;
                }
            }
            self.publish_snapshot();
        }

        self.retire();
    }

    fn on_ack(&mut self, request: AckRequest) {
        let reply = if self.machine.is_terminal() {
            Err(self.machine.status())
        } else {
            let effects = self.machine.acknowledge(request.acknowledged_by);
            self.apply(effects);
            Ok(AckOutcome::Accepted)
        };
        let _ = request.reply.send(reply);
    }

    async fn on_timer_fired(&mut self, fired: TimerFired) {
        let deadline = match &self.armed {
            Some(armed) if armed.handle == fired.handle => armed.deadline,
            _ => {
                debug!(timer = %fired.handle, "Ignoring stale timer fire");
                return;
            }
        };

        // An ack enqueued at or before the deadline tick always wins
        tokio::time::sleep_until(deadline.checked_add(ACK_GRACE).unwrap_or(deadline)).await;
        while let Ok(request) = self.acks.try_recv() {
            self.on_ack(request);
        }
        if self.machine.is_terminal() {
            return;
        }

        self.armed = None;
        let Some(chain) = self.resolve_chain() else {
            return;
        };
        let effects = self.machine.on_timer(&chain);
        self.apply(effects);
    }

    fn on_dispatch_result(&mut self, report: DispatchReport) {
        let instance = self.machine.instance();
        let stage_index = report
            .stage_order
            .map(stage_index_of)
            .unwrap_or(instance.current_stage_index);
        let attempt = report.attempt.unwrap_or(instance.attempt_in_stage);

        if report.result.success {
            debug!(
                method_id = %report.method_id,
                stage = stage_index + 1,
                attempt,
                delivery_id = report.result.delivery_id.as_deref().unwrap_or("-"),
                "Dispatch delivered"
            );
        } else {
            warn!(
                method_id = %report.method_id,
                stage = stage_index + 1,
                attempt,
                error = report.result.error.as_deref().unwrap_or("unknown"),
                "Dispatch failed"
            );
        }

        self.ctx.publish(EscalationEvent::DispatchCompleted {
            instance_id: self.id().to_string(),
            method_id: report.method_id.clone(),
            stage_order: stage_index as u32 + 1,
            attempt,
            success: report.result.success,
            error: report.result.error.clone(),
            late: false,
            timestamp: Utc::now(),
        });

        let all_failed = self.machine.record_dispatch(DispatchOutcome {
            method_id: report.method_id,
            stage_index,
            attempt,
            success: report.result.success,
            error: report.result.error,
            delivery_id: report.result.delivery_id,
        });
        if all_failed {
            self.on_all_failed(stage_index, attempt);
        }
    }

    fn on_all_failed(&mut self, stage_index: usize, attempt: u32) {
        let Some(chain) = self.resolve_chain() else {
            return;
        };
        let policy = chain
            .all_failed_policy
            .unwrap_or(self.ctx.config.all_failed_policy);
        let short_circuit = policy == AllFailedPolicy::ShortCircuit;

        warn!(
            stage = stage_index + 1,
            attempt, short_circuit, "Every delivery method failed for this attempt"
        );
        self.ctx.publish(EscalationEvent::AllDispatchesFailed {
            instance_id: self.id().to_string(),
            stage_order: stage_index as u32 + 1,
            attempt,
            short_circuit,
            timestamp: Utc::now(),
        });

        if short_circuit {
            let effects = self.machine.short_circuit(&chain);
            self.apply(effects);
        }
    }

    /// Re-arm a lost wait timer at its original deadline
    fn on_rearm(&mut self) -> bool {
        if self.machine.status() != InstanceStatus::WaitingAck {
            return false;
        }
        let deadline = match &self.armed {
            Some(armed) if self.ctx.scheduler.is_pending(&armed.handle) => return false,
            Some(armed) => armed.deadline,
            None => Instant::now(),
        };

        match self.ctx.scheduler.schedule_at(self.id(), deadline) {
            Ok(handle) => {
                let delay = deadline.saturating_duration_since(Instant::now());
                info!(
                    timer = %handle,
                    delay_ms = delay.as_millis() as u64,
                    "Re-armed lost stage timer"
                );
                self.armed = Some(ArmedTimer { handle, deadline });
                self.ctx.publish(EscalationEvent::TimerRearmed {
                    instance_id: self.id().to_string(),
                    delay_ms: delay.as_millis() as u64,
                    timestamp: Utc::now(),
                });
                true
            }
            Err(e) => {
                self.timer_fault(e);
                false
            }
        }
    }

    fn apply(&mut self, effects: Vec<Effect>) {
        for effect in effects {
            match effect {
                Effect::StageEntered { stage_order, .. } => {
                    self.ctx.publish(EscalationEvent::StageEntered {
                        instance_id: self.id().to_string(),
                        chain_id: self.machine.instance().chain_id.clone(),
                        stage_order,
                        timestamp: Utc::now(),
                    });
                }
                Effect::Dispatch(order) => self.dispatch(order),
                Effect::ArmTimer { delay } => self.arm(delay),
                Effect::CancelTimer => self.disarm(),
                Effect::Finished { status } => self.on_finished(status),
            }
        }
    }

    fn dispatch(&self, order: DispatchOrder) {
        let instance = self.machine.instance();
        for method_id in order.method_ids {
            let payload = DispatchPayload {
                instance_id: instance.id.clone(),
                chain_id: instance.chain_id.clone(),
                stage_order: order.stage_order,
                attempt: order.attempt,
                alert: instance.payload.clone(),
            };
            let method = self.resolve_method(&method_id);

            info!(
                method_id = %method_id,
                stage = order.stage_order,
                attempt = order.attempt,
                "Dispatching notification"
            );
            self.ctx.publish(EscalationEvent::DispatchIssued {
                instance_id: instance.id.clone(),
                chain_id: instance.chain_id.clone(),
                method_id: method_id.clone(),
                stage_order: order.stage_order,
                attempt: order.attempt,
                timestamp: Utc::now(),
            });

            let ctx = self.ctx.clone();
            tokio::spawn(async move {
                let result = match method {
                    Ok(method) => {
                        let limit = ctx.config.dispatch_timeout();
                        match tokio::time::timeout(limit, ctx.dispatcher.send(&method, &payload))
                            .await
                        {
                            Ok(result) => result,
                            Err(_) => DispatchError::Timeout(limit).into(),
                        }
                    }
                    Err(e) => e.into(),
                };
                let report = DispatchReport {
                    method_id,
                    stage_order: Some(payload.stage_order),
                    attempt: Some(payload.attempt),
                    result,
                };
                if let Err(e) = ctx.route_dispatch_result(&payload.instance_id, report) {
                    debug!(instance_id = %payload.instance_id, "Dispatch result dropped: {}", e);
                }
            });
        }
    }

    fn arm(&mut self, delay: Duration) {
        let Some(deadline) = Instant::now().checked_add(delay) else {
            self.timer_fault(TimerError::DelayOutOfRange(delay));
            return;
        };
        match self.ctx.scheduler.schedule_at(self.id(), deadline) {
            Ok(handle) => {
                self.armed = Some(ArmedTimer { handle, deadline });
                self.ctx.publish(EscalationEvent::TimerArmed {
                    instance_id: self.id().to_string(),
                    delay_ms: delay.as_millis() as u64,
                    timestamp: Utc::now(),
                });
            }
            Err(e) => self.timer_fault(e),
        }
    }

    fn disarm(&mut self) {
        if let Some(armed) = self.armed.take() {
            if let Err(e) = self.ctx.scheduler.cancel(&armed.handle) {
                warn!(timer = %armed.handle, "Failed to cancel stage timer: {}", e);
            }
        }
    }

    fn timer_fault(&mut self, err: TimerError) {
        error!(error = %err, "Stage timer could not be armed");
        self.armed = None;
        let effects = self.machine.fail(format!("timer fault: {}", err));
        self.apply(effects);
    }

    fn on_finished(&self, status: InstanceStatus) {
        let instance = self.machine.instance();
        let event = match status {
            InstanceStatus::Acknowledged => {
                info!(
                    acknowledged_by = instance.acknowledged_by.as_deref().unwrap_or("-"),
                    "Escalation acknowledged"
                );
                EscalationEvent::InstanceAcknowledged {
                    instance_id: instance.id.clone(),
                    chain_id: instance.chain_id.clone(),
                    acknowledged_by: instance.acknowledged_by.clone(),
                    timestamp: Utc::now(),
                }
            }
            InstanceStatus::Exhausted => {
                warn!("Escalation exhausted without acknowledgment");
                EscalationEvent::InstanceExhausted {
                    instance_id: instance.id.clone(),
                    chain_id: instance.chain_id.clone(),
                    timestamp: Utc::now(),
                }
            }
            _ => {
                let reason = instance.terminal_reason.clone().unwrap_or_default();
                warn!(reason = %reason, "Escalation failed");
                EscalationEvent::InstanceFailed {
                    instance_id: instance.id.clone(),
                    chain_id: instance.chain_id.clone(),
                    reason,
                    timestamp: Utc::now(),
                }
            }
        };
        self.ctx.publish(event);
    }

    /// Re-read the chain; an unusable chain fails the instance
    fn resolve_chain(&mut self) -> Option<EscalationChain> {
        let chain_id = self.machine.instance().chain_id.clone();
        let failure = match self.ctx.chains.get(&chain_id) {
            Ok(Some(chain)) if !chain.is_enabled && self.ctx.config.fail_on_disabled_chain => {
                ConfigurationError::ChainDisabled { chain_id }.to_string()
            }
            Ok(Some(chain)) => match chain.validate() {
                Ok(()) => return Some(chain),
                Err(e) => e.to_string(),
            },
            Ok(None) => ConfigurationError::ChainNotFound { chain_id }.to_string(),
            Err(e) => format!("chain store error: {}", e),
        };

        error!(reason = %failure, "Chain could not be resolved");
        self.disarm();
        let effects = self.machine.fail(failure);
        self.apply(effects);
        None
    }

    fn resolve_method(&self, method_id: &MethodId) -> Result<DeliveryMethod, DispatchError> {
        match self.ctx.methods.get(method_id) {
            Ok(Some(method)) if method.is_enabled => Ok(method),
            Ok(Some(_)) => Err(DispatchError::MethodDisabled {
                method_id: method_id.clone(),
            }),
            Ok(None) => Err(DispatchError::MethodNotFound {
                method_id: method_id.clone(),
            }),
            Err(e) => Err(DispatchError::Lookup(e.to_string())),
        }
    }

    fn publish_snapshot(&self) {
        self.snapshot.send_replace(self.machine.instance().clone());
    }

    /// Archive the finished instance, then flush anything still queued
    fn retire(mut self) {
        self.publish_snapshot();
        let id = self.id().to_string();
        let status = self.machine.status();
        self.ctx.registry.retire(self.machine.instance().clone());
        if let Ok(true) = self.ctx.scheduler.cancel_instance(&id) {
            warn!("Dropped a stage timer left behind by a finished instance");
        }
        debug!(%status, "Instance retired");

        self.acks.close();
        self.inputs.close();
        while let Ok(input) = self.inputs.try_recv() {
            match input {
                InstanceInput::DispatchResult(report) => {
                    let _ = self.ctx.record_late(&id, report);
                }
                InstanceInput::Rearm(reply) => {
                    let _ = reply.send(false);
                }
                InstanceInput::Timer(_) => {}
            }
        }
        while let Ok(request) = self.acks.try_recv() {
            let _ = request.reply.send(Err(status));
        }
    }
}
