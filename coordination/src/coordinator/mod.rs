//! Escalation coordinator
//!
//! Entry point of the engine. Owns the timer scheduler, the event bus and
//! the registry of live instances, and spawns one [`actor`] task per
//! triggered alert.
//!
//! ```text
//! trigger ──▶ InstanceActor (per instance) ◀── acks (priority queue)
//!                 │      ▲        ▲
//!      dispatch   │      │        └── timer fires ◀── fire router ◀── TimerScheduler
//!      tasks  ◀───┘      └── dispatch results (own tasks + external callbacks)
//! ```
//!
//! Chains and delivery methods are looked up again at every transition, so
//! admin edits apply to in-flight instances from their next step on.

mod actor;
mod registry;

pub use registry::AckOutcome;

use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::Utc;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::chain::{SharedChainStore, SharedMethodStore};
use crate::config::EngineConfig;
use crate::dispatch::{DispatchReport, SharedDispatcher};
use crate::error::{ConfigurationError, EngineError, EngineResult};
use crate::escalation::{InstanceId, InstanceStatus, NotificationInstance};
use crate::events::{
    spawn_recorder, EscalationEvent, EventBus, EventBusExt, EventFilter, EventHistory,
    FilteredReceiver, SharedEventBus, SharedEventHistory,
};
use crate::timer::{TimerFireReceiver, TimerFired, TimerScheduler};

use actor::InstanceActor;
use registry::{AckReply, AckRequest, InstanceInput, InstanceRegistry, LiveEntry};

/// Shared reference to the coordinator
pub type SharedCoordinator = Arc<EscalationCoordinator>;

/// State shared by the coordinator, its background tasks and every actor
pub(crate) struct EngineContext {
    pub chains: SharedChainStore,
    pub methods: SharedMethodStore,
    pub dispatcher: SharedDispatcher,
    pub scheduler: TimerScheduler,
    pub bus: SharedEventBus,
    pub registry: InstanceRegistry,
    pub config: EngineConfig,
    pub shutdown: CancellationToken,
}

impl EngineContext {
    pub fn publish(&self, event: EscalationEvent) {
        self.bus.publish(event);
    }

    fn route_timer_fire(&self, fired: TimerFired) {
        let instance_id = fired.handle.instance_id.clone();
        if self
            .registry
            .send_input(&instance_id, InstanceInput::Timer(fired))
            .is_err()
        {
            debug!(
                instance_id = %instance_id,
                "Timer fired for an instance that is no longer live"
            );
        }
    }

    /// Deliver a dispatch result to its live instance, or archive it as late
    pub fn route_dispatch_result(
        &self,
        instance_id: &str,
        report: DispatchReport,
    ) -> EngineResult<()> {
        match self
            .registry
            .send_input(instance_id, InstanceInput::DispatchResult(report))
        {
            Ok(()) => Ok(()),
            Err(InstanceInput::DispatchResult(report)) => self.record_late(instance_id, report),
            Err(_) => Ok(()),
        }
    }

    /// Audit a result that arrived after the instance finished. No transition.
    pub fn record_late(&self, instance_id: &str, report: DispatchReport) -> EngineResult<()> {
        let (last_index, last_attempt) = self
            .registry
            .archived_position(instance_id)
            .ok_or_else(|| EngineError::instance_not_found(instance_id))?;
        let stage_index = report
            .stage_order
            .map(|order| (order as usize).saturating_sub(1))
            .unwrap_or(last_index);
        let attempt = report.attempt.unwrap_or(last_attempt);

        if !self
            .registry
            .record_late(instance_id, stage_index, attempt, &report)
        {
            return Err(EngineError::instance_not_found(instance_id));
        }

        info!(
            instance_id = %instance_id,
            method_id = %report.method_id,
            success = report.result.success,
            "Late dispatch result recorded"
        );
        self.publish(EscalationEvent::DispatchCompleted {
            instance_id: instance_id.to_string(),
            method_id: report.method_id,
            stage_order: stage_index as u32 + 1,
            attempt,
            success: report.result.success,
            error: report.result.error,
            late: true,
            timestamp: Utc::now(),
        });
        Ok(())
    }

    async fn rearm_stalled(&self) -> usize {
        let mut replies = Vec::new();
        self.registry.send_all(|| {
            let (reply, response) = oneshot::channel();
            replies.push(response);
            InstanceInput::Rearm(reply)
        });
        futures::future::join_all(replies)
            .await
            .into_iter()
            .filter(|rearmed| matches!(rearmed, Ok(true)))
            .count()
    }
}

/// Runs escalation chains for triggered alerts
pub struct EscalationCoordinator {
    ctx: Arc<EngineContext>,
    history: SharedEventHistory,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl EscalationCoordinator {
    /// Start the coordinator and its background tasks on the current runtime
    pub fn start(
        chains: SharedChainStore,
        methods: SharedMethodStore,
        dispatcher: SharedDispatcher,
        config: EngineConfig,
    ) -> SharedCoordinator {
        let shutdown = CancellationToken::new();
        let (scheduler, fires, driver) = TimerScheduler::start(shutdown.clone());
        let bus = EventBus::with_capacity(config.event_capacity).shared();
        let history = EventHistory::new(config.history_capacity).shared();
        let recorder = spawn_recorder(bus.clone(), history.clone(), shutdown.clone());

        let ctx = Arc::new(EngineContext {
            chains,
            methods,
            dispatcher,
            scheduler,
            bus,
            registry: InstanceRegistry::new(config.archive_capacity),
            config,
            shutdown,
        });

        let mut tasks = vec![
            driver,
            recorder,
            tokio::spawn(route_timer_fires(ctx.clone(), fires)),
        ];
        if let Some(period) = ctx.config.watchdog_interval() {
            tasks.push(tokio::spawn(watchdog(ctx.clone(), period)));
        }

        info!(
            all_failed_policy = ?ctx.config.all_failed_policy,
            dispatch_timeout_secs = ctx.config.dispatch_timeout_secs,
            watchdog_interval_secs = ctx.config.watchdog_interval_secs,
            "Escalation coordinator started"
        );

        Arc::new(Self {
            ctx,
            history,
            tasks: Mutex::new(tasks),
        })
    }

    /// Start escalating an alert through `chain_id`.
    ///
    /// Missing, disabled and invalid chains are rejected here and no
    /// instance is created.
    pub fn trigger(&self, chain_id: &str, payload: serde_json::Value) -> EngineResult<InstanceId> {
        if self.ctx.shutdown.is_cancelled() {
            return Err(EngineError::ShuttingDown);
        }

        let chain = self
            .ctx
            .chains
            .get(chain_id)?
            .ok_or_else(|| ConfigurationError::ChainNotFound {
                chain_id: chain_id.to_string(),
            })?;
        if !chain.is_enabled {
            return Err(ConfigurationError::ChainDisabled {
                chain_id: chain_id.to_string(),
            }
            .into());
        }
        chain.validate()?;

        let instance = NotificationInstance::new(chain_id, payload);
        let instance_id = instance.id.clone();

        let (ack_tx, ack_rx) = mpsc::unbounded_channel();
        let (input_tx, input_rx) = mpsc::unbounded_channel();
        let (snapshot_tx, snapshot_rx) = watch::channel(instance.clone());
        self.ctx.registry.insert(
            instance_id.clone(),
            LiveEntry {
                acks: ack_tx,
                inputs: input_tx,
                snapshot: snapshot_rx,
            },
        );

        info!(
            instance_id = %instance_id,
            chain_id,
            stages = chain.stages.len(),
            "Escalation triggered"
        );
        self.ctx.publish(EscalationEvent::InstanceCreated {
            instance_id: instance_id.clone(),
            chain_id: chain_id.to_string(),
            timestamp: Utc::now(),
        });

        let actor = InstanceActor::new(self.ctx.clone(), instance, ack_rx, input_rx, snapshot_tx);
        tokio::spawn(actor.run(chain));

        Ok(instance_id)
    }

    /// Stop the escalation of a live instance.
    ///
    /// Acknowledging an already acknowledged instance is not an error.
    /// Acknowledging an exhausted or failed one is.
    pub async fn acknowledge(
        &self,
        instance_id: &str,
        acknowledged_by: Option<String>,
    ) -> EngineResult<AckOutcome> {
        let (reply, response) = oneshot::channel();
        let request = AckRequest {
            acknowledged_by,
            reply,
        };
        if self.ctx.registry.send_ack(instance_id, request).is_ok() {
            if let Ok(reply) = response.await {
                return ack_result(instance_id, reply);
            }
        }

        match self.ctx.registry.archived(instance_id) {
            Some(instance) => ack_result(instance_id, Err(instance.status)),
            None if self.ctx.shutdown.is_cancelled() => Err(EngineError::ShuttingDown),
            None => Err(EngineError::instance_not_found(instance_id)),
        }
    }

    /// Dispatch-result callback for adapters that report asynchronously
    pub fn on_dispatch_result(
        &self,
        instance_id: &str,
        report: DispatchReport,
    ) -> EngineResult<()> {
        self.ctx.route_dispatch_result(instance_id, report)
    }

    /// Route a scheduler fire to its instance. Fires for finished instances
    /// are dropped.
    pub fn on_timer_fire(&self, fired: TimerFired) {
        self.ctx.route_timer_fire(fired);
    }

    /// Current snapshot of a live or archived instance
    pub fn instance(&self, instance_id: &str) -> EngineResult<NotificationInstance> {
        if let Some(snapshot) = self.ctx.registry.watch_live(instance_id) {
            return Ok(snapshot.borrow().clone());
        }
        self.ctx
            .registry
            .archived(instance_id)
            .ok_or_else(|| EngineError::instance_not_found(instance_id))
    }

    pub fn live_instances(&self) -> Vec<NotificationInstance> {
        self.ctx.registry.live_snapshots()
    }

    /// Live instances followed by archived ones
    pub fn instances(&self) -> Vec<NotificationInstance> {
        let mut all = self.ctx.registry.live_snapshots();
        let archived = self.ctx.registry.archived_snapshots();
        all.retain(|live| !archived.iter().any(|a| a.id == live.id));
        all.extend(archived);
        all
    }

    pub fn live_count(&self) -> usize {
        self.ctx.registry.live_count()
    }

    /// Follow an instance's snapshots as it progresses
    pub fn watch(&self, instance_id: &str) -> EngineResult<watch::Receiver<NotificationInstance>> {
        if let Some(snapshot) = self.ctx.registry.watch_live(instance_id) {
            return Ok(snapshot);
        }
        let archived = self
            .ctx
            .registry
            .archived(instance_id)
            .ok_or_else(|| EngineError::instance_not_found(instance_id))?;
        let (_, snapshot) = watch::channel(archived);
        Ok(snapshot)
    }

    /// Resolve once the instance reaches a terminal status
    pub async fn wait_terminal(&self, instance_id: &str) -> EngineResult<NotificationInstance> {
        if let Some(mut snapshot) = self.ctx.registry.watch_live(instance_id) {
            if let Ok(done) = snapshot.wait_for(|i| i.is_terminal()).await {
                return Ok(done.clone());
            }
        }
        match self.ctx.registry.archived(instance_id) {
            Some(instance) => Ok(instance),
            None if self.ctx.shutdown.is_cancelled() => Err(EngineError::ShuttingDown),
            None => Err(EngineError::instance_not_found(instance_id)),
        }
    }

    /// Re-arm every waiting instance whose timer is no longer scheduled
    /// (e.g. after a scheduler reset). Returns how many were re-armed.
    pub async fn rearm_stalled(&self) -> usize {
        let rearmed = self.ctx.rearm_stalled().await;
        if rearmed > 0 {
            warn!(rearmed, "Re-armed stalled instances");
        }
        rearmed
    }

    pub fn scheduler(&self) -> &TimerScheduler {
        &self.ctx.scheduler
    }

    pub fn chains(&self) -> &SharedChainStore {
        &self.ctx.chains
    }

    pub fn methods(&self) -> &SharedMethodStore {
        &self.ctx.methods
    }

    pub fn config(&self) -> &EngineConfig {
        &self.ctx.config
    }

    pub fn events(&self) -> broadcast::Receiver<EscalationEvent> {
        self.ctx.bus.subscribe()
    }

    pub fn subscribe_filtered(&self, filter: EventFilter) -> FilteredReceiver {
        self.ctx.bus.subscribe_filtered(filter)
    }

    pub fn history(&self) -> &SharedEventHistory {
        &self.history
    }

    pub fn is_shutting_down(&self) -> bool {
        self.ctx.shutdown.is_cancelled()
    }

    /// Stop background tasks and actors. Live instances are left as they are.
    pub async fn shutdown(&self) {
        self.ctx.shutdown.cancel();
        let tasks = self
            .tasks
            .lock()
            .map(|mut tasks| std::mem::take(&mut *tasks))
            .unwrap_or_default();
        for task in tasks {
            if let Err(e) = task.await {
                warn!("Coordinator task ended abnormally: {}", e);
            }
        }
        info!(
            live = self.ctx.registry.live_count(),
            "Escalation coordinator stopped"
        );
    }
}

fn ack_result(instance_id: &str, reply: AckReply) -> EngineResult<AckOutcome> {
    match reply {
        Ok(outcome) => Ok(outcome),
        Err(InstanceStatus::Acknowledged) => Ok(AckOutcome::AlreadyAcknowledged),
        Err(status) => Err(EngineError::InstanceTerminated {
            instance_id: instance_id.to_string(),
            status,
        }),
    }
}

async fn route_timer_fires(ctx: Arc<EngineContext>, mut fires: TimerFireReceiver) {
    loop {
        tokio::select! {
            _ = ctx.shutdown.cancelled() => break,
            fired = fires.recv() => match fired {
                Some(fired) => ctx.route_timer_fire(fired),
                None => break,
            },
        }
    }
    debug!("Timer fire router stopped");
}

async fn watchdog(ctx: Arc<EngineContext>, period: Duration) {
    let mut ticker = tokio::time::interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    // first tick completes immediately
    ticker.tick().await;
    loop {
        tokio::select! {
            _ = ctx.shutdown.cancelled() => break,
            _ = ticker.tick() => {
                let rearmed = ctx.rearm_stalled().await;
                if rearmed > 0 {
                    warn!(rearmed, "Watchdog re-armed stalled instances");
                }
            }
        }
    }
    debug!("Watchdog stopped");
}
