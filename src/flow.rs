pub mod builder;
pub mod config;

use std::{
    collections::HashMap,
    panic::AssertUnwindSafe,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Weak,
    },
    time::Duration,
};
use async_trait::async_trait;
use eip_adapter::SourceAdapter;
use futures::FutureExt;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use strum_macros::Display;
use tokio::{sync::Mutex, task::JoinHandle, time::Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

use crate::{
    channel::{ChannelRef, MessageSubscriber},
    endpoint::{panic_error, panic_message, Endpoint, EndpointKind, SweepOutcome},
    error::FlowError,
    message::{error_message, Message},
    metrics::{FlowMetrics, MetricsSnapshot},
    poller::Poller,
};

pub use builder::FlowBuilder;
pub use config::FlowConfig;

pub const DEFAULT_DRAIN_TIMEOUT: Duration = Duration::from_secs(5);
const DRAIN_CHECK_INTERVAL: Duration = Duration::from_millis(10);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
pub enum FlowState {
    Stopped,
    Running,
}

/// What `stop` does with messages still inside the flow.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum ShutdownPolicy {
    /// Let in-flight messages finish, bounded by the drain timeout.
    #[default]
    Drain,
    /// Drop whatever is queued right away.
    Discard,
}

/// One endpoint wired between its input and output channels.
pub(crate) struct Stage {
    pub(crate) name: String,
    pub(crate) endpoint: Arc<dyn Endpoint>,
    pub(crate) input: ChannelRef,
    pub(crate) output: Option<ChannelRef>,
    pub(crate) concurrency: usize,
}

pub(crate) struct Inbound {
    pub(crate) source: Arc<dyn SourceAdapter>,
    pub(crate) poller: Poller,
    pub(crate) channel: ChannelRef,
}

/// Error and discard routing plus counters, shared by every task of a flow.
pub(crate) struct FlowContext {
    flow: String,
    error_channel: Option<ChannelRef>,
    discard_channel: Option<ChannelRef>,
    metrics: Arc<FlowMetrics>,
}

impl FlowContext {
    async fn report(&self, endpoint: &str, err: FlowError, original: Vec<Message>) {
        self.metrics.failed();
        let Some(channel) = &self.error_channel else {
            error!(flow = %self.flow, endpoint, kind = %err.kind(), "message failed: {}", err);
            return;
        };
        let msg = error_message(&err, Some(endpoint), original);
        if let Err(e) = channel.send(msg).await {
            error!(flow = %self.flow, endpoint, channel = %channel.name(), "could not publish error ({}): {}", err, e);
        }
    }

    async fn discard(&self, endpoint: &str, messages: Vec<Message>) {
        if messages.is_empty() {
            return;
        }
        self.metrics.discarded(messages.len() as u64);
        let Some(channel) = &self.discard_channel else {
            for msg in &messages {
                debug!(flow = %self.flow, endpoint, message_id = %msg.id(), "discarded");
            }
            return;
        };
        for msg in messages {
            let id = msg.id().to_string();
            if let Err(e) = channel.send(msg).await {
                warn!(flow = %self.flow, endpoint, message_id = %id, "could not route discarded message: {}", e);
            }
        }
    }

    async fn forward(&self, stage: &Stage, messages: Vec<Message>) {
        if messages.is_empty() {
            return;
        }
        let Some(output) = &stage.output else {
            warn!(flow = %self.flow, endpoint = %stage.name, count = messages.len(), "terminal stage produced messages, dropped");
            return;
        };
        for msg in messages {
            match output.send(msg.clone()).await {
                Ok(()) => self.metrics.emitted(1),
                Err(e) => self.report(&stage.name, e, vec![msg]).await,
            }
        }
    }

    /// Run one message through a stage. Never fails: every outcome is routed.
    async fn dispatch(&self, stage: &Stage, msg: Message) {
        trace!(flow = %self.flow, endpoint = %stage.name, message_id = %msg.id(), "processing");
        let kind = stage.endpoint.kind();
        let outcome = AssertUnwindSafe(stage.endpoint.process(msg.clone()))
            .catch_unwind()
            .await
            .unwrap_or_else(|payload| Err(panic_error(kind, panic_message(payload))));

        match outcome {
            Ok(disposition) => {
                match kind {
                    EndpointKind::Aggregator if !disposition.emitted.is_empty() => self.metrics.released(),
                    EndpointKind::OutboundAdapter => self.metrics.delivered(),
                    _ => {}
                }
                self.discard(&stage.name, disposition.discarded).await;
                if let Some((err, originals)) = disposition.failed {
                    self.report(&stage.name, err, originals).await;
                }
                self.forward(stage, disposition.emitted).await;
            }
            Err(e) => self.report(&stage.name, e, vec![msg]).await,
        }
    }

    async fn sweep(&self, stage: &Stage) {
        for outcome in stage.endpoint.sweep().await {
            self.metrics.expired();
            match outcome {
                SweepOutcome::Emit(msg) => self.forward(stage, vec![msg]).await,
                SweepOutcome::Failed(err, parts) => self.report(&stage.name, err, parts).await,
            }
        }
    }
}

/// Runs a stage inline for every message published on its pub-sub input.
/// Holds the stage weakly: the stage owns the channel that owns this subscriber.
struct StageSubscriber {
    ctx: Arc<FlowContext>,
    name: String,
    stage: Weak<Stage>,
}

#[async_trait]
impl MessageSubscriber for StageSubscriber {
    fn name(&self) -> String {
        self.name.clone()
    }

    async fn on_message(&self, msg: &Message) -> anyhow::Result<()> {
        if let Some(stage) = self.stage.upgrade() {
            self.ctx.dispatch(&stage, msg.clone()).await;
        }
        Ok(())
    }
}

struct Running {
    stop_pollers: CancellationToken,
    stop_sweepers: CancellationToken,
    stop_workers: CancellationToken,
    pollers: Vec<JoinHandle<()>>,
    sweepers: Vec<JoinHandle<()>>,
    workers: Vec<JoinHandle<()>>,
}

/// An assembled pipeline. Owns its channels, stages and pollers; nothing is
/// shared with other flows.
pub struct Flow {
    name: String,
    channels: Vec<ChannelRef>,
    by_name: HashMap<String, ChannelRef>,
    stages: Vec<Arc<Stage>>,
    inbound: Option<Inbound>,
    input: ChannelRef,
    output: Option<ChannelRef>,
    drain_timeout: Duration,
    shutdown: ShutdownPolicy,
    ctx: Arc<FlowContext>,
    running: AtomicBool,
    runtime: Mutex<Option<Running>>,
}

impl std::fmt::Debug for Flow {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Flow")
            .field("name", &self.name)
            .field("state", &self.state())
            .field("stages", &self.stage_names())
            .finish()
    }
}

pub(crate) struct FlowParts {
    pub(crate) name: String,
    pub(crate) channels: Vec<ChannelRef>,
    pub(crate) stages: Vec<Stage>,
    pub(crate) inbound: Option<Inbound>,
    pub(crate) input: ChannelRef,
    pub(crate) output: Option<ChannelRef>,
    pub(crate) error_channel: Option<ChannelRef>,
    pub(crate) discard_channel: Option<ChannelRef>,
    pub(crate) drain_timeout: Duration,
    pub(crate) shutdown: ShutdownPolicy,
}

impl Flow {
    pub fn builder(name: impl Into<String>) -> FlowBuilder {
        FlowBuilder::new(name)
    }

    /// Wires stages to their pub-sub inputs once; channels stay closed until `start`.
    pub(crate) fn assemble(parts: FlowParts) -> Result<Flow, FlowError> {
        let ctx = Arc::new(FlowContext {
            flow: parts.name.clone(),
            error_channel: parts.error_channel,
            discard_channel: parts.discard_channel,
            metrics: Arc::new(FlowMetrics::new(&parts.name)),
        });
        let stages: Vec<Arc<Stage>> = parts.stages.into_iter().map(Arc::new).collect();
        for stage in &stages {
            if stage.input.as_queue().is_none() {
                stage.input.subscribe(Arc::new(StageSubscriber {
                    ctx: ctx.clone(),
                    name: stage.name.clone(),
                    stage: Arc::downgrade(stage),
                }))?;
            }
        }
        let by_name = parts
            .channels
            .iter()
            .map(|c| (c.name().to_string(), c.clone()))
            .collect();

        Ok(Flow {
            name: parts.name,
            channels: parts.channels,
            by_name,
            stages,
            inbound: parts.inbound,
            input: parts.input,
            output: parts.output,
            drain_timeout: parts.drain_timeout,
            shutdown: parts.shutdown,
            ctx,
            running: AtomicBool::new(false),
            runtime: Mutex::new(None),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn state(&self) -> FlowState {
        if self.running.load(Ordering::SeqCst) {
            FlowState::Running
        } else {
            FlowState::Stopped
        }
    }

    pub fn metrics(&self) -> MetricsSnapshot {
        self.ctx.metrics.snapshot()
    }

    pub fn channel(&self, name: &str) -> Option<ChannelRef> {
        self.by_name.get(name).cloned()
    }

    pub fn channel_names(&self) -> Vec<String> {
        self.channels.iter().map(|c| c.name().to_string()).collect()
    }

    pub fn stage_names(&self) -> Vec<String> {
        self.stages.iter().map(|s| s.name.clone()).collect()
    }

    /// The channel the first stage (or the poller) feeds from.
    pub fn input_channel(&self) -> ChannelRef {
        self.input.clone()
    }

    /// Open end of the flow, if it does not finish in an outbound adapter.
    pub fn output_channel(&self) -> Option<ChannelRef> {
        self.output.clone()
    }

    pub async fn send(&self, channel: &str, msg: Message) -> Result<(), FlowError> {
        let ch = self
            .channel(channel)
            .ok_or_else(|| FlowError::Config(format!("flow `{}` has no channel `{}`", self.name, channel)))?;
        ch.send(msg).await?;
        if Arc::ptr_eq(&ch, &self.input) {
            self.ctx.metrics.received(1);
        }
        Ok(())
    }

    pub fn subscribe(&self, channel: &str, subscriber: Arc<dyn MessageSubscriber>) -> Result<(), FlowError> {
        let ch = self
            .channel(channel)
            .ok_or_else(|| FlowError::Config(format!("flow `{}` has no channel `{}`", self.name, channel)))?;
        ch.subscribe(subscriber)
    }

    pub async fn start(&self) -> Result<(), FlowError> {
        let mut runtime = self.runtime.lock().await;
        if runtime.is_some() {
            return Err(FlowError::Lifecycle(format!("flow `{}` is already running", self.name)));
        }

        for channel in &self.channels {
            channel.open();
        }

        let stop_workers = CancellationToken::new();
        let stop_sweepers = CancellationToken::new();
        let mut workers = Vec::new();
        let mut sweepers = Vec::new();
        for stage in &self.stages {
            if stage.input.as_queue().is_some() {
                for n in 0..stage.concurrency {
                    workers.push(tokio::spawn(run_worker(
                        self.ctx.clone(),
                        stage.clone(),
                        n,
                        stop_workers.child_token(),
                    )));
                }
            }
            if let Some(interval) = stage.endpoint.sweep_interval() {
                sweepers.push(tokio::spawn(run_sweeper(
                    self.ctx.clone(),
                    stage.clone(),
                    interval,
                    stop_sweepers.child_token(),
                )));
            }
        }

        let stop_pollers = CancellationToken::new();
        let mut pollers = Vec::new();
        if let Some(inbound) = &self.inbound {
            pollers.push(inbound.poller.spawn(
                self.name.clone(),
                inbound.source.clone(),
                inbound.channel.clone(),
                self.ctx.metrics.clone(),
                stop_pollers.child_token(),
            ));
        }

        *runtime = Some(Running {
            stop_pollers,
            stop_sweepers,
            stop_workers,
            pollers,
            sweepers,
            workers,
        });
        self.running.store(true, Ordering::SeqCst);
        info!(flow = %self.name, stages = self.stages.len(), channels = self.channels.len(), "flow started");
        Ok(())
    }

    /// Stopping a stopped flow does nothing.
    pub async fn stop(&self) -> Result<(), FlowError> {
        let mut runtime = self.runtime.lock().await;
        let Some(running) = runtime.take() else {
            return Ok(());
        };
        info!(flow = %self.name, policy = ?self.shutdown, "stopping flow");

        running.stop_pollers.cancel();
        for handle in running.pollers {
            if let Err(e) = handle.await {
                warn!(flow = %self.name, "poller task ended abnormally: {}", e);
            }
        }

        let draining = self.shutdown == ShutdownPolicy::Drain;
        if draining && !self.drain().await {
            warn!(flow = %self.name, timeout_ms = self.drain_timeout.as_millis() as u64, "drain timed out");
        }

        // Sweepers feed downstream channels too: stop them, expire what is
        // overdue and drain again before anything is closed.
        running.stop_sweepers.cancel();
        for handle in running.sweepers {
            if let Err(e) = handle.await {
                warn!(flow = %self.name, "sweeper task ended abnormally: {}", e);
            }
        }
        if draining {
            for stage in self.stages.iter().filter(|s| s.endpoint.sweep_interval().is_some()) {
                self.ctx.sweep(stage).await;
            }
            if !self.drain().await {
                warn!(flow = %self.name, "drain after final sweep timed out");
            }
        }

        running.stop_workers.cancel();
        for channel in &self.channels {
            channel.close();
        }
        for handle in running.workers {
            if let Err(e) = handle.await {
                warn!(flow = %self.name, "worker task ended abnormally: {}", e);
            }
        }

        let dropped: usize = self.channels.iter().map(|c| c.purge()).sum();
        if dropped > 0 {
            warn!(flow = %self.name, dropped, "messages left in channels were dropped");
            self.ctx.metrics.discarded(dropped as u64);
        }
        self.running.store(false, Ordering::SeqCst);
        info!(flow = %self.name, "flow stopped");
        Ok(())
    }

    /// Wait until every consumed channel is idle. `false` on timeout.
    async fn drain(&self) -> bool {
        let deadline = Instant::now() + self.drain_timeout;
        loop {
            if self.stages.iter().all(|s| s.input.is_idle()) {
                return true;
            }
            if Instant::now() >= deadline {
                return false;
            }
            tokio::time::sleep(DRAIN_CHECK_INTERVAL).await;
        }
    }
}

impl Drop for Flow {
    fn drop(&mut self) {
        if let Ok(mut runtime) = self.runtime.try_lock() {
            if let Some(running) = runtime.take() {
                running.stop_pollers.cancel();
                running.stop_sweepers.cancel();
                running.stop_workers.cancel();
                for channel in &self.channels {
                    channel.close();
                }
            }
        }
    }
}

async fn run_worker(ctx: Arc<FlowContext>, stage: Arc<Stage>, n: usize, cancel: CancellationToken) {
    let Some(queue) = stage.input.as_queue() else {
        return;
    };
    debug!(flow = %ctx.flow, endpoint = %stage.name, worker = n, "worker started");
    loop {
        let next = tokio::select! {
            biased;
            _ = cancel.cancelled() => None,
            msg = queue.receive_tracked() => msg,
        };
        let Some(msg) = next else { break };
        ctx.dispatch(&stage, msg).await;
        queue.ack();
    }
    debug!(flow = %ctx.flow, endpoint = %stage.name, worker = n, "worker stopped");
}

async fn run_sweeper(ctx: Arc<FlowContext>, stage: Arc<Stage>, interval: Duration, cancel: CancellationToken) {
    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            _ = tokio::time::sleep(interval) => ctx.sweep(&stage).await,
        }
    }
}
