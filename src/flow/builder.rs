use std::{collections::HashSet, sync::Arc, time::Duration};
use eip_adapter::{SinkAdapter, SourceAdapter};
use tracing::debug;

use crate::{
    channel::{ChannelRef, ChannelSpec, MessageChannel},
    endpoint::{Aggregator, Endpoint, Filter, OutboundAdapter, ServiceActivator, Splitter, Transformer},
    error::FlowError,
    flow::{Flow, FlowParts, Inbound, ShutdownPolicy, Stage, DEFAULT_DRAIN_TIMEOUT},
    poller::Poller,
};

enum StageEndpoint {
    Transformer(Transformer),
    Filter(Filter),
    Splitter(Splitter),
    Aggregator(Aggregator),
    Service(ServiceActivator),
    Outbound(OutboundAdapter),
    Custom(Arc<dyn Endpoint>),
}

impl StageEndpoint {
    fn into_endpoint(self) -> Arc<dyn Endpoint> {
        match self {
            StageEndpoint::Transformer(e) => Arc::new(e),
            StageEndpoint::Filter(e) => Arc::new(e),
            StageEndpoint::Splitter(e) => Arc::new(e),
            StageEndpoint::Aggregator(e) => Arc::new(e),
            StageEndpoint::Service(e) => Arc::new(e),
            StageEndpoint::Outbound(e) => Arc::new(e),
            StageEndpoint::Custom(e) => e,
        }
    }

    fn is_terminal(&self) -> bool {
        matches!(self, StageEndpoint::Outbound(_))
    }
}

struct PendingStage {
    endpoint: StageEndpoint,
    /// Explicit channel feeding this stage, from `.channel(..)`.
    input: Option<ChannelSpec>,
    concurrency: usize,
}

/// Fluent assembly of a [`Flow`].
///
/// ```ignore
/// let flow = FlowBuilder::new("lines")
///     .from_source(source, Poller::fixed_delay(Duration::from_millis(500)))
///     .split(Splitter::delimiter(","))
///     .filter(Filter::non_empty())
///     .transform(Transformer::upper_case())
///     .aggregate(Aggregator::new().join("\n"))
///     .handle(sink)
///     .build()?;
/// ```
///
/// Adjacent stages are linked by anonymous point-to-point channels named
/// `<flow>.channel.<n>` unless `.channel(..)` declares one. A filter directly
/// after a splitter, with no declared channel in between, runs inside the
/// splitter so that `sequenceSize` only counts surviving parts.
pub struct FlowBuilder {
    name: String,
    source: Option<(Arc<dyn SourceAdapter>, Poller)>,
    input: Option<ChannelSpec>,
    stages: Vec<PendingStage>,
    next_channel: Option<ChannelSpec>,
    end: Option<ChannelSpec>,
    error_channel: Option<ChannelSpec>,
    discard_channel: Option<ChannelSpec>,
    drain_timeout: Duration,
    shutdown: ShutdownPolicy,
    problems: Vec<String>,
}

impl FlowBuilder {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            source: None,
            input: None,
            stages: Vec::new(),
            next_channel: None,
            end: None,
            error_channel: None,
            discard_channel: None,
            drain_timeout: DEFAULT_DRAIN_TIMEOUT,
            shutdown: ShutdownPolicy::Drain,
            problems: Vec::new(),
        }
    }

    /// Poll `source` and feed the first stage.
    pub fn from_source(mut self, source: Arc<dyn SourceAdapter>, poller: Poller) -> Self {
        if self.source.is_some() {
            self.problems.push("source declared twice".into());
        }
        self.source = Some((source, poller));
        self
    }

    /// Name and configure the flow's input channel.
    pub fn from_channel(mut self, spec: ChannelSpec) -> Self {
        if self.input.is_some() {
            self.problems.push("input channel declared twice".into());
        }
        self.input = Some(spec);
        self
    }

    /// Declare the channel between the previous stage and the next one.
    pub fn channel(mut self, spec: ChannelSpec) -> Self {
        if let Some(previous) = &self.next_channel {
            self.problems.push(format!(
                "channels `{}` and `{}` declared for the same link",
                previous.name, spec.name
            ));
        }
        self.next_channel = Some(spec);
        self
    }

    fn push(mut self, endpoint: StageEndpoint) -> Self {
        if self.end.is_some() {
            self.problems.push("stage added after the flow end".into());
        }
        if self.stages.last().is_some_and(|s| s.endpoint.is_terminal()) {
            self.problems.push("outbound adapter must be the last stage".into());
        }
        let input = self.next_channel.take();
        self.stages.push(PendingStage { endpoint, input, concurrency: 1 });
        self
    }

    pub fn transform(self, transformer: Transformer) -> Self {
        self.push(StageEndpoint::Transformer(transformer))
    }

    pub fn filter(self, filter: Filter) -> Self {
        self.push(StageEndpoint::Filter(filter))
    }

    pub fn split(self, splitter: Splitter) -> Self {
        self.push(StageEndpoint::Splitter(splitter))
    }

    pub fn aggregate(self, aggregator: Aggregator) -> Self {
        self.push(StageEndpoint::Aggregator(aggregator))
    }

    pub fn service_activator(self, service: ServiceActivator) -> Self {
        self.push(StageEndpoint::Service(service))
    }

    /// Any other `Endpoint` implementation.
    pub fn endpoint(self, endpoint: Arc<dyn Endpoint>) -> Self {
        self.push(StageEndpoint::Custom(endpoint))
    }

    /// Finish the flow in an outbound adapter.
    pub fn handle(self, sink: Arc<dyn SinkAdapter>) -> Self {
        self.push(StageEndpoint::Outbound(OutboundAdapter::new(sink)))
    }

    /// Leave the flow open, ending in the given channel.
    pub fn to_channel(mut self, spec: ChannelSpec) -> Self {
        if self.end.is_some() {
            self.problems.push("flow end declared twice".into());
        }
        self.end = Some(spec);
        self
    }

    /// Worker count for the last added stage.
    pub fn concurrency(mut self, workers: usize) -> Self {
        match self.stages.last_mut() {
            Some(stage) if workers > 0 => stage.concurrency = workers,
            Some(_) => self.problems.push("concurrency must be at least 1".into()),
            None => self.problems.push("concurrency set before any stage".into()),
        }
        self
    }

    pub fn error_channel(mut self, spec: ChannelSpec) -> Self {
        self.error_channel = Some(spec);
        self
    }

    pub fn discard_channel(mut self, spec: ChannelSpec) -> Self {
        self.discard_channel = Some(spec);
        self
    }

    pub fn drain_timeout(mut self, timeout: Duration) -> Self {
        self.drain_timeout = timeout;
        self
    }

    pub fn shutdown_policy(mut self, policy: ShutdownPolicy) -> Self {
        self.shutdown = policy;
        self
    }

    /// Move filters that directly follow a splitter into it.
    fn fuse_part_filters(stages: Vec<PendingStage>) -> Vec<PendingStage> {
        let mut fused: Vec<PendingStage> = Vec::with_capacity(stages.len());
        for PendingStage { endpoint, input, concurrency } in stages {
            let fusable = input.is_none() && concurrency == 1;
            if let (StageEndpoint::Filter(filter), Some(previous)) = (&endpoint, fused.last_mut()) {
                if let StageEndpoint::Splitter(splitter) = &mut previous.endpoint {
                    if fusable {
                        *splitter = splitter.clone().with_part_filter(filter.clone());
                        continue;
                    }
                }
            }
            fused.push(PendingStage { endpoint, input, concurrency });
        }
        fused
    }

    pub fn build(mut self) -> Result<Flow, FlowError> {
        if self.name.trim().is_empty() {
            self.problems.push("flow name is empty".into());
        }
        if self.source.is_none() && self.input.is_none() {
            self.problems.push("flow has neither a source nor an input channel".into());
        }
        // A trailing `.channel(..)` is the open end.
        if let Some(spec) = self.next_channel.take() {
            if self.end.is_some() {
                self.problems.push(format!("channel `{}` declared after the flow end", spec.name));
            } else {
                self.end = Some(spec);
            }
        }
        let terminal = self.stages.last().is_some_and(|s| s.endpoint.is_terminal());
        if terminal && self.end.is_some() {
            self.problems.push("a flow ending in an outbound adapter has no output channel".into());
        }
        if self.stages.is_empty() && (self.source.is_none() || self.end.is_none() || self.input.is_some()) {
            self.problems.push("flow has no stages".into());
        }
        if !self.problems.is_empty() {
            return Err(FlowError::Config(format!("flow `{}`: {}", self.name, self.problems.join("; "))));
        }

        let name = self.name;
        let stages = Self::fuse_part_filters(self.stages);
        let mut channels: Vec<ChannelRef> = Vec::new();
        let mut names: HashSet<String> = HashSet::new();
        let mut declare = |spec: ChannelSpec| -> Result<ChannelRef, FlowError> {
            spec.validate()?;
            if !names.insert(spec.name.clone()) {
                return Err(FlowError::Config(format!("flow `{}`: duplicate channel `{}`", name, spec.name)));
            }
            let ch = Arc::new(MessageChannel::from_spec(&spec));
            channels.push(ch.clone());
            Ok(ch)
        };

        let mut stage_inputs: Vec<Option<ChannelSpec>> = stages.iter().map(|s| s.input.clone()).collect();
        let input_spec = match (self.input, stage_inputs.first_mut()) {
            (Some(_), Some(Some(first))) => {
                return Err(FlowError::Config(format!(
                    "flow `{}`: channel `{}` conflicts with the input channel",
                    name, first.name
                )));
            }
            (Some(spec), _) => spec,
            (None, Some(first)) => first
                .take()
                .unwrap_or_else(|| ChannelSpec::point_to_point(format!("{}.input", name))),
            // A bare source feeding the open end directly.
            (None, None) => match self.end.take() {
                Some(spec) => spec,
                None => ChannelSpec::point_to_point(format!("{}.input", name)),
            },
        };
        let input = declare(input_spec)?;

        let count = stages.len();
        let mut built = Vec::with_capacity(count);
        let mut current = input.clone();
        for (i, (stage, explicit_input)) in stages.into_iter().zip(stage_inputs).enumerate() {
            if i > 0 {
                let spec = explicit_input
                    .unwrap_or_else(|| ChannelSpec::point_to_point(format!("{}.channel.{}", name, i)));
                current = declare(spec)?;
            }
            let endpoint = stage.endpoint.into_endpoint();
            let stage_name = format!("{}.{}.{}", name, endpoint.kind(), i);
            built.push((stage_name, endpoint, current.clone(), stage.concurrency));
        }

        let output = match (terminal, self.end) {
            (false, Some(spec)) if count > 0 => Some(declare(spec)?),
            (false, None) if count > 0 => Some(declare(ChannelSpec::point_to_point(format!("{}.output", name)))?),
            _ if count == 0 => Some(input.clone()),
            _ => None,
        };

        let error_channel = self.error_channel.map(&mut declare).transpose()?;
        let discard_channel = self.discard_channel.map(&mut declare).transpose()?;

        let mut stages = Vec::with_capacity(built.len());
        let mut outputs: Vec<Option<ChannelRef>> = built.iter().skip(1).map(|b| Some(b.2.clone())).collect();
        outputs.push(output.clone());
        for ((stage_name, endpoint, input, concurrency), output) in built.into_iter().zip(outputs) {
            debug!(flow = %name, endpoint = %stage_name, input = %input.name(), output = ?output.as_ref().map(|o| o.name().to_string()), "stage wired");
            stages.push(Stage { name: stage_name, endpoint, input, output, concurrency });
        }

        let inbound = self.source.map(|(source, poller)| Inbound {
            source,
            poller,
            channel: input.clone(),
        });

        Flow::assemble(FlowParts {
            name,
            channels,
            stages,
            inbound,
            input,
            output,
            error_channel,
            discard_channel,
            drain_timeout: self.drain_timeout,
            shutdown: self.shutdown,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::endpoint::EndpointKind;
    use eip_adapter::memory::{CollectingSink, QueueSource};

    fn sink() -> Arc<CollectingSink> {
        Arc::new(CollectingSink::new("sink"))
    }

    #[test]
    fn test_implicit_channel_names() {
        let flow = FlowBuilder::new("f")
            .from_channel(ChannelSpec::point_to_point("in"))
            .transform(Transformer::trim())
            .transform(Transformer::upper_case())
            .build()
            .unwrap();
        assert_eq!(flow.channel_names(), vec!["in", "f.channel.1", "f.output"]);
        assert_eq!(flow.stage_names(), vec!["f.transformer.0", "f.transformer.1"]);
        assert_eq!(flow.output_channel().unwrap().name(), "f.output");
    }

    #[test]
    fn test_declared_link_and_open_end() {
        let flow = FlowBuilder::new("f")
            .from_source(Arc::new(QueueSource::new("q")), Poller::fixed_delay(Duration::from_millis(10)))
            .transform(Transformer::trim())
            .channel(ChannelSpec::publish_subscribe("trimmed"))
            .transform(Transformer::upper_case())
            .channel(ChannelSpec::point_to_point("done"))
            .build()
            .unwrap();
        assert_eq!(flow.channel_names(), vec!["f.input", "trimmed", "done"]);
    }

    #[test]
    fn test_filter_after_splitter_is_fused() {
        let flow = FlowBuilder::new("f")
            .from_channel(ChannelSpec::point_to_point("in"))
            .split(Splitter::delimiter(","))
            .filter(Filter::non_empty())
            .transform(Transformer::upper_case())
            .handle(sink())
            .build()
            .unwrap();
        let kinds: Vec<String> = flow.stage_names();
        assert_eq!(kinds, vec!["f.splitter.0", "f.transformer.1", "f.outbound_adapter.2"]);
        assert!(flow.output_channel().is_none());
    }

    #[test]
    fn test_declared_channel_prevents_fusion() {
        let flow = FlowBuilder::new("f")
            .from_channel(ChannelSpec::point_to_point("in"))
            .split(Splitter::delimiter(","))
            .channel(ChannelSpec::point_to_point("parts"))
            .filter(Filter::non_empty())
            .build()
            .unwrap();
        assert_eq!(flow.stage_names().len(), 2);
        assert!(flow.stage_names()[1].contains(&EndpointKind::Filter.to_string()));
    }

    #[test]
    fn test_validation_errors() {
        let no_input = FlowBuilder::new("f").transform(Transformer::trim()).build();
        assert!(matches!(no_input, Err(FlowError::Config(_))));

        let dup = FlowBuilder::new("f")
            .from_channel(ChannelSpec::point_to_point("same"))
            .transform(Transformer::trim())
            .to_channel(ChannelSpec::point_to_point("same"))
            .build();
        assert!(matches!(dup, Err(FlowError::Config(ref m)) if m.contains("duplicate channel `same`")));

        let after_sink = FlowBuilder::new("f")
            .from_channel(ChannelSpec::point_to_point("in"))
            .handle(sink())
            .transform(Transformer::trim())
            .build();
        assert!(after_sink.is_err());

        let empty = FlowBuilder::new("f").from_channel(ChannelSpec::point_to_point("in")).build();
        assert!(empty.is_err());

        let zero_workers = FlowBuilder::new("f")
            .from_channel(ChannelSpec::point_to_point("in"))
            .transform(Transformer::trim())
            .concurrency(0)
            .build();
        assert!(zero_workers.is_err());

        let zero_capacity = FlowBuilder::new("f")
            .from_channel(ChannelSpec::point_to_point("in").bounded(0))
            .transform(Transformer::trim())
            .build();
        assert!(matches!(zero_capacity, Err(FlowError::Config(ref m)) if m.contains("capacity must be at least 1")));
    }

    #[test]
    fn test_source_straight_into_channel() {
        let flow = FlowBuilder::new("f")
            .from_source(Arc::new(QueueSource::new("q")), Poller::fixed_delay(Duration::from_millis(10)))
            .to_channel(ChannelSpec::point_to_point("landing"))
            .build()
            .unwrap();
        assert_eq!(flow.channel_names(), vec!["landing"]);
        assert_eq!(flow.input_channel().name(), "landing");
        assert!(flow.stage_names().is_empty());
    }
}
