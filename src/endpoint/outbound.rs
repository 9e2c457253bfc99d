use std::{fmt, panic::AssertUnwindSafe, sync::Arc};
use async_trait::async_trait;
use eip_adapter::{AdapterError, SinkAdapter};
use futures::FutureExt;
use tracing::trace;

use crate::{
    endpoint::{panic_message, Disposition, Endpoint, EndpointKind},
    error::FlowError,
    message::Message,
};

/// Terminal stage handing messages to a sink. Failures are reported once;
/// retrying is the sink's business.
#[derive(Clone)]
pub struct OutboundAdapter {
    sink: Arc<dyn SinkAdapter>,
}

impl fmt::Debug for OutboundAdapter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "OutboundAdapter({})", self.sink.name())
    }
}

impl OutboundAdapter {
    pub fn new(sink: Arc<dyn SinkAdapter>) -> Self {
        Self { sink }
    }

    pub fn sink_name(&self) -> String {
        self.sink.name()
    }
}

#[async_trait]
impl Endpoint for OutboundAdapter {
    fn kind(&self) -> EndpointKind {
        EndpointKind::OutboundAdapter
    }

    async fn process(&self, msg: Message) -> Result<Disposition, FlowError> {
        let delivered = AssertUnwindSafe(self.sink.deliver(&msg)).catch_unwind().await;
        let cause = match delivered {
            Ok(Ok(())) => {
                trace!(sink = %self.sink.name(), message_id = %msg.id(), "delivered");
                return Ok(Disposition::consumed());
            }
            Ok(Err(e)) => e,
            Err(payload) => AdapterError::Other(format!("sink panicked: {}", panic_message(payload))),
        };
        Err(FlowError::Delivery { sink: self.sink.name(), cause })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use eip_adapter::memory::CollectingSink;

    struct BrokenSink;

    #[async_trait]
    impl SinkAdapter for BrokenSink {
        fn name(&self) -> String {
            "broken".into()
        }

        async fn deliver(&self, _msg: &Message) -> Result<(), AdapterError> {
            Err(AdapterError::Io("disk full".into()))
        }
    }

    #[tokio::test]
    async fn test_delivers_and_is_terminal() {
        let sink = Arc::new(CollectingSink::new("collect"));
        let adapter = OutboundAdapter::new(sink.clone());

        let d = adapter.process(Message::text("out")).await.unwrap();
        assert!(d.emitted.is_empty());
        assert_eq!(sink.messages()[0].payload_str(), Some("out"));
    }

    #[tokio::test]
    async fn test_failure_is_delivery_error() {
        let adapter = OutboundAdapter::new(Arc::new(BrokenSink));
        let err = adapter.process(Message::text("out")).await.unwrap_err();
        assert_eq!(
            err,
            FlowError::Delivery {
                sink: "broken".into(),
                cause: AdapterError::Io("disk full".into()),
            }
        );
    }
}
