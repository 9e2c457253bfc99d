use std::{fmt, future::Future, panic::AssertUnwindSafe, sync::Arc};
use async_trait::async_trait;
use futures::{future::BoxFuture, FutureExt};
use serde_json::Value;

use crate::{
    endpoint::{call_guarded, panic_message, Disposition, Endpoint, EndpointKind},
    error::FlowError,
    message::Message,
};

type SyncService = dyn Fn(&Message) -> anyhow::Result<Option<Value>> + Send + Sync;
type AsyncService = dyn Fn(Message) -> BoxFuture<'static, anyhow::Result<Option<Value>>> + Send + Sync;

#[derive(Clone)]
enum Handler {
    Sync(Arc<SyncService>),
    Async(Arc<AsyncService>),
}

/// Hands each message to a business function. `Some(value)` continues
/// downstream as the payload of a new message with the same headers;
/// `None` ends the message here.
#[derive(Clone)]
pub struct ServiceActivator {
    handler: Handler,
}

impl fmt::Debug for ServiceActivator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mode = match self.handler {
            Handler::Sync(_) => "sync",
            Handler::Async(_) => "async",
        };
        write!(f, "ServiceActivator({})", mode)
    }
}

impl ServiceActivator {
    pub fn new<F>(f: F) -> Self
    where
        F: Fn(&Message) -> anyhow::Result<Option<Value>> + Send + Sync + 'static,
    {
        Self { handler: Handler::Sync(Arc::new(f)) }
    }

    pub fn from_async<F, Fut>(f: F) -> Self
    where
        F: Fn(Message) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<Option<Value>>> + Send + 'static,
    {
        Self {
            handler: Handler::Async(Arc::new(move |msg| f(msg).boxed())),
        }
    }

    /// Side-effect-only service: always consumes the message.
    pub fn consumer<F>(f: F) -> Self
    where
        F: Fn(&Message) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        Self::new(move |msg| f(msg).map(|_| None))
    }

    pub async fn invoke(&self, msg: &Message) -> Result<Option<Value>, FlowError> {
        match &self.handler {
            Handler::Sync(f) => call_guarded(|| f(msg)).map_err(FlowError::Transformation),
            Handler::Async(f) => {
                let fut = AssertUnwindSafe(async { f(msg.clone()).await });
                match fut.catch_unwind().await {
                    Ok(res) => res.map_err(|e| FlowError::Transformation(format!("{:#}", e))),
                    Err(payload) => Err(FlowError::Transformation(format!(
                        "handler panicked: {}",
                        panic_message(payload)
                    ))),
                }
            }
        }
    }
}

#[async_trait]
impl Endpoint for ServiceActivator {
    fn kind(&self) -> EndpointKind {
        EndpointKind::ServiceActivator
    }

    async fn process(&self, msg: Message) -> Result<Disposition, FlowError> {
        Ok(match self.invoke(&msg).await? {
            Some(value) => Disposition::single(msg.with_payload(value)),
            None => Disposition::consumed(),
        })
    }
}
