pub mod channel;
pub mod config;
pub mod correlation;
pub mod endpoint;
pub mod error;
pub mod flow;
pub mod logger;
pub mod message;
pub mod metrics;
pub mod poller;
pub mod registry;

pub use eip_adapter;

pub use channel::{ChannelMode, ChannelRef, ChannelSpec, FullPolicy, MessageChannel, MessageSubscriber};
pub use endpoint::{Aggregator, Filter, Reducer, ReleaseStrategy, ServiceActivator, Splitter, Transformer};
pub use error::{ErrorKind, FlowError};
pub use flow::{Flow, FlowBuilder, FlowConfig, FlowState, ShutdownPolicy};
pub use message::Message;
pub use poller::{Poller, Trigger};
pub use registry::HandlerRegistry;
