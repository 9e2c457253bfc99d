pub mod adapter;
pub mod file;
pub mod memory;
pub mod message;

pub use adapter::{AdapterError, SinkAdapter, SourceAdapter};
pub use message::Message;
