#![doc = include_str!("../README.md")]

pub mod codec;
pub mod config;
pub mod connection;
pub mod coordinator;
pub mod dedup;
mod dispatcher;
pub mod envelope;
pub mod jobs;
mod producer;
pub mod registry;
pub mod router;
pub mod transport;

#[cfg(test)]
mod testing;

#[doc(inline)]
pub use envelope::{Envelope, Headers};

#[doc(inline)]
pub use transport::{Transport, TransportError, TransportErrorKind};

#[doc(inline)]
pub use connection::{ConnectionManager, ReconnectPolicy, Role};

#[doc(inline)]
pub use registry::{QueueDefinition, Registry, RegistryError, RegistryErrorKind, Settings};

#[doc(inline)]
pub use coordinator::{
    Coordinator, Handler, Message, Outcome, Progress, SubTask, TaskError, sub_task,
};

#[doc(inline)]
pub use dispatcher::{DefaultDispatcherHook, DispatcherHook};

#[doc(inline)]
pub use producer::{ProduceError, ProduceErrorKind, Producer};

#[doc(inline)]
pub use config::{ConfigError, EngineConfig};
