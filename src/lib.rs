//! RACE core: worker lifecycle and supervision, the named-channel
//! publish/subscribe bus, the simulation clock, the archive replay
//! scheduler, and the external-process UDP adapter protocol.
//!
//! Domain-specific workers, configuration-file parsing, and the HTTP
//! front-end are external collaborators; this crate is the framework's hard
//! middle (see `SPEC_FULL.md`).

pub mod bus;
pub mod clock;
pub mod config;
pub mod error;
pub mod message;
pub mod system;
pub mod topic;
pub mod worker;

#[cfg(feature = "replay")]
pub mod replay;

#[cfg(feature = "adapter")]
pub mod adapter;

pub use bus::Bus;
pub use clock::Clock;
pub use config::{SystemConfig, WorkerConfig};
pub use error::{Error, Result};
pub use message::{ChannelId, Message, Payload};
pub use system::{SupervisionPolicy, System, SystemContext};
pub use topic::{Topic, TopicProvider, TopicRegistry, TopicRelease, TopicRequest};
pub use worker::{LifecycleState, MailboxPolicy, Worker, WorkerId};
