//! trustagent-runtime: drives the core state machines for one agent.
//! One serialized worker task per session, fed by a FIFO event queue;
//! platform services are reached through the traits in [`platform`].

pub mod callback;
pub mod clock;
pub mod config;
pub mod connection;
pub mod error;
pub mod escrow;
pub mod event;
pub mod platform;
pub mod policy_sync;
pub mod queue;
pub mod recording;
pub mod scheduler;
pub mod session;

pub use callback::AgentCallback;
pub use config::SessionConfig;
pub use error::SessionError;
pub use platform::{
    AgentBinder, AgentLink, DevicePolicy, Platform, TrustAgentService, TrustArchive, TrustManager,
};
pub use session::{SessionHandle, SessionSnapshot, TrustAgentSession};
