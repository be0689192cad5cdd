//! Mesh to LLM bridge core.
//!
//! - [`supervisor`] owns the radio session and its reconnect state machine
//! - [`health`] probes the live link and reports losses
//! - [`router`] picks queries out of inbound traffic and answers them
//! - [`query`] talks to the model backend with bounded retries
//! - [`reply`] fits answers under the mesh byte ceiling
//! - [`server`] runs all of the above until shutdown
pub mod health;
pub mod query;
pub mod reply;
pub mod router;
pub mod server;
pub mod supervisor;
pub mod transport;
pub mod types;

pub use health::{HealthMonitor, HealthSettings};
pub use query::{Backend, BackendError, OllamaBackend, QueryClient, QueryReport};
pub use reply::{encode_reply, ReplyEncoder};
pub use router::MessageRouter;
pub use server::BridgeServer;
pub use supervisor::{ConnectOutcome, ConnectionSupervisor, LinkHandle, SupervisorSettings};
pub use transport::{Link, Transport, TransportError};
pub use types::{ConnectionState, InboundMessage, OutboundReply, RetryPolicy};
