//! # meshai - Meshtastic to LLM bridge
//!
//! meshai listens to a Meshtastic mesh, picks out messages that start with a
//! command prefix (`/AI` by default), asks a local Ollama model for an answer
//! and broadcasts a reply that fits the mesh's ~200 byte payload ceiling.
//!
//! ## Features
//!
//! - **Resilient radio link**: serial, TCP or console transports behind one
//!   supervisor with bounded reconnect cycles and periodic health probes.
//! - **Bounded model queries**: per-attempt timeouts, retries for transient
//!   errors and short operator-facing diagnostics when the model is unavailable.
//! - **UTF-8 safe replies**: answers are cut on character boundaries and never
//!   exceed the configured byte limit.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use meshai::bridge::BridgeServer;
//! use meshai::config::Config;
//! use meshai::meshtastic::transport_from_config;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = Config::load("config.toml").await?;
//!     let transport = transport_from_config(&config.meshtastic)?;
//!     let mut bridge = BridgeServer::new(config, transport)?;
//!     bridge.run().await
//! }
//! ```
//!
//! ## Module Organization
//!
//! - [`bridge`] - connection supervision, routing, model queries and reply encoding
//! - [`meshtastic`] - radio transports and the protobuf stream API
//! - [`config`] - configuration loading and validation
//! - [`metrics`] - session counters
//! - [`logutil`] - single-line log helpers
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────┐     ┌─────────────────┐
//! │  MessageRouter  │ ──► │   QueryClient   │ ← Ollama HTTP
//! └─────────────────┘     └─────────────────┘
//!          │ ▲
//! ┌─────────────────┐     ┌─────────────────┐
//! │   Connection    │ ◄── │  HealthMonitor  │
//! │   Supervisor    │     └─────────────────┘
//! └─────────────────┘
//!          │
//! ┌─────────────────┐
//! │    Transport    │ ← serial / tcp / console
//! └─────────────────┘
//! ```

pub mod bridge;
pub mod config;
pub mod logutil;
pub mod meshtastic;
pub mod metrics;
