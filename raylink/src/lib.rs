//! Raylink - cancellable remote work for re-entrant node-graph evaluation
//!
//! A node evaluated by a single-threaded host fans its iterations out to
//! async workers on the first pass and collects their results on a second
//! pass the workers request. Workers reach a simulation host through a
//! shared remote session; sessions live in a supervised registry.

pub mod actors;
pub mod config;
pub mod host;
pub mod observability;
pub mod orchestrator;
pub mod remote;
pub mod supervisor;
pub mod workers;

pub use actors::{ConnectRequest, RemoteSession};
pub use config::RaylinkConfig;
pub use orchestrator::{AsyncNode, NodeConfig, Worker, WorkerContext, WorkerError};
pub use remote::RemoteError;
pub use supervisor::SessionRegistry;
