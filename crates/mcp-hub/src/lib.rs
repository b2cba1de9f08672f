//! Core library for the MCP aggregating hub: connects to a set of backend
//! MCP servers, namespaces their tools/resources/prompts into one virtual
//! MCP server, and runs multi-step tool chains across them.

pub mod capability;
pub mod chain;
pub mod clock;
pub mod config;
pub mod connection;
pub mod credential;
pub mod error;
pub mod events;
pub mod hub;
pub mod meta_tools;
pub mod paths;
pub mod serve;
pub mod transport;
pub mod virtual_endpoint;
pub mod web;

pub use capability::{Capability, CapabilityIndex, CapabilityKind};
pub use chain::ChainExecutor;
pub use hub::Hub;
pub use meta_tools::MetaToolHandler;
pub use serve::ServeArgs;
pub use virtual_endpoint::VirtualEndpoint;
pub use clock::{Clock, Random, SystemClock, SystemRandom};
pub use config::{BackendConfig, TransportKind, load_backend_configs};
pub use connection::{Connection, ConnectionState};
pub use connection::manager::ConnectionManager;
pub use credential::CredentialProvider;
pub use error::HubError;
pub use events::{Event, EventKind, EventSink, InMemoryEventSink};
pub use paths::{Layout, default_root};
