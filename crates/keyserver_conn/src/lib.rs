//! Connection, session and dispatch layer for keyserver calls.

pub mod auth;
pub mod cancel;
pub mod config;
pub mod context;
pub mod endpoints;
pub mod error;
pub mod executor;
pub mod fanout;
pub mod fifo;
pub mod identity;
pub mod multipart;
pub mod provider;
pub mod recovery;
pub mod session;
pub mod socket;
pub mod store;
pub mod supervisor;

pub use auth::{KeyserverAuth, KeyserverAuthInputs};
pub use cancel::CancelFlag;
pub use config::{load_settings, BackgroundFailurePolicy, ConnectionConfig};
pub use context::ConnectionContext;
pub use endpoints::{classify, Endpoint, TransportAffinity};
pub use error::CallError;
pub use executor::{CallOptions, CallSingleKeyserverEndpoint, CallTimeout, KeyserverCaller};
pub use fanout::{CallKeyserverEndpoint, KeyserverRequests};
pub use provider::KeyserverConnections;
pub use recovery::{NativeCredentialsResolver, RecoveryCoordinator, SessionRecovery};
pub use store::{Action, ConnectionState, MemoryStore, StateStore};
pub use supervisor::KeyserverConnectionHandler;

#[cfg(test)]
#[path = "tests/support.rs"]
pub(crate) mod test_support;
