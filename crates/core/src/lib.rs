//! reposcope core library.
//!
//! Client-side state for long-running source-control operations driven by a
//! backend process: the request channel and its wire protocol, the conflict
//! store and orchestrator, single-flight caches for server queries, stable
//! locations, configuration and transports.

pub mod cache;
pub mod channel;
pub mod config;
pub mod conflict;
pub mod errors;
pub mod models;
pub mod protocol;
pub mod session;
pub mod stable;
pub mod transport;

// Re-exports for convenience.
pub use cache::SingleFlightCache;
pub use channel::RequestChannel;
pub use config::AppConfig;
pub use conflict::{ConflictOrchestrator, ConflictStore};
pub use session::Session;
pub use stable::StableLocations;
