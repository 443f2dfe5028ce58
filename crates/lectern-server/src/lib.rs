pub mod api;
pub mod connection;
pub mod registry;
pub mod server;
pub mod ws;

pub use connection::ConnectionHandle;
pub use registry::{RelayStatsSnapshot, SessionRegistry, SessionSnapshot};
pub use server::{AppState, ServerConfig, ServerHandle, build_router, start};
