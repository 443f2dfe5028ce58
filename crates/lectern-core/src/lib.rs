pub mod errors;
pub mod ids;
pub mod presentation;
pub mod role;
pub mod settings;

pub use errors::RelayError;
pub use ids::{ConnectionId, SessionKey};
pub use role::Role;
