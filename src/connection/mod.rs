//! Connection lifecycle: the state machine and its manager

pub mod manager;
pub(crate) mod session;
pub mod state;

pub use manager::ConnectionManager;
pub use state::{log_state_transition, ConnectionState};
