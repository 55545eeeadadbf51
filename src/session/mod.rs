//! Authenticated browsing sessions.
//!
//! - [`manager`] - login, validity checks and re-authentication
//! - [`pool`] - fixed-capacity pool handing out page handles

pub mod manager;
pub mod pool;

pub use manager::{AuthError, Session, SessionManager};
pub use pool::{PoolError, SessionPool};
