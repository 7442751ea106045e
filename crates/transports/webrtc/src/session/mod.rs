//! Session management
//!
//! Sessions own one client connection each; the registry tracks the live ones
//! for shutdown.

pub mod registry;
#[allow(clippy::module_inception)]
pub mod session;

pub use registry::SessionRegistry;
pub use session::{
    Route, RouteTarget, Session, SessionEvent, SessionId, SessionParts, SessionState,
};
