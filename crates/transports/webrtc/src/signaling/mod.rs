//! HTTP signaling
//!
//! A single request/response offer exchange: the browser posts its offer, the
//! server creates a session and replies with the complete answer (ICE
//! candidates included).

pub mod http;
pub mod service;

pub use http::{router, ApiError, ErrorResponse, HealthResponse};
pub use service::{SessionDescription, SignalingService};
