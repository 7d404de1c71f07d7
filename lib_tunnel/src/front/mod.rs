//! # Front Module
//!
//! The plain-HTTP surface of the gateway: the WebSocket upgrade endpoint the
//! back-office peer dials, the ACME HTTP-01 responder and the health/info/pac
//! routes.

/// ACME HTTP-01 challenge state and responder.
pub mod challenge;

/// The plain-HTTP front server.
pub mod gateway;

pub use challenge::ChallengeStore;
pub use gateway::{FrontGateway, FrontState};
