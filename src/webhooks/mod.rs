//! Inbound webhook protection.
//!
//! Signature verification decides whether a delivery may be trusted at all;
//! the replay guard and flood limiter are best-effort, in-memory companions
//! that drop duplicates and bursts. Neither guard replaces the tenant rate
//! limiter in [`crate::ratelimit`].

pub mod replay;
pub mod signature;

pub use replay::{FloodLimiter, ReplayGuard};
pub use signature::{verify_hmac, verify_request, verify_signed_timestamp, HmacAlgorithm, Verification};
