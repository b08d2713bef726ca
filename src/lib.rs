#![forbid(unsafe_code)]

// Parley - signaling and admission-control hub for realtime video meetings

pub mod auth;
pub mod error;
pub mod metrics;
pub mod room;
pub mod signaling;
pub mod store;
