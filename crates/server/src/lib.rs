//! HTTP status surface of the `registry` daemon.

pub mod api;
pub mod metrics;
pub mod state;
