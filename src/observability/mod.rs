//! Structured logging for the SAML bridge.
//!
//! Log output is configured through `[observability.logging]` and the
//! `RUST_LOG` environment variable.

mod tracing_init;

pub use tracing_init::*;
