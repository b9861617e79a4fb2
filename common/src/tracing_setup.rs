//! Logging bootstrap for a binary hosting the core, following the pattern
//! in `deployer/src/main.rs`: an `EnvFilter` sourced from `RUST_LOG`
//! (defaulting to `info`) layered with an `fmt` subscriber. Callers that
//! also want state-transition capture should additionally register
//! `fleet_deployer::state_machine::deploy_layer::DeployLayer` before
//! calling `init`.
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

pub fn env_filter() -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
}

/// Initializes a process-global subscriber with the default filter and an
/// `fmt` layer. Intended for binaries and integration tests; library code
/// never calls this itself.
pub fn init_tracing() {
    tracing_subscriber::registry()
        .with(env_filter())
        .with(fmt::layer())
        .init();
}
