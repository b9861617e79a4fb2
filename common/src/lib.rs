pub mod constants;
pub mod log;
pub mod models;
#[cfg(feature = "tracing-setup")]
pub mod tracing_setup;

pub use models::*;
