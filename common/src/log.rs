//! Wire-level log types, shaped after `shuttle-common`'s `log`/`LogItem`
//! and `shuttle-deployer`'s `persistence::log::Level`.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Deserialize, Serialize)]
#[cfg_attr(feature = "persist", derive(sqlx::Type))]
pub enum Level {
    Trace,
    Debug,
    Info,
    Warn,
    Error,
}

impl From<&tracing::Level> for Level {
    fn from(level: &tracing::Level) -> Self {
        match *level {
            tracing::Level::TRACE => Self::Trace,
            tracing::Level::DEBUG => Self::Debug,
            tracing::Level::INFO => Self::Info,
            tracing::Level::WARN => Self::Warn,
            tracing::Level::ERROR => Self::Error,
        }
    }
}

/// An event or state-transition log line, scoped to one device-deployment.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct Log {
    pub device_deployment_id: uuid::Uuid,
    pub timestamp: DateTime<Utc>,
    pub status: String,
    pub level: Level,
    pub file: Option<String>,
    pub line: Option<u32>,
    pub fields: serde_json::Value,
    pub kind: LogKind,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Deserialize, Serialize)]
pub enum LogKind {
    Event,
    StateTransition,
}
