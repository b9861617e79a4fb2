//! A tracing [`Layer`] that captures device-deployment state transitions
//! the same way the teacher's deploy layer captures build-state
//! transitions: annotated spans carry `device_id`/`status` fields, and
//! every `#[instrument]`-annotated state-transition function in
//! [`super::StateMachine`] becomes a recorded [`Log`] without needing a
//! persistence handle threaded through the call chain.
//!
//! **Warning**: don't log sensitive info in functions carrying these
//! annotations — everything logged inside the span is captured.

use chrono::{DateTime, Utc};
use fleet_common::log::{Level, Log as WireLog, LogKind};
use serde_json::json;
use tracing::{field::Visit, span, Metadata, Subscriber};
use tracing_subscriber::Layer;
use uuid::Uuid;

/// Records state-transition and event logs for a device-deployment.
pub trait LogRecorder {
    fn record(&self, log: Log);
}

#[derive(Debug, PartialEq)]
pub struct Log {
    pub device_deployment_id: Uuid,
    pub status: String,
    pub level: Level,
    pub timestamp: DateTime<Utc>,
    pub file: Option<String>,
    pub line: Option<u32>,
    pub fields: serde_json::Value,
    pub kind: LogKind,
}

impl From<Log> for WireLog {
    fn from(log: Log) -> Self {
        Self {
            device_deployment_id: log.device_deployment_id,
            timestamp: log.timestamp,
            status: log.status,
            level: log.level,
            file: log.file,
            line: log.line,
            fields: log.fields,
            kind: log.kind,
        }
    }
}

pub struct DeployLayer<R>
where
    R: LogRecorder + Send + Sync,
{
    recorder: R,
}

impl<R> DeployLayer<R>
where
    R: LogRecorder + Send + Sync,
{
    pub fn new(recorder: R) -> Self {
        Self { recorder }
    }
}

impl<R, S> Layer<S> for DeployLayer<R>
where
    S: Subscriber + for<'lookup> tracing_subscriber::registry::LookupSpan<'lookup>,
    R: LogRecorder + Send + Sync + 'static,
{
    fn on_event(&self, event: &tracing::Event<'_>, ctx: tracing_subscriber::layer::Context<'_, S>) {
        let Some(scope) = ctx.event_scope(event) else {
            return;
        };

        for span in scope.from_root() {
            let extensions = span.extensions();
            if let Some(details) = extensions.get::<ScopeDetails>() {
                let mut visitor = JsonVisitor::default();
                event.record(&mut visitor);
                let metadata = event.metadata();

                self.recorder.record(Log {
                    device_deployment_id: details.device_deployment_id,
                    status: details.status.clone(),
                    level: metadata.level().into(),
                    timestamp: Utc::now(),
                    file: metadata.file().map(str::to_string),
                    line: metadata.line(),
                    fields: serde_json::Value::Object(visitor.0),
                    kind: LogKind::Event,
                });
                break;
            }
        }
    }

    fn on_new_span(
        &self,
        attrs: &span::Attributes<'_>,
        id: &span::Id,
        ctx: tracing_subscriber::layer::Context<'_, S>,
    ) {
        if !NewStateVisitor::is_valid(attrs.metadata()) {
            return;
        }

        let mut visitor = NewStateVisitor::default();
        attrs.record(&mut visitor);
        let details = visitor.details;

        let span = ctx.span(id).unwrap();
        let mut extensions = span.extensions_mut();
        let metadata = span.metadata();

        self.recorder.record(Log {
            device_deployment_id: details.device_deployment_id,
            status: details.status.clone(),
            level: metadata.level().into(),
            timestamp: Utc::now(),
            file: metadata.file().map(str::to_string),
            line: metadata.line(),
            fields: Default::default(),
            kind: LogKind::StateTransition,
        });

        extensions.insert::<ScopeDetails>(details);
    }
}

#[derive(Debug, Default)]
struct ScopeDetails {
    device_deployment_id: Uuid,
    status: String,
}

#[derive(Default)]
struct NewStateVisitor {
    details: ScopeDetails,
}

impl NewStateVisitor {
    const ID_IDENT: &'static str = "device_deployment_id";
    const STATUS_IDENT: &'static str = "status";

    fn is_valid(metadata: &Metadata) -> bool {
        metadata.is_span()
            && metadata.fields().field(Self::ID_IDENT).is_some()
            && metadata.fields().field(Self::STATUS_IDENT).is_some()
    }
}

impl Visit for NewStateVisitor {
    fn record_str(&mut self, field: &tracing::field::Field, value: &str) {
        if field.name() == Self::STATUS_IDENT {
            self.details.status = value.to_string();
        }
    }
    fn record_debug(&mut self, field: &tracing::field::Field, value: &dyn std::fmt::Debug) {
        if field.name() == Self::ID_IDENT {
            if let Ok(id) = format!("{value:?}").trim_matches('"').parse() {
                self.details.device_deployment_id = id;
            }
        } else if field.name() == Self::STATUS_IDENT {
            self.details.status = format!("{value:?}");
        }
    }
}

#[derive(Default)]
struct JsonVisitor(serde_json::Map<String, serde_json::Value>);

impl Visit for JsonVisitor {
    fn record_str(&mut self, field: &tracing::field::Field, value: &str) {
        self.0.insert(field.name().to_string(), json!(value));
    }
    fn record_bool(&mut self, field: &tracing::field::Field, value: bool) {
        self.0.insert(field.name().to_string(), json!(value));
    }
    fn record_u64(&mut self, field: &tracing::field::Field, value: u64) {
        self.0.insert(field.name().to_string(), json!(value));
    }
    fn record_i64(&mut self, field: &tracing::field::Field, value: i64) {
        self.0.insert(field.name().to_string(), json!(value));
    }
    fn record_f64(&mut self, field: &tracing::field::Field, value: f64) {
        self.0.insert(field.name().to_string(), json!(value));
    }
    fn record_error(&mut self, field: &tracing::field::Field, value: &(dyn std::error::Error + 'static)) {
        self.0.insert(field.name().to_string(), json!(value.to_string()));
    }
    fn record_debug(&mut self, field: &tracing::field::Field, value: &dyn std::fmt::Debug) {
        self.0.insert(field.name().to_string(), json!(format!("{value:?}")));
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};

    use tracing_subscriber::prelude::*;

    use super::{DeployLayer, Log, LogRecorder};

    struct RecorderMock {
        logs: Mutex<Vec<Log>>,
    }

    impl LogRecorder for Arc<RecorderMock> {
        fn record(&self, log: Log) {
            self.logs.lock().unwrap().push(log);
        }
    }

    #[test]
    fn state_span_is_captured() {
        let recorder = Arc::new(RecorderMock { logs: Mutex::new(Vec::new()) });
        let subscriber = tracing_subscriber::registry().with(DeployLayer::new(recorder.clone()));

        tracing::subscriber::with_default(subscriber, || {
            let id = uuid::Uuid::new_v4();
            let span = tracing::info_span!(
                "transition",
                device_deployment_id = tracing::field::debug(id),
                status = "downloading"
            );
            let _enter = span.enter();
            tracing::info!(note = "entered downloading");
        });

        let logs = recorder.logs.lock().unwrap();
        assert!(logs.iter().any(|l| l.status == "downloading"));
    }
}
