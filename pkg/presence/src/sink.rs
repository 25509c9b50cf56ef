use std::sync::{Mutex, PoisonError};
use tracing::{debug, warn};

/// Where a failure happened.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ErrorContext {
    pub operation: &'static str,
    pub identity_id: Option<String>,
    /// Expected, degraded-mode failures that should not alert anyone.
    pub silent: bool,
}

impl ErrorContext {
    pub fn silent(operation: &'static str, identity_id: &str) -> Self {
        Self {
            operation,
            identity_id: Some(identity_id.to_string()),
            silent: true,
        }
    }

    pub fn loud(operation: &'static str, identity_id: Option<&str>) -> Self {
        Self {
            operation,
            identity_id: identity_id.map(str::to_string),
            silent: false,
        }
    }
}

/// External error reporting. Fire-and-forget.
pub trait ErrorSink: Send + Sync {
    fn report(&self, error: &anyhow::Error, context: &ErrorContext);
}

/// Reports through `tracing`.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingErrorSink;

impl ErrorSink for TracingErrorSink {
    fn report(&self, error: &anyhow::Error, context: &ErrorContext) {
        let identity = context.identity_id.as_deref().unwrap_or("-");
        if context.silent {
            debug!("presence {} failed for {}: {:#}", context.operation, identity, error);
        } else {
            warn!("presence {} failed for {}: {:#}", context.operation, identity, error);
        }
    }
}

/// Keeps every report in memory.
#[derive(Debug, Default)]
pub struct RecordingErrorSink {
    reports: Mutex<Vec<(String, ErrorContext)>>,
}

impl RecordingErrorSink {
    pub fn new() -> Self {
        Self::default()
    }

    /// `(message, context)` for each report so far.
    pub fn reports(&self) -> Vec<(String, ErrorContext)> {
        self.reports
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

impl ErrorSink for RecordingErrorSink {
    fn report(&self, error: &anyhow::Error, context: &ErrorContext) {
        self.reports
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push((format!("{:#}", error), context.clone()));
    }
}
