//! Alert bus — trait for handing segment alerts to the host application.
//!
//! The engine only enqueues alerts; delivery (notification service,
//! dashboard feed, pager) is the host's concern. Components accept an
//! `Arc<dyn AlertSink>` so tests can capture what was emitted.

use std::sync::Mutex;

use crate::types::{AlertSeverity, SegmentAlert};

/// Trait for receiving segment alerts as they are raised.
pub trait AlertSink: Send + Sync {
    fn emit(&self, alert: SegmentAlert);
}

/// No-op sink for tests and hosts that poll the engine's queue instead.
pub struct NoOpSink;

impl AlertSink for NoOpSink {
    fn emit(&self, _alert: SegmentAlert) {}
}

/// In-memory sink that captures alerts for testing.
#[derive(Default)]
pub struct CaptureSink {
    alerts: Mutex<Vec<SegmentAlert>>,
}

impl CaptureSink {
    pub fn new() -> Self {
        Self {
            alerts: Mutex::new(Vec::new()),
        }
    }

    pub fn alerts(&self) -> Vec<SegmentAlert> {
        self.alerts.lock().expect("alert bus mutex poisoned").clone()
    }

    pub fn count(&self) -> usize {
        self.alerts.lock().expect("alert bus mutex poisoned").len()
    }

    pub fn count_severity(&self, severity: AlertSeverity) -> usize {
        self.alerts
            .lock()
            .expect("alert bus mutex poisoned")
            .iter()
            .filter(|a| a.severity == severity)
            .count()
    }

    pub fn clear(&self) {
        self.alerts.lock().expect("alert bus mutex poisoned").clear();
    }
}

impl AlertSink for CaptureSink {
    fn emit(&self, alert: SegmentAlert) {
        self.alerts.lock().expect("alert bus mutex poisoned").push(alert);
    }
}

/// Shared no-op sink for components constructed without an explicit sink.
pub fn noop_sink() -> std::sync::Arc<dyn AlertSink> {
    std::sync::Arc::new(NoOpSink)
}
