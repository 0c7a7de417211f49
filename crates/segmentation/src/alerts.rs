//! Membership-churn alerting — inspects reconciliation diffs and raises
//! alerts when a segment's population shifts faster than expected.

use std::sync::Arc;

use chrono::Utc;
use parking_lot::Mutex;
use tracing::warn;
use uuid::Uuid;

use donorpulse_core::alert_bus::AlertSink;
use donorpulse_core::types::{AlertSeverity, AlertType, SegmentAlert};

use crate::types::{AudienceSegment, SegmentUpdate};

/// Churn fraction above which a size_change alert is raised.
const CHURN_ALERT_THRESHOLD: f64 = 0.2;
/// Churn fraction above which the alert escalates to high severity and
/// demands action.
const CHURN_ESCALATION_THRESHOLD: f64 = 0.5;

pub struct AlertEmitter {
    sink: Arc<dyn AlertSink>,
    queue: Mutex<Vec<SegmentAlert>>,
}

impl AlertEmitter {
    pub fn new(sink: Arc<dyn AlertSink>) -> Self {
        Self {
            sink,
            queue: Mutex::new(Vec::new()),
        }
    }

    /// Inspect one reconciliation diff. `previous_size` is the segment's
    /// membership count before the cycle applied.
    pub fn observe_reconciliation(
        &self,
        segment: &AudienceSegment,
        updates: &[SegmentUpdate],
        previous_size: u64,
    ) -> Option<SegmentAlert> {
        let changed: usize = updates.iter().map(|u| u.donor_ids.len()).sum();
        if changed == 0 {
            return None;
        }
        let change_percent = changed as f64 / previous_size.max(1) as f64;
        if change_percent <= CHURN_ALERT_THRESHOLD {
            return None;
        }

        let (severity, action_required) = if change_percent > CHURN_ESCALATION_THRESHOLD {
            (AlertSeverity::High, true)
        } else {
            (AlertSeverity::Medium, false)
        };

        warn!(
            segment_id = %segment.id,
            change_percent = format!("{change_percent:.2}"),
            ?severity,
            "segment membership churn over threshold"
        );

        let alert = SegmentAlert {
            id: Uuid::new_v4(),
            segment_id: segment.id,
            alert_type: AlertType::SizeChange,
            severity,
            message: format!(
                "Segment '{}' membership changed by {:.0}% in one cycle",
                segment.name,
                change_percent * 100.0
            ),
            details: serde_json::json!({
                "previous_size": previous_size,
                "new_size": segment.metadata.size,
                "changed_memberships": changed,
                "change_percent": change_percent,
            }),
            action_required,
            created_at: Utc::now(),
        };
        self.push(alert.clone());
        Some(alert)
    }

    /// Record a failed reconciliation pass so it is visible beyond logs.
    pub fn observe_failure(&self, segment_id: Uuid, error: &str) {
        let alert = SegmentAlert {
            id: Uuid::new_v4(),
            segment_id,
            alert_type: AlertType::ReconciliationFailure,
            severity: AlertSeverity::Low,
            message: format!("Reconciliation failed for segment {segment_id}"),
            details: serde_json::json!({ "error": error }),
            action_required: false,
            created_at: Utc::now(),
        };
        self.push(alert);
    }

    fn push(&self, alert: SegmentAlert) {
        self.sink.emit(alert.clone());
        self.queue.lock().push(alert);
    }

    /// Remove and return all pending alerts.
    pub fn drain(&self) -> Vec<SegmentAlert> {
        std::mem::take(&mut *self.queue.lock())
    }

    /// Inspect pending alerts without consuming them.
    pub fn peek(&self) -> Vec<SegmentAlert> {
        self.queue.lock().clone()
    }
}
