//! Segmentation analytics — aggregate view over segments, memberships,
//! and recent reconciliation history.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::membership::MembershipStore;
use crate::types::{AudienceSegment, ChangeType, SegmentStatus, SegmentUpdate};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SegmentationOverview {
    pub total_segments: u64,
    pub active_segments: u64,
    pub paused_segments: u64,
    pub archived_segments: u64,
    pub total_memberships: u64,
    pub avg_segment_size: f64,
    pub total_clusters: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SegmentPerformanceSummary {
    pub segment_id: Uuid,
    pub name: String,
    pub size: u64,
    pub conversion_rate: f64,
    pub engagement_rate: f64,
    pub revenue_per_donor: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthState {
    Healthy,
    Stale,
    Empty,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SegmentHealth {
    pub segment_id: Uuid,
    pub name: String,
    pub status: SegmentStatus,
    pub size: u64,
    pub last_updated: Option<DateTime<Utc>>,
    pub health: HealthState,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrendPoint {
    pub timestamp: DateTime<Utc>,
    pub added: u64,
    pub removed: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SegmentPrediction {
    pub segment_id: Uuid,
    pub name: String,
    /// Net membership change observed in the retained history window.
    pub recent_net_change: i64,
    /// Naive linear projection of the segment's size 30 days out,
    /// assuming the recent net drift continues.
    pub projected_size_30d: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SegmentationAnalytics {
    pub overview: SegmentationOverview,
    pub top_performing_segments: Vec<SegmentPerformanceSummary>,
    pub segment_health: Vec<SegmentHealth>,
    pub trends: Vec<TrendPoint>,
    pub predictions: Vec<SegmentPrediction>,
    pub generated_at: DateTime<Utc>,
}

/// How many top performers to surface.
const TOP_SEGMENT_LIMIT: usize = 5;

pub fn build_analytics(
    segments: &[AudienceSegment],
    store: &MembershipStore,
    cluster_count: usize,
    recent_updates: &[SegmentUpdate],
    now: DateTime<Utc>,
) -> SegmentationAnalytics {
    let total = segments.len() as u64;
    let active = segments
        .iter()
        .filter(|s| s.status == SegmentStatus::Active)
        .count() as u64;
    let paused = segments
        .iter()
        .filter(|s| s.status == SegmentStatus::Paused)
        .count() as u64;
    let archived = total - active - paused;

    let total_memberships = store.total_memberships();
    let avg_segment_size = if total > 0 {
        total_memberships as f64 / total as f64
    } else {
        0.0
    };

    let mut top: Vec<SegmentPerformanceSummary> = segments
        .iter()
        .map(|s| SegmentPerformanceSummary {
            segment_id: s.id,
            name: s.name.clone(),
            size: s.metadata.size,
            conversion_rate: s.performance.conversion_rate,
            engagement_rate: s.performance.engagement_rate,
            revenue_per_donor: s.performance.revenue_per_donor,
        })
        .collect();
    top.sort_by(|a, b| {
        (b.conversion_rate + b.engagement_rate)
            .partial_cmp(&(a.conversion_rate + a.engagement_rate))
            .unwrap_or(std::cmp::Ordering::Equal)
    });
    top.truncate(TOP_SEGMENT_LIMIT);

    let health = segments
        .iter()
        .map(|s| SegmentHealth {
            segment_id: s.id,
            name: s.name.clone(),
            status: s.status,
            size: s.metadata.size,
            last_updated: s.metadata.last_updated,
            health: health_of(s, now),
        })
        .collect();

    let trends = trend_points(recent_updates);

    let predictions = segments
        .iter()
        .map(|s| {
            let net: i64 = recent_updates
                .iter()
                .filter(|u| u.segment_id == s.id)
                .map(|u| match u.change_type {
                    ChangeType::Added => u.donor_ids.len() as i64,
                    ChangeType::Removed => -(u.donor_ids.len() as i64),
                })
                .sum();
            SegmentPrediction {
                segment_id: s.id,
                name: s.name.clone(),
                recent_net_change: net,
                projected_size_30d: (s.metadata.size as i64 + net).max(0) as u64,
            }
        })
        .collect();

    SegmentationAnalytics {
        overview: SegmentationOverview {
            total_segments: total,
            active_segments: active,
            paused_segments: paused,
            archived_segments: archived,
            total_memberships,
            avg_segment_size,
            total_clusters: cluster_count as u64,
        },
        top_performing_segments: top,
        segment_health: health,
        trends,
        predictions,
        generated_at: now,
    }
}

/// A segment is stale once it has gone two refresh intervals without a
/// successful reconciliation.
fn health_of(segment: &AudienceSegment, now: DateTime<Utc>) -> HealthState {
    let stale_after = chrono::Duration::seconds(segment.config.update_frequency_secs as i64 * 2);
    match segment.metadata.last_updated {
        None => HealthState::Stale,
        Some(updated) if now - updated > stale_after => HealthState::Stale,
        Some(_) if segment.metadata.size == 0 => HealthState::Empty,
        Some(_) => HealthState::Healthy,
    }
}

/// Bucket recent updates into per-timestamp add/remove counts, oldest
/// first.
fn trend_points(updates: &[SegmentUpdate]) -> Vec<TrendPoint> {
    let mut points: Vec<TrendPoint> = Vec::new();
    for update in updates {
        let count = update.donor_ids.len() as u64;
        match points.iter_mut().find(|p| p.timestamp == update.timestamp) {
            Some(point) => match update.change_type {
                ChangeType::Added => point.added += count,
                ChangeType::Removed => point.removed += count,
            },
            None => points.push(TrendPoint {
                timestamp: update.timestamp,
                added: if update.change_type == ChangeType::Added { count } else { 0 },
                removed: if update.change_type == ChangeType::Removed { count } else { 0 },
            }),
        }
    }
    points.sort_by_key(|p| p.timestamp);
    points
}
