//! Membership store and reconciliation — the authoritative
//! (donor, segment) mapping, diffed against fresh qualification results
//! each cycle.

use std::collections::{HashMap, HashSet};

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use tracing::debug;
use uuid::Uuid;

use donorpulse_core::types::Donor;

use crate::behavior::BehavioralAnalyzer;
use crate::features;
use crate::rules::RuleEvaluator;
use crate::types::{
    AudienceSegment, ChangeType, ClusterAssignment, MembershipSource, SegmentMembership,
    SegmentType, SegmentUpdate,
};

/// Dependencies one reconciliation cycle evaluates donors against. The
/// same `as_of` instant is threaded through every donor so the cycle is
/// a pure function of the snapshot.
pub struct ReconcileContext<'a> {
    pub evaluator: &'a RuleEvaluator,
    pub analyzer: &'a BehavioralAnalyzer,
    /// Assignments from the clustering run containing the segment's
    /// cluster gate, if any.
    pub cluster_assignments: Option<&'a HashMap<String, ClusterAssignment>>,
    pub as_of: DateTime<Utc>,
}

/// A donor that qualified for a segment this cycle, with provenance.
#[derive(Debug, Clone)]
pub struct QualifiedDonor {
    pub donor_id: String,
    pub source: MembershipSource,
    pub confidence: f64,
}

#[derive(Default)]
pub struct MembershipStore {
    by_segment: DashMap<Uuid, HashMap<String, SegmentMembership>>,
    by_donor: DashMap<String, HashSet<Uuid>>,
}

impl MembershipStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Live membership count for a segment.
    pub fn segment_size(&self, segment_id: &Uuid) -> u64 {
        self.by_segment
            .get(segment_id)
            .map(|m| m.len() as u64)
            .unwrap_or(0)
    }

    pub fn members_of(&self, segment_id: &Uuid) -> Vec<SegmentMembership> {
        self.by_segment
            .get(segment_id)
            .map(|m| m.values().cloned().collect())
            .unwrap_or_default()
    }

    /// All memberships for one donor, via the donor-id index. The index
    /// guard is released before the primary map is read so this never
    /// holds both maps at once.
    pub fn donor_segments(&self, donor_id: &str) -> Vec<SegmentMembership> {
        let segment_ids: Vec<Uuid> = match self.by_donor.get(donor_id) {
            Some(ids) => ids.iter().copied().collect(),
            None => return Vec::new(),
        };
        segment_ids
            .iter()
            .filter_map(|sid| {
                self.by_segment
                    .get(sid)
                    .and_then(|m| m.get(donor_id).cloned())
            })
            .collect()
    }

    pub fn total_memberships(&self) -> u64 {
        self.by_segment.iter().map(|e| e.value().len() as u64).sum()
    }

    /// Cascade delete for a removed segment. Returns how many
    /// memberships were dropped.
    pub fn remove_segment(&self, segment_id: &Uuid) -> usize {
        let removed = self
            .by_segment
            .remove(segment_id)
            .map(|(_, members)| members)
            .unwrap_or_default();
        for donor_id in removed.keys() {
            if let Some(mut segments) = self.by_donor.get_mut(donor_id) {
                segments.remove(segment_id);
            }
        }
        removed.len()
    }

    /// Phase 1: evaluate every donor against the segment's mechanisms.
    /// Pure with respect to store state; nothing is applied yet.
    pub fn compute_qualifications(
        &self,
        segment: &AudienceSegment,
        donors: &[Donor],
        ctx: &ReconcileContext<'_>,
    ) -> Vec<QualifiedDonor> {
        donors
            .iter()
            .filter_map(|donor| qualify(segment, donor, ctx))
            .collect()
    }

    /// Phase 2: diff qualification results against current membership
    /// and apply. Emits at most one `added` and one `removed` update;
    /// an unchanged population emits none. Restores the segment's size
    /// invariant and stamps `last_updated`.
    pub fn apply(
        &self,
        segment: &mut AudienceSegment,
        qualified: Vec<QualifiedDonor>,
        as_of: DateTime<Utc>,
    ) -> Vec<SegmentUpdate> {
        let segment_id = segment.id;

        // Mutate the primary map first, release its guard, then update
        // the donor index. Both maps are never locked at once.
        let (joined, leaving) = {
            let mut members = self.by_segment.entry(segment_id).or_default();

            let qualified_ids: HashSet<&str> =
                qualified.iter().map(|q| q.donor_id.as_str()).collect();

            let leaving: Vec<String> = members
                .keys()
                .filter(|id| !qualified_ids.contains(id.as_str()))
                .cloned()
                .collect();

            let mut joined = Vec::new();
            for q in qualified {
                if members.contains_key(&q.donor_id) {
                    continue;
                }
                members.insert(
                    q.donor_id.clone(),
                    SegmentMembership {
                        donor_id: q.donor_id.clone(),
                        segment_id,
                        joined_at: as_of,
                        confidence: q.confidence,
                        source: q.source,
                    },
                );
                joined.push(q.donor_id);
            }

            for donor_id in &leaving {
                members.remove(donor_id);
            }

            segment.metadata.size = members.len() as u64;
            segment.metadata.last_updated = Some(as_of);
            (joined, leaving)
        };

        for donor_id in &joined {
            self.by_donor
                .entry(donor_id.clone())
                .or_default()
                .insert(segment_id);
        }
        for donor_id in &leaving {
            if let Some(mut segments) = self.by_donor.get_mut(donor_id) {
                segments.remove(&segment_id);
            }
        }

        let mut updates = Vec::new();
        if !joined.is_empty() {
            debug!(segment_id = %segment_id, joined = joined.len(), "donors joined segment");
            updates.push(SegmentUpdate {
                id: Uuid::new_v4(),
                segment_id,
                change_type: ChangeType::Added,
                donor_ids: joined,
                reason: "qualified under segment criteria".to_string(),
                timestamp: as_of,
            });
        }
        if !leaving.is_empty() {
            debug!(segment_id = %segment_id, left = leaving.len(), "donors left segment");
            updates.push(SegmentUpdate {
                id: Uuid::new_v4(),
                segment_id,
                change_type: ChangeType::Removed,
                donor_ids: leaving,
                reason: "no longer qualifies".to_string(),
                timestamp: as_of,
            });
        }
        updates
    }

    /// Full cycle: qualify, diff, apply. The engine splits the phases
    /// when it needs an existence check between them.
    pub fn reconcile(
        &self,
        segment: &mut AudienceSegment,
        donors: &[Donor],
        ctx: &ReconcileContext<'_>,
    ) -> Vec<SegmentUpdate> {
        let qualified = self.compute_qualifications(segment, donors, ctx);
        self.apply(segment, qualified, ctx.as_of)
    }

    /// Flat dump for state export.
    pub fn all_memberships(&self) -> Vec<SegmentMembership> {
        self.by_segment
            .iter()
            .flat_map(|e| e.value().values().cloned().collect::<Vec<_>>())
            .collect()
    }

    /// Rebuild both indices from an exported flat list.
    pub fn load(&self, memberships: Vec<SegmentMembership>) {
        self.by_segment.clear();
        self.by_donor.clear();
        for m in memberships {
            self.by_donor
                .entry(m.donor_id.clone())
                .or_default()
                .insert(m.segment_id);
            self.by_segment
                .entry(m.segment_id)
                .or_default()
                .insert(m.donor_id.clone(), m);
        }
    }
}

/// Evaluate one donor against every mechanism the segment combines:
/// include rules AND NOT exclude rules, then the cluster gate, then the
/// behavioral-pattern gate. Returns provenance and confidence when all
/// applicable gates pass.
fn qualify(
    segment: &AudienceSegment,
    donor: &Donor,
    ctx: &ReconcileContext<'_>,
) -> Option<QualifiedDonor> {
    if !ctx.evaluator.qualifies(donor, &segment.criteria, ctx.as_of) {
        return None;
    }

    let mut cluster_distance = None;
    if let Some(cluster_id) = segment.cluster_id {
        let assignment = ctx.cluster_assignments?.get(&donor.id)?;
        if assignment.cluster_id != cluster_id {
            return None;
        }
        cluster_distance = Some(assignment.distance);
    }

    if !segment.behavioral_patterns.is_empty() {
        let patterns = ctx.analyzer.analyze(donor, ctx.as_of);
        let exhibited: HashSet<&str> = patterns.iter().map(|p| p.id.as_str()).collect();
        if !segment
            .behavioral_patterns
            .iter()
            .any(|required| exhibited.contains(required.as_str()))
        {
            return None;
        }
    }

    // Provenance priority: ml_clustering > prediction > rules.
    let (source, confidence) = if let Some(distance) = cluster_distance {
        (
            MembershipSource::MlClustering,
            0.9 - 0.2 * distance.min(1.0),
        )
    } else if segment.segment_type == SegmentType::Predictive {
        let engagement = features::engagement_score(donor, ctx.as_of);
        (MembershipSource::Prediction, 0.6 + 0.3 * (engagement / 100.0))
    } else {
        (MembershipSource::Rules, 0.8)
    };

    Some(QualifiedDonor {
        donor_id: donor.id.clone(),
        source,
        confidence,
    })
}
