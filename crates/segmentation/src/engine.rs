//! Engine facade — owns every segmentation component and exposes the
//! in-process API surface the host service wraps.
//!
//! Construct one engine at process startup and share it as `Arc`; there
//! is no global accessor.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;
use dashmap::DashMap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::info;
use uuid::Uuid;

use donorpulse_core::alert_bus::{noop_sink, AlertSink};
use donorpulse_core::types::{Donor, SegmentAlert};
use donorpulse_core::{EngineConfig, EngineError, EngineResult};

use crate::alerts::AlertEmitter;
use crate::analytics::{build_analytics, SegmentationAnalytics};
use crate::behavior::BehavioralAnalyzer;
use crate::clustering::ClusteringEngine;
use crate::membership::{MembershipStore, ReconcileContext};
use crate::registry::SegmentRegistry;
use crate::rules::RuleEvaluator;
use crate::types::{
    AudienceSegment, BehavioralPattern, ClusteringAlgorithm, ClusteringConfig, ClusteringRun,
    DonorCluster, SegmentDefinition, SegmentMembership, SegmentPatch, SegmentUpdate,
};

/// Retained reconciliation diffs, feeding analytics trends.
const UPDATE_HISTORY_LIMIT: usize = 500;

/// Serializable snapshot of the engine's in-memory maps, for host-side
/// persistence and rehydration on restart.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineState {
    pub segments: Vec<AudienceSegment>,
    pub memberships: Vec<SegmentMembership>,
    pub clustering_runs: Vec<ClusteringRun>,
    pub behavioral_patterns: HashMap<String, Vec<BehavioralPattern>>,
}

pub struct SegmentationEngine {
    registry: SegmentRegistry,
    memberships: MembershipStore,
    evaluator: RuleEvaluator,
    analyzer: BehavioralAnalyzer,
    clustering: ClusteringEngine,
    /// Latest run per algorithm; a new run replaces the prior one
    /// wholesale.
    runs: DashMap<ClusteringAlgorithm, ClusteringRun>,
    /// Last computed patterns per donor id.
    patterns: DashMap<String, Vec<BehavioralPattern>>,
    alerts: AlertEmitter,
    update_history: Mutex<Vec<SegmentUpdate>>,
}

impl std::fmt::Debug for SegmentationEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SegmentationEngine")
            .field("segments", &self.registry.list().len())
            .field("memberships", &self.memberships.total_memberships())
            .field("clustering_runs", &self.runs.len())
            .finish()
    }
}

impl SegmentationEngine {
    pub fn new(config: EngineConfig) -> Self {
        Self::with_alert_sink(config, noop_sink())
    }

    pub fn with_alert_sink(config: EngineConfig, sink: Arc<dyn AlertSink>) -> Self {
        Self {
            registry: SegmentRegistry::new(),
            memberships: MembershipStore::new(),
            evaluator: RuleEvaluator::new(),
            analyzer: BehavioralAnalyzer::new(config.behavior.clone()),
            clustering: ClusteringEngine::new(config.clustering.clone()),
            runs: DashMap::new(),
            patterns: DashMap::new(),
            alerts: AlertEmitter::new(sink),
            update_history: Mutex::new(Vec::new()),
        }
    }

    // ─── Segment CRUD ────────────────────────────────────────────────

    pub fn create_segment(&self, def: SegmentDefinition) -> EngineResult<AudienceSegment> {
        self.registry.create(def)
    }

    pub fn update_segment(&self, id: &Uuid, patch: SegmentPatch) -> EngineResult<AudienceSegment> {
        self.registry.update(id, patch)
    }

    /// Hard delete: cascades memberships and the pending dirty entry.
    pub fn delete_segment(&self, id: &Uuid) -> EngineResult<()> {
        let segment = self.registry.delete(id)?;
        let dropped = self.memberships.remove_segment(id);
        info!(
            segment_id = %id,
            name = %segment.name,
            memberships_dropped = dropped,
            "Segment deleted with membership cascade"
        );
        Ok(())
    }

    pub fn get_segment(&self, id: &Uuid) -> Option<AudienceSegment> {
        self.registry.get(id)
    }

    pub fn get_segments(&self) -> Vec<AudienceSegment> {
        self.registry.list()
    }

    pub fn get_donor_segments(&self, donor_id: &str) -> Vec<SegmentMembership> {
        self.memberships.donor_segments(donor_id)
    }

    // ─── Dirty queue (scheduler surface) ─────────────────────────────

    pub fn mark_segment_dirty(&self, id: Uuid) {
        self.registry.mark_dirty(id);
    }

    pub fn mark_all_auto_dirty(&self) -> usize {
        self.registry.mark_all_auto_dirty()
    }

    pub fn dirty_segments(&self) -> Vec<Uuid> {
        self.registry.dirty_snapshot()
    }

    pub fn clear_dirty(&self, id: &Uuid) {
        self.registry.clear_dirty(id);
    }

    // ─── Reconciliation ──────────────────────────────────────────────

    /// One reconciliation cycle for one segment against the supplied
    /// donor snapshot. If the segment is deleted while the pass is in
    /// flight, results are discarded at commit time.
    pub fn reconcile_segment(
        &self,
        id: &Uuid,
        donors: &[Donor],
    ) -> EngineResult<Vec<SegmentUpdate>> {
        let mut segment = self
            .registry
            .get(id)
            .ok_or(EngineError::SegmentNotFound(*id))?;
        let as_of = Utc::now();

        let run = segment
            .cluster_id
            .and_then(|cluster_id| self.run_containing(&cluster_id));
        let ctx = ReconcileContext {
            evaluator: &self.evaluator,
            analyzer: &self.analyzer,
            cluster_assignments: run.as_ref().map(|r| &r.assignments),
            as_of,
        };

        let qualified = self
            .memberships
            .compute_qualifications(&segment, donors, &ctx);
        let previous_size = self.memberships.segment_size(id);

        // Commit guard: a segment deleted mid-cycle keeps its cascade
        // clean — the stale results are dropped, not partially applied.
        if !self.registry.contains(id) {
            info!(segment_id = %id, "Segment deleted mid-cycle, discarding reconciliation");
            return Ok(Vec::new());
        }

        let updates = self.memberships.apply(&mut segment, qualified, as_of);
        self.registry
            .set_runtime_metadata(id, segment.metadata.size, as_of);
        self.alerts
            .observe_reconciliation(&segment, &updates, previous_size);
        self.record_history(&updates);

        info!(
            segment_id = %id,
            size = segment.metadata.size,
            changes = updates.iter().map(|u| u.donor_ids.len()).sum::<usize>(),
            "Reconciled segment"
        );
        Ok(updates)
    }

    fn record_history(&self, updates: &[SegmentUpdate]) {
        if updates.is_empty() {
            return;
        }
        let mut history = self.update_history.lock();
        history.extend_from_slice(updates);
        let len = history.len();
        if len > UPDATE_HISTORY_LIMIT {
            history.drain(..len - UPDATE_HISTORY_LIMIT);
        }
    }

    // ─── Clustering ──────────────────────────────────────────────────

    /// Synchronous, ad hoc clustering run. Replaces the previous run for
    /// the same algorithm.
    pub fn perform_clustering(
        &self,
        donors: &[Donor],
        config: &ClusteringConfig,
    ) -> EngineResult<Vec<DonorCluster>> {
        let run = self.clustering.cluster(donors, config, Utc::now())?;
        let clusters = run.clusters.clone();
        self.runs.insert(config.algorithm, run);
        Ok(clusters)
    }

    pub fn get_clusters(&self) -> Vec<DonorCluster> {
        self.runs
            .iter()
            .flat_map(|e| e.value().clusters.clone())
            .collect()
    }

    pub fn get_cluster(&self, id: &Uuid) -> Option<DonorCluster> {
        self.runs.iter().find_map(|e| {
            e.value().clusters.iter().find(|c| c.id == *id).cloned()
        })
    }

    fn run_containing(&self, cluster_id: &Uuid) -> Option<ClusteringRun> {
        self.runs
            .iter()
            .find(|e| e.value().clusters.iter().any(|c| c.id == *cluster_id))
            .map(|e| e.value().clone())
    }

    // ─── Behavioral analysis ─────────────────────────────────────────

    pub fn analyze_donor_behavior(&self, donor: &Donor) -> Vec<BehavioralPattern> {
        let patterns = self.analyzer.analyze(donor, Utc::now());
        self.patterns.insert(donor.id.clone(), patterns.clone());
        patterns
    }

    /// All patterns from the most recent analysis of each donor.
    pub fn get_behavioral_patterns(&self) -> Vec<BehavioralPattern> {
        self.patterns
            .iter()
            .flat_map(|e| e.value().clone())
            .collect()
    }

    // ─── Alerts & analytics ──────────────────────────────────────────

    /// Drain pending alerts.
    pub fn get_alerts(&self) -> Vec<SegmentAlert> {
        self.alerts.drain()
    }

    pub fn peek_alerts(&self) -> Vec<SegmentAlert> {
        self.alerts.peek()
    }

    pub(crate) fn alert_emitter(&self) -> &AlertEmitter {
        &self.alerts
    }

    pub fn segmentation_analytics(&self) -> SegmentationAnalytics {
        let segments = self.registry.list();
        let cluster_count = self.runs.iter().map(|e| e.value().clusters.len()).sum();
        let history = self.update_history.lock().clone();
        build_analytics(
            &segments,
            &self.memberships,
            cluster_count,
            &history,
            Utc::now(),
        )
    }

    // ─── State export/import ─────────────────────────────────────────

    pub fn export_state(&self) -> EngineState {
        EngineState {
            segments: self.registry.list(),
            memberships: self.memberships.all_memberships(),
            clustering_runs: self.runs.iter().map(|e| e.value().clone()).collect(),
            behavioral_patterns: self
                .patterns
                .iter()
                .map(|e| (e.key().clone(), e.value().clone()))
                .collect(),
        }
    }

    /// Rehydrate all in-memory maps from a previously exported state.
    pub fn import_state(&self, state: EngineState) {
        self.registry.load(state.segments);
        self.memberships.load(state.memberships);
        self.runs.clear();
        for run in state.clustering_runs {
            self.runs.insert(run.algorithm, run);
        }
        self.patterns.clear();
        for (donor_id, patterns) in state.behavioral_patterns {
            self.patterns.insert(donor_id, patterns);
        }
        info!("Engine state imported");
    }
}

impl Default for SegmentationEngine {
    fn default() -> Self {
        Self::new(EngineConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use donorpulse_core::types::{Demographics, Donation};
    use serde_json::json;

    use crate::types::{
        Rule, RuleGroup, RuleOperator, SegmentCriteria, SegmentType,
    };

    fn donor(id: &str, total: f64, count: usize) -> Donor {
        let now = Utc::now();
        Donor {
            id: id.to_string(),
            name: None,
            email: None,
            donations: (0..count)
                .map(|i| Donation {
                    amount: total / count as f64,
                    date: now - Duration::days(20 * (i as i64 + 1)),
                    campaign_id: None,
                    channel: None,
                })
                .collect(),
            interactions: Vec::new(),
            demographics: Demographics::default(),
            attributes: std::collections::HashMap::new(),
        }
    }

    fn population() -> Vec<Donor> {
        let mut donors: Vec<Donor> = (0..8).map(|i| donor(&format!("small-{i}"), 60.0, 1)).collect();
        donors.extend((0..8).map(|i| donor(&format!("large-{i}"), 8_000.0, 16)));
        donors
    }

    fn high_value_definition() -> SegmentDefinition {
        SegmentDefinition {
            name: "High value".to_string(),
            description: Some("Donors above $1k lifetime".to_string()),
            segment_type: SegmentType::Dynamic,
            criteria: SegmentCriteria {
                include: Some(RuleGroup::all(vec![Rule {
                    field: "total_donated".to_string(),
                    operator: RuleOperator::GreaterThan,
                    value: json!(1000),
                }])),
                exclude: None,
            },
            cluster_id: None,
            behavioral_patterns: Vec::new(),
            config: Default::default(),
            tags: vec!["value".to_string()],
            priority: 1,
            personalization: Default::default(),
        }
    }

    #[test]
    fn test_end_to_end_rule_segment() {
        let engine = SegmentationEngine::default();
        let donors = population();
        let segment = engine.create_segment(high_value_definition()).unwrap();

        let updates = engine.reconcile_segment(&segment.id, &donors).unwrap();
        assert_eq!(updates.len(), 1);
        assert_eq!(updates[0].donor_ids.len(), 8);

        let refreshed = engine.get_segment(&segment.id).unwrap();
        assert_eq!(refreshed.metadata.size, 8);
        assert!(refreshed.metadata.last_updated.is_some());

        // Size invariant: metadata matches live membership count.
        let live = (0..8)
            .filter(|i| !engine.get_donor_segments(&format!("large-{i}")).is_empty())
            .count();
        assert_eq!(refreshed.metadata.size as usize, live);

        // Second cycle is idempotent.
        let updates = engine.reconcile_segment(&segment.id, &donors).unwrap();
        assert!(updates.is_empty());
    }

    #[test]
    fn test_cluster_gated_segment() {
        let engine = SegmentationEngine::default();
        let donors = population();

        let config = ClusteringConfig {
            algorithm: ClusteringAlgorithm::KMeans,
            num_clusters: 2,
            features: vec!["total_donated".to_string(), "donation_count".to_string()],
            normalize_features: true,
            max_iterations: None,
            tolerance: None,
            random_seed: Some(11),
        };
        let clusters = engine.perform_clustering(&donors, &config).unwrap();
        assert_eq!(clusters.len(), 2);

        let large_cluster = clusters
            .iter()
            .find(|c| c.characteristics.avg_donation_amount > 100.0)
            .unwrap();

        let mut def = high_value_definition();
        def.criteria = SegmentCriteria::default();
        def.cluster_id = Some(large_cluster.id);
        let segment = engine.create_segment(def).unwrap();

        engine.reconcile_segment(&segment.id, &donors).unwrap();
        let refreshed = engine.get_segment(&segment.id).unwrap();
        assert_eq!(refreshed.metadata.size, 8);

        let membership = &engine.get_donor_segments("large-0")[0];
        assert_eq!(membership.source, crate::types::MembershipSource::MlClustering);
    }

    #[test]
    fn test_reclustering_replaces_prior_run() {
        let engine = SegmentationEngine::default();
        let donors = population();
        let config = ClusteringConfig {
            algorithm: ClusteringAlgorithm::KMeans,
            num_clusters: 2,
            features: vec!["total_donated".to_string()],
            normalize_features: true,
            max_iterations: None,
            tolerance: None,
            random_seed: Some(5),
        };
        engine.perform_clustering(&donors, &config).unwrap();
        engine.perform_clustering(&donors, &config).unwrap();
        // Only the latest run's clusters remain.
        assert_eq!(engine.get_clusters().len(), 2);
    }

    #[test]
    fn test_delete_cascades_memberships() {
        let engine = SegmentationEngine::default();
        let donors = population();
        let segment = engine.create_segment(high_value_definition()).unwrap();
        engine.reconcile_segment(&segment.id, &donors).unwrap();
        assert!(!engine.get_donor_segments("large-3").is_empty());

        engine.delete_segment(&segment.id).unwrap();
        assert!(engine.get_donor_segments("large-3").is_empty());
        assert!(matches!(
            engine.reconcile_segment(&segment.id, &donors),
            Err(EngineError::SegmentNotFound(_))
        ));
    }

    #[test]
    fn test_alerts_flow_from_churn() {
        let engine = SegmentationEngine::default();
        let donors = population();
        let segment = engine.create_segment(high_value_definition()).unwrap();

        // Initial fill churns against a floor of 1, raising a high alert.
        engine.reconcile_segment(&segment.id, &donors).unwrap();
        let alerts = engine.get_alerts();
        assert_eq!(alerts.len(), 1);
        assert!(alerts[0].action_required);
        // Drained queue stays empty on an idempotent cycle.
        engine.reconcile_segment(&segment.id, &donors).unwrap();
        assert!(engine.get_alerts().is_empty());
    }

    #[test]
    fn test_export_import_round_trip() {
        let engine = SegmentationEngine::default();
        let donors = population();
        let segment = engine.create_segment(high_value_definition()).unwrap();
        engine.reconcile_segment(&segment.id, &donors).unwrap();
        engine.analyze_donor_behavior(&donors[10]);

        let state = engine.export_state();
        let json = serde_json::to_string(&state).unwrap();
        let restored_state: EngineState = serde_json::from_str(&json).unwrap();

        let restored = SegmentationEngine::default();
        restored.import_state(restored_state);
        assert_eq!(restored.get_segments().len(), 1);
        assert_eq!(restored.get_segment(&segment.id).unwrap().metadata.size, 8);
        assert_eq!(restored.get_donor_segments("large-0").len(), 1);
        assert!(!restored.get_behavioral_patterns().is_empty());
    }

    #[test]
    fn test_analytics_overview() {
        let engine = SegmentationEngine::default();
        let donors = population();
        let segment = engine.create_segment(high_value_definition()).unwrap();
        engine.reconcile_segment(&segment.id, &donors).unwrap();

        let analytics = engine.segmentation_analytics();
        assert_eq!(analytics.overview.total_segments, 1);
        assert_eq!(analytics.overview.total_memberships, 8);
        assert!(!analytics.trends.is_empty());
        assert_eq!(analytics.predictions[0].recent_net_change, 8);
    }
}
