//! Background update scheduler — drains the dirty-segment queue on a
//! short cadence and re-marks every auto-updating segment on a long
//! cadence, dispatching reconciliation onto a bounded worker pool.
//!
//! One segment's failure or slowness never blocks the drain of the
//! others, and no segment is ever reconciled by two passes at once.

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashSet;
use tokio::sync::{watch, Semaphore};
use tokio::task::JoinHandle;
use tracing::{debug, error, info};
use uuid::Uuid;

use donorpulse_core::config::SchedulerConfig;
use donorpulse_core::types::{Donor, DonorRepository};
use donorpulse_core::{EngineError, EngineResult};

use crate::engine::SegmentationEngine;
use crate::types::{ClusteringConfig, DonorCluster, SegmentStatus};

pub struct UpdateScheduler {
    engine: Arc<SegmentationEngine>,
    repository: Arc<dyn DonorRepository>,
    config: SchedulerConfig,
    permits: Arc<Semaphore>,
    in_flight: Arc<DashSet<Uuid>>,
    shutdown: watch::Sender<bool>,
    handles: Vec<JoinHandle<()>>,
}

impl UpdateScheduler {
    pub fn new(
        engine: Arc<SegmentationEngine>,
        repository: Arc<dyn DonorRepository>,
        config: SchedulerConfig,
    ) -> Self {
        let (shutdown, _) = watch::channel(false);
        let permits = Arc::new(Semaphore::new(config.max_concurrent_reconciliations.max(1)));
        Self {
            engine,
            repository,
            config,
            permits,
            in_flight: Arc::new(DashSet::new()),
            shutdown,
            handles: Vec::new(),
        }
    }

    /// Spawn the drain and full-refresh tickers. Idempotent lifecycle:
    /// call once at startup, then `stop` on shutdown.
    pub fn start(&mut self) {
        let drain_period = Duration::from_secs(self.config.drain_interval_secs.max(1));
        let refresh_period = Duration::from_secs(self.config.full_refresh_interval_secs.max(1));

        {
            let engine = self.engine.clone();
            let repository = self.repository.clone();
            let permits = self.permits.clone();
            let in_flight = self.in_flight.clone();
            let mut shutdown = self.shutdown.subscribe();
            self.handles.push(tokio::spawn(async move {
                let mut ticker = tokio::time::interval(drain_period);
                ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
                loop {
                    tokio::select! {
                        _ = ticker.tick() => {
                            drain(
                                engine.clone(),
                                repository.clone(),
                                permits.clone(),
                                in_flight.clone(),
                            )
                            .await;
                        }
                        _ = shutdown.changed() => break,
                    }
                }
                info!("Drain ticker stopped");
            }));
        }

        {
            let engine = self.engine.clone();
            let mut shutdown = self.shutdown.subscribe();
            self.handles.push(tokio::spawn(async move {
                let mut ticker = tokio::time::interval(refresh_period);
                ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
                // The first tick fires immediately; skip it so startup
                // does not double-refresh.
                ticker.tick().await;
                loop {
                    tokio::select! {
                        _ = ticker.tick() => {
                            let marked = engine.mark_all_auto_dirty();
                            info!(marked, "Full refresh: marked auto-updating segments dirty");
                        }
                        _ = shutdown.changed() => break,
                    }
                }
                info!("Full-refresh ticker stopped");
            }));
        }

        info!(
            drain_secs = self.config.drain_interval_secs,
            refresh_secs = self.config.full_refresh_interval_secs,
            workers = self.config.max_concurrent_reconciliations,
            "Update scheduler started"
        );
    }

    /// Signal shutdown and wait for both tickers to finish.
    pub async fn stop(&mut self) {
        let _ = self.shutdown.send(true);
        for handle in self.handles.drain(..) {
            if let Err(e) = handle.await {
                error!(error = %e, "Scheduler task panicked");
            }
        }
        info!("Update scheduler stopped");
    }

    /// One deterministic drain pass — what a drain tick does, callable
    /// directly so tests and hosts can drive cycles without timers.
    /// Returns the number of segments successfully reconciled.
    pub async fn drain_once(&self) -> usize {
        drain(
            self.engine.clone(),
            self.repository.clone(),
            self.permits.clone(),
            self.in_flight.clone(),
        )
        .await
    }

    /// One deterministic full-refresh pass.
    pub fn mark_all_dirty(&self) -> usize {
        self.engine.mark_all_auto_dirty()
    }

    /// Ad hoc clustering on the shared worker pool, off the ticker
    /// tasks, so a long run never blocks the drain cadence.
    pub async fn run_clustering(
        &self,
        donors: Vec<Donor>,
        config: ClusteringConfig,
    ) -> EngineResult<Vec<DonorCluster>> {
        let _permit = self
            .permits
            .clone()
            .acquire_owned()
            .await
            .map_err(|e| EngineError::Internal(anyhow::anyhow!("worker pool closed: {e}")))?;
        let engine = self.engine.clone();
        tokio::task::spawn_blocking(move || engine.perform_clustering(&donors, &config))
            .await
            .map_err(|e| EngineError::Internal(anyhow::anyhow!("clustering task panicked: {e}")))?
    }
}

/// Removes the segment from the in-flight set even if the owning task
/// unwinds, so a panicked pass cannot wedge the segment forever.
struct InFlightGuard {
    set: Arc<DashSet<Uuid>>,
    id: Uuid,
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.set.remove(&self.id);
    }
}

async fn drain(
    engine: Arc<SegmentationEngine>,
    repository: Arc<dyn DonorRepository>,
    permits: Arc<Semaphore>,
    in_flight: Arc<DashSet<Uuid>>,
) -> usize {
    let dirty = engine.dirty_segments();
    if dirty.is_empty() {
        return 0;
    }

    // One consistent snapshot shared by every segment in this cycle.
    let donors: Arc<Vec<Donor>> = Arc::new(repository.snapshot());
    debug!(dirty = dirty.len(), donors = donors.len(), "Draining dirty segments");

    let mut tasks = Vec::new();
    for id in dirty {
        let Some(segment) = engine.get_segment(&id) else {
            // Deleted since it was enqueued; nothing left to reconcile.
            engine.clear_dirty(&id);
            continue;
        };
        if segment.status != SegmentStatus::Active || !segment.config.auto_update {
            debug!(segment_id = %id, "Skipping inactive or manually-updated segment");
            continue;
        }
        if !in_flight.insert(id) {
            // A previous pass is still running; stays dirty for the
            // next drain.
            continue;
        }

        let engine = engine.clone();
        let donors = donors.clone();
        let permits = permits.clone();
        let guard = InFlightGuard {
            set: in_flight.clone(),
            id,
        };
        tasks.push(tokio::spawn(async move {
            let _guard = guard;
            let _permit = match permits.acquire_owned().await {
                Ok(permit) => permit,
                Err(_) => return false,
            };
            match engine.reconcile_segment(&id, &donors) {
                Ok(_) => {
                    engine.clear_dirty(&id);
                    true
                }
                Err(e) => {
                    // Task-boundary catch: log and alert, never
                    // propagate to sibling segments or the ticker.
                    error!(segment_id = %id, error = %e, "Segment reconciliation failed");
                    engine.alert_emitter().observe_failure(id, &e.to_string());
                    false
                }
            }
        }));
    }

    let mut processed = 0;
    for task in tasks {
        match task.await {
            Ok(true) => processed += 1,
            Ok(false) => {}
            Err(e) => error!(error = %e, "Reconciliation task panicked"),
        }
    }
    processed
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration as ChronoDuration, Utc};
    use donorpulse_core::types::{Demographics, Donation, InMemoryDonorRepository};
    use donorpulse_core::EngineConfig;
    use serde_json::json;

    use crate::types::{
        ClusteringAlgorithm, Rule, RuleGroup, RuleOperator, SegmentCriteria, SegmentDefinition,
        SegmentPatch, SegmentType,
    };

    fn donor(id: &str, total: f64) -> Donor {
        Donor {
            id: id.to_string(),
            name: None,
            email: None,
            donations: vec![Donation {
                amount: total,
                date: Utc::now() - ChronoDuration::days(15),
                campaign_id: None,
                channel: None,
            }],
            interactions: Vec::new(),
            demographics: Demographics::default(),
            attributes: std::collections::HashMap::new(),
        }
    }

    fn definition(name: &str, min_total: f64) -> SegmentDefinition {
        SegmentDefinition {
            name: name.to_string(),
            description: None,
            segment_type: SegmentType::Dynamic,
            criteria: SegmentCriteria {
                include: Some(RuleGroup::all(vec![Rule {
                    field: "total_donated".to_string(),
                    operator: RuleOperator::GreaterThan,
                    value: json!(min_total),
                }])),
                exclude: None,
            },
            cluster_id: None,
            behavioral_patterns: Vec::new(),
            config: Default::default(),
            tags: Vec::new(),
            priority: 0,
            personalization: Default::default(),
        }
    }

    fn scheduler_under_test(
        donors: Vec<Donor>,
    ) -> (Arc<SegmentationEngine>, UpdateScheduler) {
        let engine = Arc::new(SegmentationEngine::new(EngineConfig::default()));
        let repository = Arc::new(InMemoryDonorRepository::with_donors(donors));
        let scheduler = UpdateScheduler::new(
            engine.clone(),
            repository,
            donorpulse_core::config::SchedulerConfig::default(),
        );
        (engine, scheduler)
    }

    #[tokio::test]
    async fn test_drain_reconciles_dirty_segments() {
        let (engine, scheduler) =
            scheduler_under_test(vec![donor("a", 2000.0), donor("b", 50.0)]);
        let segment = engine.create_segment(definition("High", 1000.0)).unwrap();

        assert_eq!(scheduler.drain_once().await, 1);
        assert_eq!(engine.get_segment(&segment.id).unwrap().metadata.size, 1);
        // Processed id left the dirty queue.
        assert!(engine.dirty_segments().is_empty());
    }

    #[tokio::test]
    async fn test_missing_segment_dropped_others_processed() {
        let (engine, scheduler) =
            scheduler_under_test(vec![donor("a", 2000.0)]);
        let keep = engine.create_segment(definition("Keep", 1000.0)).unwrap();
        let ghost = Uuid::new_v4();
        engine.mark_segment_dirty(ghost);

        assert_eq!(scheduler.drain_once().await, 1);
        assert!(engine.dirty_segments().is_empty());
        assert_eq!(engine.get_segment(&keep.id).unwrap().metadata.size, 1);
    }

    #[tokio::test]
    async fn test_paused_segments_skipped_but_stay_dirty() {
        let (engine, scheduler) = scheduler_under_test(vec![donor("a", 2000.0)]);
        let segment = engine.create_segment(definition("Paused", 1000.0)).unwrap();
        engine
            .update_segment(
                &segment.id,
                SegmentPatch {
                    status: Some(crate::types::SegmentStatus::Paused),
                    ..Default::default()
                },
            )
            .unwrap();

        assert_eq!(scheduler.drain_once().await, 0);
        // Still pending for when the segment is reactivated.
        assert_eq!(engine.dirty_segments(), vec![segment.id]);
        assert_eq!(engine.get_segment(&segment.id).unwrap().metadata.size, 0);
    }

    #[tokio::test]
    async fn test_full_refresh_marks_auto_segments() {
        let (engine, scheduler) = scheduler_under_test(vec![donor("a", 2000.0)]);
        engine.create_segment(definition("One", 100.0)).unwrap();
        engine.create_segment(definition("Two", 1000.0)).unwrap();
        scheduler.drain_once().await;
        assert!(engine.dirty_segments().is_empty());

        assert_eq!(scheduler.mark_all_dirty(), 2);
        assert_eq!(engine.dirty_segments().len(), 2);
        assert_eq!(scheduler.drain_once().await, 2);
    }

    #[tokio::test]
    async fn test_start_stop_lifecycle() {
        let (engine, mut scheduler) = scheduler_under_test(vec![donor("a", 2000.0)]);
        engine.create_segment(definition("High", 1000.0)).unwrap();

        scheduler.start();
        // The drain ticker's first tick fires immediately.
        tokio::time::sleep(Duration::from_millis(100)).await;
        scheduler.stop().await;

        assert!(engine.dirty_segments().is_empty());
    }

    #[tokio::test]
    async fn test_run_clustering_off_ticker() {
        let (engine, scheduler) = scheduler_under_test(Vec::new());
        let donors: Vec<Donor> = (0..6)
            .map(|i| donor(&format!("s-{i}"), 50.0 + i as f64))
            .chain((0..6).map(|i| {
                let mut d = donor(&format!("l-{i}"), 9_000.0 + i as f64);
                d.donations.push(Donation {
                    amount: 500.0,
                    date: Utc::now() - ChronoDuration::days(45),
                    campaign_id: None,
                    channel: None,
                });
                d
            }))
            .collect();

        let config = ClusteringConfig {
            algorithm: ClusteringAlgorithm::KMeans,
            num_clusters: 2,
            features: vec!["total_donated".to_string()],
            normalize_features: true,
            max_iterations: None,
            tolerance: None,
            random_seed: Some(21),
        };
        let clusters = scheduler.run_clustering(donors, config).await.unwrap();
        assert_eq!(clusters.len(), 2);
        assert_eq!(engine.get_clusters().len(), 2);
    }
}
