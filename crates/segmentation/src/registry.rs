//! Segment registry — CRUD over segment definitions and the
//! deduplicated dirty queue feeding the update scheduler.

use chrono::Utc;
use dashmap::{DashMap, DashSet};
use tracing::info;
use uuid::Uuid;

use donorpulse_core::{EngineError, EngineResult};

use crate::rules::validate_rule_group;
use crate::types::{
    AudienceSegment, SegmentDefinition, SegmentMetadata, SegmentPatch, SegmentPerformance,
    SegmentStatus,
};

#[derive(Default)]
pub struct SegmentRegistry {
    segments: DashMap<Uuid, AudienceSegment>,
    dirty: DashSet<Uuid>,
}

impl SegmentRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Validate and store a new segment. The segment starts dirty so the
    /// next drain populates it.
    pub fn create(&self, def: SegmentDefinition) -> EngineResult<AudienceSegment> {
        validate_definition(&def)?;

        let now = Utc::now();
        let segment = AudienceSegment {
            id: Uuid::new_v4(),
            name: def.name,
            description: def.description,
            segment_type: def.segment_type,
            status: SegmentStatus::Active,
            criteria: def.criteria,
            cluster_id: def.cluster_id,
            behavioral_patterns: def.behavioral_patterns,
            config: def.config,
            metadata: SegmentMetadata {
                size: 0,
                last_updated: None,
                tags: def.tags,
                priority: def.priority,
            },
            performance: SegmentPerformance::default(),
            personalization: def.personalization,
            created_at: now,
            updated_at: now,
        };

        info!(segment_id = %segment.id, name = %segment.name, "Creating segment");
        self.dirty.insert(segment.id);
        self.segments.insert(segment.id, segment.clone());
        Ok(segment)
    }

    /// Apply a partial update. Any definition change re-enqueues the
    /// segment for reconciliation.
    pub fn update(&self, id: &Uuid, patch: SegmentPatch) -> EngineResult<AudienceSegment> {
        if let Some(criteria) = &patch.criteria {
            if let Some(include) = &criteria.include {
                validate_rule_group(include)?;
            }
            if let Some(exclude) = &criteria.exclude {
                validate_rule_group(exclude)?;
            }
        }
        if let Some(name) = &patch.name {
            if name.trim().is_empty() {
                return Err(EngineError::Validation("segment name must not be empty".to_string()));
            }
        }

        let mut entry = self
            .segments
            .get_mut(id)
            .ok_or(EngineError::SegmentNotFound(*id))?;

        if let Some(name) = patch.name {
            entry.name = name;
        }
        if let Some(description) = patch.description {
            entry.description = Some(description);
        }
        if let Some(segment_type) = patch.segment_type {
            entry.segment_type = segment_type;
        }
        if let Some(status) = patch.status {
            entry.status = status;
        }
        if let Some(criteria) = patch.criteria {
            entry.criteria = criteria;
        }
        if let Some(cluster_id) = patch.cluster_id {
            entry.cluster_id = cluster_id;
        }
        if let Some(patterns) = patch.behavioral_patterns {
            entry.behavioral_patterns = patterns;
        }
        if let Some(config) = patch.config {
            entry.config = config;
        }
        if let Some(tags) = patch.tags {
            entry.metadata.tags = tags;
        }
        if let Some(priority) = patch.priority {
            entry.metadata.priority = priority;
        }
        if let Some(personalization) = patch.personalization {
            entry.personalization = personalization;
        }
        entry.updated_at = Utc::now();

        info!(segment_id = %id, "Updated segment definition");
        self.dirty.insert(*id);
        Ok(entry.clone())
    }

    /// Remove a segment, returning the removed definition. Membership
    /// cascade is the engine's responsibility.
    pub fn delete(&self, id: &Uuid) -> EngineResult<AudienceSegment> {
        let (_, segment) = self
            .segments
            .remove(id)
            .ok_or(EngineError::SegmentNotFound(*id))?;
        self.dirty.remove(id);
        info!(segment_id = %id, name = %segment.name, "Deleted segment");
        Ok(segment)
    }

    pub fn get(&self, id: &Uuid) -> Option<AudienceSegment> {
        self.segments.get(id).map(|s| s.clone())
    }

    pub fn contains(&self, id: &Uuid) -> bool {
        self.segments.contains_key(id)
    }

    pub fn list(&self) -> Vec<AudienceSegment> {
        self.segments.iter().map(|s| s.value().clone()).collect()
    }

    /// Write back reconciliation results without re-enqueueing the
    /// segment — size/timestamp changes are not definition mutations.
    pub fn set_runtime_metadata(
        &self,
        id: &Uuid,
        size: u64,
        last_updated: chrono::DateTime<Utc>,
    ) -> bool {
        match self.segments.get_mut(id) {
            Some(mut entry) => {
                entry.metadata.size = size;
                entry.metadata.last_updated = Some(last_updated);
                true
            }
            None => false,
        }
    }

    pub fn mark_dirty(&self, id: Uuid) {
        self.dirty.insert(id);
    }

    /// Safety-net refresh: every active, auto-updating segment becomes
    /// dirty regardless of whether anything changed.
    pub fn mark_all_auto_dirty(&self) -> usize {
        let mut marked = 0;
        for entry in self.segments.iter() {
            let segment = entry.value();
            if segment.status == SegmentStatus::Active && segment.config.auto_update {
                self.dirty.insert(segment.id);
                marked += 1;
            }
        }
        marked
    }

    /// Snapshot of pending ids. Entries are only cleared via
    /// `clear_dirty` after a successful pass, so failures retry on the
    /// next drain.
    pub fn dirty_snapshot(&self) -> Vec<Uuid> {
        self.dirty.iter().map(|id| *id).collect()
    }

    pub fn clear_dirty(&self, id: &Uuid) {
        self.dirty.remove(id);
    }

    pub fn dirty_len(&self) -> usize {
        self.dirty.len()
    }

    /// Replace all definitions from an exported state. The dirty queue
    /// is cleared; the host decides what to re-enqueue after import.
    pub fn load(&self, segments: Vec<AudienceSegment>) {
        self.segments.clear();
        self.dirty.clear();
        for segment in segments {
            self.segments.insert(segment.id, segment);
        }
    }
}

fn validate_definition(def: &SegmentDefinition) -> EngineResult<()> {
    if def.name.trim().is_empty() {
        return Err(EngineError::Validation("segment name must not be empty".to_string()));
    }
    if def.config.update_frequency_secs == 0 {
        return Err(EngineError::Validation(
            "update_frequency_secs must be positive".to_string(),
        ));
    }
    if let Some(include) = &def.criteria.include {
        validate_rule_group(include)?;
    }
    if let Some(exclude) = &def.criteria.exclude {
        validate_rule_group(exclude)?;
    }
    Ok(())
}
