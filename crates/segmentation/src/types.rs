//! Segment definitions, the rule DSL, and the records the engine produces
//! (clusters, behavioral patterns, memberships, diffs).

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

// ─── Rule DSL ────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogicalOperator {
    And,
    Or,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RuleOperator {
    Equals,
    NotEquals,
    GreaterThan,
    LessThan,
    GreaterEqual,
    LessEqual,
    Contains,
    NotContains,
    In,
    NotIn,
    Between,
    IsNull,
    IsNotNull,
}

/// Atomic comparison on a donor field. `field` is a dotted path with
/// optional bracket indexing (`donations[0].amount`) or one of the
/// computed fields `total_donated`, `donation_count`,
/// `days_since_last_donation`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Rule {
    pub field: String,
    pub operator: RuleOperator,
    pub value: serde_json::Value,
}

/// Flat AND/OR combination of rules. An empty `rules` list is "no
/// constraint" and evaluates to true under either operator.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuleGroup {
    pub rules: Vec<Rule>,
    pub logical_operator: LogicalOperator,
}

impl RuleGroup {
    pub fn all(rules: Vec<Rule>) -> Self {
        Self {
            rules,
            logical_operator: LogicalOperator::And,
        }
    }

    pub fn any(rules: Vec<Rule>) -> Self {
        Self {
            rules,
            logical_operator: LogicalOperator::Or,
        }
    }
}

/// Include/exclude rule-group pair. Overall qualification is
/// `include AND NOT exclude`; an absent group is no constraint.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SegmentCriteria {
    pub include: Option<RuleGroup>,
    pub exclude: Option<RuleGroup>,
}

// ─── Segments ────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SegmentType {
    Static,
    Dynamic,
    Predictive,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SegmentStatus {
    Active,
    Paused,
    Archived,
}

/// What to do when an upstream import produces duplicate donor rows.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DuplicateHandling {
    #[default]
    Skip,
    Replace,
    Merge,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SegmentConfig {
    /// Desired refresh cadence for this segment, in seconds.
    pub update_frequency_secs: u64,
    pub auto_update: bool,
    pub duplicate_handling: DuplicateHandling,
}

impl Default for SegmentConfig {
    fn default() -> Self {
        Self {
            update_frequency_secs: 3600,
            auto_update: true,
            duplicate_handling: DuplicateHandling::default(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SegmentMetadata {
    /// Count of currently-active memberships. Restored after every
    /// reconciliation cycle; may lag mid-cycle.
    pub size: u64,
    pub last_updated: Option<DateTime<Utc>>,
    pub tags: Vec<String>,
    pub priority: u32,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SegmentPerformance {
    pub conversion_rate: f64,
    pub engagement_rate: f64,
    pub revenue_per_donor: f64,
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct PersonalizationFlags {
    pub personalized_content: bool,
    pub personalized_timing: bool,
}

/// A named, criteria-defined subset of the donor population.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AudienceSegment {
    pub id: Uuid,
    pub name: String,
    pub description: Option<String>,
    pub segment_type: SegmentType,
    pub status: SegmentStatus,
    pub criteria: SegmentCriteria,
    /// When set, members must additionally belong to this cluster in the
    /// most recent clustering run.
    pub cluster_id: Option<Uuid>,
    /// When non-empty, members must exhibit at least one of these
    /// behavioral pattern ids.
    pub behavioral_patterns: Vec<String>,
    pub config: SegmentConfig,
    pub metadata: SegmentMetadata,
    pub performance: SegmentPerformance,
    pub personalization: PersonalizationFlags,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Caller-supplied definition for creating a segment.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SegmentDefinition {
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    pub segment_type: SegmentType,
    #[serde(default)]
    pub criteria: SegmentCriteria,
    #[serde(default)]
    pub cluster_id: Option<Uuid>,
    #[serde(default)]
    pub behavioral_patterns: Vec<String>,
    #[serde(default)]
    pub config: SegmentConfig,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub priority: u32,
    #[serde(default)]
    pub personalization: PersonalizationFlags,
}

/// Partial update to an existing segment. Unset fields are left alone.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SegmentPatch {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub segment_type: Option<SegmentType>,
    #[serde(default)]
    pub status: Option<SegmentStatus>,
    #[serde(default)]
    pub criteria: Option<SegmentCriteria>,
    /// `Some(None)` clears the cluster gate.
    #[serde(default)]
    pub cluster_id: Option<Option<Uuid>>,
    #[serde(default)]
    pub behavioral_patterns: Option<Vec<String>>,
    #[serde(default)]
    pub config: Option<SegmentConfig>,
    #[serde(default)]
    pub tags: Option<Vec<String>>,
    #[serde(default)]
    pub priority: Option<u32>,
    #[serde(default)]
    pub personalization: Option<PersonalizationFlags>,
}

// ─── Clustering ──────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ClusteringAlgorithm {
    KMeans,
    Hierarchical,
    DensityBased,
}

impl ClusteringAlgorithm {
    pub fn as_tag(&self) -> &'static str {
        match self {
            ClusteringAlgorithm::KMeans => "k_means",
            ClusteringAlgorithm::Hierarchical => "hierarchical",
            ClusteringAlgorithm::DensityBased => "density_based",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClusteringConfig {
    pub algorithm: ClusteringAlgorithm,
    pub num_clusters: usize,
    pub features: Vec<String>,
    pub normalize_features: bool,
    #[serde(default)]
    pub max_iterations: Option<u32>,
    #[serde(default)]
    pub tolerance: Option<f64>,
    /// Fixed seed for deterministic centroid initialization.
    #[serde(default)]
    pub random_seed: Option<u64>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ClusterCharacteristics {
    pub avg_donation_amount: f64,
    /// Mean donations per 30-day month across members.
    pub avg_donation_frequency: f64,
    pub avg_engagement_score: f64,
}

/// An unsupervised grouping of donors in normalized feature space.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DonorCluster {
    pub id: Uuid,
    pub algorithm: ClusteringAlgorithm,
    pub features: Vec<String>,
    /// One component per entry in `features`.
    pub centroid: Vec<f64>,
    pub member_count: u64,
    pub characteristics: ClusterCharacteristics,
    pub insights: Vec<String>,
    pub recommended_actions: Vec<String>,
    pub created_at: DateTime<Utc>,
}

/// A donor's placement in a clustering run, with the Euclidean distance
/// to the assigned centroid in normalized space.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClusterAssignment {
    pub cluster_id: Uuid,
    pub distance: f64,
}

/// Output of one clustering invocation. A new run replaces the previous
/// run for the same algorithm wholesale.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClusteringRun {
    pub algorithm: ClusteringAlgorithm,
    pub executed_at: DateTime<Utc>,
    pub clusters: Vec<DonorCluster>,
    pub assignments: HashMap<String, ClusterAssignment>,
}

// ─── Behavioral patterns ─────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PatternType {
    DonationFrequency,
    EngagementLevel,
    ChannelPreference,
    CampaignResponse,
    DonationAmount,
}

impl PatternType {
    /// Stable id tag, donor-independent so segment-required pattern id
    /// sets match across the population.
    pub fn as_tag(&self) -> &'static str {
        match self {
            PatternType::DonationFrequency => "donation_frequency",
            PatternType::EngagementLevel => "engagement_level",
            PatternType::ChannelPreference => "channel_preference",
            PatternType::CampaignResponse => "campaign_response",
            PatternType::DonationAmount => "donation_amount",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Trend {
    Increasing,
    Decreasing,
    Stable,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PatternMetrics {
    /// Qualifying events per 30-day month.
    pub frequency: Option<f64>,
    /// Days since the most recent qualifying event.
    pub recency: Option<f64>,
    pub monetary: Option<f64>,
    pub trend: Option<Trend>,
    /// 0..1, higher is steadier.
    pub consistency: Option<f64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PatternThresholds {
    pub high: f64,
    pub medium: f64,
    pub low: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimeFrame {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    pub window_days: i64,
}

/// A statistical summary of a donor's activity over a time window,
/// scored against thresholds calibrated to the donor's own history.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BehavioralPattern {
    pub id: String,
    pub pattern_type: PatternType,
    pub timeframe: TimeFrame,
    pub metrics: PatternMetrics,
    pub thresholds: PatternThresholds,
    /// In (0, 1]; decays as the underlying signal goes stale.
    pub weight: f64,
    pub details: serde_json::Value,
}

// ─── Memberships & diffs ─────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MembershipSource {
    Rules,
    MlClustering,
    Prediction,
}

/// The fact that a donor currently qualifies for a segment.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SegmentMembership {
    pub donor_id: String,
    pub segment_id: Uuid,
    pub joined_at: DateTime<Utc>,
    pub confidence: f64,
    pub source: MembershipSource,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeType {
    Added,
    Removed,
}

/// Immutable diff record from one reconciliation cycle.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SegmentUpdate {
    pub id: Uuid,
    pub segment_id: Uuid,
    pub change_type: ChangeType,
    pub donor_ids: Vec<String>,
    pub reason: String,
    pub timestamp: DateTime<Utc>,
}
