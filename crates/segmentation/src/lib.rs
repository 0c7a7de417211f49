//! Dynamic audience segmentation engine — rule evaluation, k-means
//! clustering, behavioral pattern analysis, and incremental membership
//! reconciliation over a donor population.

pub mod alerts;
pub mod analytics;
pub mod behavior;
pub mod clustering;
pub mod engine;
pub mod features;
pub mod membership;
pub mod registry;
pub mod rules;
pub mod scheduler;
pub mod types;

pub use engine::SegmentationEngine;
pub use rules::RuleEvaluator;
pub use scheduler::UpdateScheduler;
