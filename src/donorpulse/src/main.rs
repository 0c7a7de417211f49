//! DonorPulse — dynamic audience segmentation engine for donor and
//! campaign management.
//!
//! Entry point that wires configuration, the engine, and the update
//! scheduler, then runs until interrupted. Donor data and segment
//! definitions normally arrive from the host application; with
//! `--seed-demo` a small demo population and two segments are loaded so
//! the engine has something to reconcile.

use std::sync::Arc;

use chrono::{Duration, Utc};
use clap::Parser;
use tracing::{info, warn};

use donorpulse_core::types::{
    Channel, Demographics, Donation, Donor, InMemoryDonorRepository, Interaction, InteractionKind,
};
use donorpulse_core::EngineConfig;
use donorpulse_segmentation::types::{
    Rule, RuleGroup, RuleOperator, SegmentCriteria, SegmentDefinition, SegmentType,
};
use donorpulse_segmentation::{SegmentationEngine, UpdateScheduler};

#[derive(Parser, Debug)]
#[command(name = "donorpulse")]
#[command(about = "Dynamic audience segmentation engine for donor management")]
#[command(version)]
struct Cli {
    /// Dirty-queue drain interval in seconds (overrides config)
    #[arg(long, env = "DONORPULSE__SCHEDULER__DRAIN_INTERVAL_SECS")]
    drain_interval: Option<u64>,

    /// Full-refresh interval in seconds (overrides config)
    #[arg(long, env = "DONORPULSE__SCHEDULER__FULL_REFRESH_INTERVAL_SECS")]
    refresh_interval: Option<u64>,

    /// Worker pool size for concurrent reconciliations (overrides config)
    #[arg(long, env = "DONORPULSE__SCHEDULER__MAX_CONCURRENT_RECONCILIATIONS")]
    workers: Option<usize>,

    /// Seed a demo donor population and example segments
    #[arg(long, default_value_t = false)]
    seed_demo: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "donorpulse=info".into()),
        )
        .json()
        .init();

    let cli = Cli::parse();

    info!("DonorPulse starting up");

    // Load configuration
    let mut config = EngineConfig::load().unwrap_or_else(|e| {
        warn!(error = %e, "Failed to load config, using defaults");
        EngineConfig::default()
    });

    // Apply CLI overrides
    if let Some(secs) = cli.drain_interval {
        config.scheduler.drain_interval_secs = secs;
    }
    if let Some(secs) = cli.refresh_interval {
        config.scheduler.full_refresh_interval_secs = secs;
    }
    if let Some(workers) = cli.workers {
        config.scheduler.max_concurrent_reconciliations = workers;
    }

    info!(
        drain_secs = config.scheduler.drain_interval_secs,
        refresh_secs = config.scheduler.full_refresh_interval_secs,
        workers = config.scheduler.max_concurrent_reconciliations,
        "Configuration loaded"
    );

    let engine = Arc::new(SegmentationEngine::new(config.clone()));
    let repository = Arc::new(InMemoryDonorRepository::new());

    if cli.seed_demo {
        seed_demo_data(&engine, &repository)?;
    }

    let mut scheduler = UpdateScheduler::new(engine.clone(), repository, config.scheduler);
    scheduler.start();

    // Populate freshly-seeded segments without waiting for the first tick.
    let reconciled = scheduler.drain_once().await;
    info!(reconciled, "Initial drain complete");
    for segment in engine.get_segments() {
        info!(
            segment = %segment.name,
            size = segment.metadata.size,
            "Segment populated"
        );
    }

    tokio::signal::ctrl_c().await?;
    info!("Shutdown signal received");
    scheduler.stop().await;

    Ok(())
}

/// Load a small donor population and two example segments.
fn seed_demo_data(
    engine: &SegmentationEngine,
    repository: &InMemoryDonorRepository,
) -> anyhow::Result<()> {
    let now = Utc::now();

    for i in 0..40 {
        let monthly = i % 4 == 0;
        let gift = if monthly { 75.0 } else { 40.0 + (i as f64) * 12.5 };
        let gift_count = if monthly { 10 } else { 1 + i % 3 };
        let donor = Donor {
            id: format!("demo-donor-{i:03}"),
            name: Some(format!("Demo Donor {i}")),
            email: Some(format!("donor{i}@example.org")),
            donations: (0..gift_count)
                .map(|g| Donation {
                    amount: gift,
                    date: now - Duration::days(25 * (g as i64 + 1)),
                    campaign_id: Some("annual-fund".to_string()),
                    channel: Some(if i % 2 == 0 { Channel::Email } else { Channel::Web }),
                })
                .collect(),
            interactions: vec![Interaction {
                kind: InteractionKind::EmailOpen,
                channel: Channel::Email,
                occurred_at: now - Duration::days((i % 14) as i64 + 1),
                campaign_id: Some("annual-fund".to_string()),
                responded: i % 3 == 0,
            }],
            demographics: Demographics {
                age: Some(25 + (i % 50) as u32),
                region: Some(String::from(if i % 2 == 0 { "West" } else { "East" })),
                joined_at: Some(now - Duration::days(400)),
            },
            attributes: Default::default(),
        };
        repository.upsert(donor);
    }

    engine.create_segment(SegmentDefinition {
        name: "Committed givers".to_string(),
        description: Some("At least four gifts on record".to_string()),
        segment_type: SegmentType::Dynamic,
        criteria: SegmentCriteria {
            include: Some(RuleGroup::all(vec![Rule {
                field: "donation_count".to_string(),
                operator: RuleOperator::GreaterEqual,
                value: serde_json::json!(4),
            }])),
            exclude: None,
        },
        cluster_id: None,
        behavioral_patterns: vec!["donation_frequency".to_string()],
        config: Default::default(),
        tags: vec!["stewardship".to_string()],
        priority: 1,
        personalization: Default::default(),
    })?;

    engine.create_segment(SegmentDefinition {
        name: "Lapsing donors".to_string(),
        description: Some("No gift in the last 90 days".to_string()),
        segment_type: SegmentType::Dynamic,
        criteria: SegmentCriteria {
            include: Some(RuleGroup::all(vec![Rule {
                field: "days_since_last_donation".to_string(),
                operator: RuleOperator::GreaterThan,
                value: serde_json::json!(90),
            }])),
            exclude: Some(RuleGroup::all(vec![Rule {
                field: "total_donated".to_string(),
                operator: RuleOperator::LessThan,
                value: serde_json::json!(25),
            }])),
        },
        cluster_id: None,
        behavioral_patterns: Vec::new(),
        config: Default::default(),
        tags: vec!["retention".to_string()],
        priority: 2,
        personalization: Default::default(),
    })?;

    info!("Seeded demo population and segments");
    Ok(())
}
