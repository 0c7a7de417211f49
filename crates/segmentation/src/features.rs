//! Feature extraction — converts donor records into named numeric
//! vectors for clustering, plus min-max batch normalization.

use chrono::{DateTime, Utc};

use donorpulse_core::types::Donor;
use donorpulse_core::{EngineError, EngineResult};

/// The fixed registry of extractable features.
pub const FEATURE_NAMES: [&str; 7] = [
    "total_donated",
    "donation_count",
    "avg_donation_amount",
    "days_since_first_donation",
    "days_since_last_donation",
    "engagement_score",
    "age",
];

pub fn is_known_feature(name: &str) -> bool {
    FEATURE_NAMES.contains(&name)
}

#[derive(Debug, Default)]
pub struct FeatureExtractor;

impl FeatureExtractor {
    pub fn new() -> Self {
        Self
    }

    /// Extract the requested features for one donor, in request order.
    /// Unknown feature names are a validation error.
    pub fn extract(
        &self,
        donor: &Donor,
        features: &[String],
        as_of: DateTime<Utc>,
    ) -> EngineResult<Vec<f64>> {
        features
            .iter()
            .map(|name| {
                feature_value(donor, name, as_of)
                    .ok_or_else(|| EngineError::Validation(format!("unknown feature '{name}'")))
            })
            .collect()
    }

    /// Extract one vector per donor for a whole batch.
    pub fn extract_batch(
        &self,
        donors: &[Donor],
        features: &[String],
        as_of: DateTime<Utc>,
    ) -> EngineResult<Vec<Vec<f64>>> {
        donors
            .iter()
            .map(|d| self.extract(d, features, as_of))
            .collect()
    }
}

fn feature_value(donor: &Donor, name: &str, as_of: DateTime<Utc>) -> Option<f64> {
    let value = match name {
        "total_donated" => donor.total_donated(),
        "donation_count" => donor.donation_count() as f64,
        "avg_donation_amount" => {
            if donor.donations.is_empty() {
                0.0
            } else {
                donor.total_donated() / donor.donations.len() as f64
            }
        }
        "days_since_first_donation" => donor
            .first_donation_date()
            .map(|d| (as_of - d).num_days().max(0) as f64)
            .unwrap_or(0.0),
        "days_since_last_donation" => donor
            .last_donation_date()
            .map(|d| (as_of - d).num_days().max(0) as f64)
            .unwrap_or(0.0),
        "engagement_score" => engagement_score(donor, as_of),
        "age" => donor.demographics.age.map(|a| a as f64).unwrap_or(0.0),
        _ => return None,
    };
    Some(value)
}

/// Composite engagement score in [0, 100]: giving recency, giving
/// frequency, and outreach response rate, deterministic over the donor
/// snapshot.
pub fn engagement_score(donor: &Donor, as_of: DateTime<Utc>) -> f64 {
    let recency = donor
        .last_donation_date()
        .map(|d| {
            let days = (as_of - d).num_days().max(0) as f64;
            (1.0 - days / 365.0).max(0.0)
        })
        .unwrap_or(0.0);

    let frequency = (donor.donation_count() as f64 / 12.0).min(1.0);

    let response_rate = if donor.interactions.is_empty() {
        0.0
    } else {
        donor.interactions.iter().filter(|i| i.responded).count() as f64
            / donor.interactions.len() as f64
    };

    100.0 * (0.4 * recency + 0.3 * frequency + 0.3 * response_rate)
}

/// Min-max scaler fit on a batch of feature vectors. Features with zero
/// range are held constant at 0.
#[derive(Debug, Clone)]
pub struct Normalizer {
    mins: Vec<f64>,
    maxs: Vec<f64>,
}

impl Normalizer {
    pub fn fit(rows: &[Vec<f64>]) -> Self {
        let dims = rows.first().map(|r| r.len()).unwrap_or(0);
        let mut mins = vec![f64::INFINITY; dims];
        let mut maxs = vec![f64::NEG_INFINITY; dims];
        for row in rows {
            for (i, v) in row.iter().enumerate() {
                if *v < mins[i] {
                    mins[i] = *v;
                }
                if *v > maxs[i] {
                    maxs[i] = *v;
                }
            }
        }
        Self { mins, maxs }
    }

    pub fn transform(&self, row: &[f64]) -> Vec<f64> {
        row.iter()
            .enumerate()
            .map(|(i, v)| {
                let range = self.maxs[i] - self.mins[i];
                if range > 0.0 {
                    (v - self.mins[i]) / range
                } else {
                    0.0
                }
            })
            .collect()
    }

    pub fn fit_transform(rows: &[Vec<f64>]) -> Vec<Vec<f64>> {
        let scaler = Self::fit(rows);
        rows.iter().map(|r| scaler.transform(r)).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use donorpulse_core::types::{Channel, Demographics, Donation, Interaction, InteractionKind};

    fn donor(amounts: &[f64], age: Option<u32>) -> Donor {
        let now = Utc::now();
        Donor {
            id: "d-1".to_string(),
            name: None,
            email: None,
            donations: amounts
                .iter()
                .enumerate()
                .map(|(i, a)| Donation {
                    amount: *a,
                    date: now - Duration::days(30 * (i as i64 + 1)),
                    campaign_id: None,
                    channel: Some(Channel::Email),
                })
                .collect(),
            interactions: Vec::new(),
            demographics: Demographics {
                age,
                region: None,
                joined_at: None,
            },
            attributes: std::collections::HashMap::new(),
        }
    }

    #[test]
    fn test_extract_known_features() {
        let extractor = FeatureExtractor::new();
        let d = donor(&[100.0, 300.0], Some(50));
        let features: Vec<String> = ["total_donated", "avg_donation_amount", "age"]
            .iter()
            .map(|s| s.to_string())
            .collect();

        let vector = extractor.extract(&d, &features, Utc::now()).unwrap();
        assert_eq!(vector, vec![400.0, 200.0, 50.0]);
    }

    #[test]
    fn test_unknown_feature_rejected() {
        let extractor = FeatureExtractor::new();
        let d = donor(&[100.0], None);
        let result = extractor.extract(&d, &["shoe_size".to_string()], Utc::now());
        assert!(result.is_err());
    }

    #[test]
    fn test_engagement_score_is_deterministic_and_bounded() {
        let now = Utc::now();
        let mut d = donor(&[100.0, 50.0, 75.0], Some(30));
        d.interactions = vec![
            Interaction {
                kind: InteractionKind::EmailOpen,
                channel: Channel::Email,
                occurred_at: now - Duration::days(5),
                campaign_id: None,
                responded: true,
            },
            Interaction {
                kind: InteractionKind::EmailOpen,
                channel: Channel::Email,
                occurred_at: now - Duration::days(10),
                campaign_id: None,
                responded: false,
            },
        ];

        let score = engagement_score(&d, now);
        assert!(score > 0.0 && score <= 100.0);
        assert_eq!(score, engagement_score(&d, now));
    }

    #[test]
    fn test_normalizer_scales_to_unit_range() {
        let rows = vec![vec![0.0, 10.0], vec![5.0, 20.0], vec![10.0, 30.0]];
        let scaled = Normalizer::fit_transform(&rows);
        assert_eq!(scaled[0], vec![0.0, 0.0]);
        assert_eq!(scaled[1], vec![0.5, 0.5]);
        assert_eq!(scaled[2], vec![1.0, 1.0]);
    }

    #[test]
    fn test_normalizer_zero_range_held_at_zero() {
        let rows = vec![vec![7.0, 1.0], vec![7.0, 2.0]];
        let scaled = Normalizer::fit_transform(&rows);
        assert_eq!(scaled[0][0], 0.0);
        assert_eq!(scaled[1][0], 0.0);
    }
}
