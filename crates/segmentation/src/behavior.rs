//! Behavioral pattern analysis — time-windowed statistics over a
//! donor's giving and interaction history, scored against thresholds
//! calibrated to the donor's own behavior.

use chrono::{DateTime, Utc};

use donorpulse_core::config::BehaviorConfig;
use donorpulse_core::types::{Channel, Donor};

use crate::types::{
    BehavioralPattern, PatternMetrics, PatternThresholds, PatternType, TimeFrame, Trend,
};

pub struct BehavioralAnalyzer {
    config: BehaviorConfig,
}

impl BehavioralAnalyzer {
    pub fn new(config: BehaviorConfig) -> Self {
        Self { config }
    }

    /// Compute all patterns the donor's history supports. A pattern with
    /// fewer than `minimum_activity` qualifying events in the long
    /// window is omitted entirely.
    pub fn analyze(&self, donor: &Donor, as_of: DateTime<Utc>) -> Vec<BehavioralPattern> {
        let mut patterns = Vec::new();
        if let Some(p) = self.donation_frequency(donor, as_of) {
            patterns.push(p);
        }
        if let Some(p) = self.donation_amount(donor, as_of) {
            patterns.push(p);
        }
        if let Some(p) = self.engagement_level(donor, as_of) {
            patterns.push(p);
        }
        if let Some(p) = self.channel_preference(donor, as_of) {
            patterns.push(p);
        }
        if let Some(p) = self.campaign_response(donor, as_of) {
            patterns.push(p);
        }
        patterns
    }

    fn pattern(
        &self,
        pattern_type: PatternType,
        as_of: DateTime<Utc>,
        window_days: i64,
        metrics: PatternMetrics,
        calibration: f64,
        details: serde_json::Value,
    ) -> BehavioralPattern {
        let recency_days = metrics.recency.unwrap_or(0.0);
        BehavioralPattern {
            id: pattern_type.as_tag().to_string(),
            pattern_type,
            timeframe: TimeFrame {
                start: as_of - chrono::Duration::days(window_days),
                end: as_of,
                window_days,
            },
            metrics,
            thresholds: derive_thresholds(calibration),
            weight: decay_weight(self.config.weight_decay, recency_days),
            details,
        }
    }

    /// The donation-behavior pattern: cadence, monetary volume, trend,
    /// and steadiness of gift amounts inside the long window.
    fn donation_frequency(&self, donor: &Donor, as_of: DateTime<Utc>) -> Option<BehavioralPattern> {
        let cutoff = as_of - chrono::Duration::days(self.config.long_window_days);
        let mut qualifying: Vec<(DateTime<Utc>, f64)> = donor
            .donations
            .iter()
            .filter(|d| d.date >= cutoff && d.date <= as_of)
            .map(|d| (d.date, d.amount))
            .collect();
        if qualifying.len() < self.config.minimum_activity {
            return None;
        }
        qualifying.sort_by_key(|(date, _)| std::cmp::Reverse(*date));

        let amounts: Vec<f64> = qualifying.iter().map(|(_, a)| *a).collect();
        let monetary: f64 = amounts.iter().sum();
        let oldest = qualifying.last().map(|(d, _)| *d)?;
        let span_days = (as_of - oldest).num_days().max(1) as f64;
        let frequency = qualifying.len() as f64 / span_days * 30.0;
        let recency = (as_of - qualifying[0].0).num_days().max(0) as f64;

        let metrics = PatternMetrics {
            frequency: Some(frequency),
            recency: Some(recency),
            monetary: Some(monetary),
            trend: Some(trend_of(&amounts)),
            consistency: Some(consistency_of(&amounts)),
        };
        Some(self.pattern(
            PatternType::DonationFrequency,
            as_of,
            self.config.long_window_days,
            metrics,
            frequency,
            serde_json::json!({ "qualifying_donations": qualifying.len() }),
        ))
    }

    /// Gift-size analogue of the donation pattern: monetary is the mean
    /// gift, thresholds calibrate to it.
    fn donation_amount(&self, donor: &Donor, as_of: DateTime<Utc>) -> Option<BehavioralPattern> {
        let cutoff = as_of - chrono::Duration::days(self.config.long_window_days);
        let mut qualifying: Vec<(DateTime<Utc>, f64)> = donor
            .donations
            .iter()
            .filter(|d| d.date >= cutoff && d.date <= as_of)
            .map(|d| (d.date, d.amount))
            .collect();
        if qualifying.len() < self.config.minimum_activity {
            return None;
        }
        qualifying.sort_by_key(|(date, _)| std::cmp::Reverse(*date));

        let amounts: Vec<f64> = qualifying.iter().map(|(_, a)| *a).collect();
        let mean_gift = amounts.iter().sum::<f64>() / amounts.len() as f64;
        let recency = (as_of - qualifying[0].0).num_days().max(0) as f64;

        let metrics = PatternMetrics {
            frequency: None,
            recency: Some(recency),
            monetary: Some(mean_gift),
            trend: Some(trend_of(&amounts)),
            consistency: Some(consistency_of(&amounts)),
        };
        Some(self.pattern(
            PatternType::DonationAmount,
            as_of,
            self.config.long_window_days,
            metrics,
            mean_gift,
            serde_json::json!({ "mean_gift": mean_gift }),
        ))
    }

    /// Interaction cadence inside the medium window; consistency comes
    /// from the variability of gaps between touchpoints.
    fn engagement_level(&self, donor: &Donor, as_of: DateTime<Utc>) -> Option<BehavioralPattern> {
        let cutoff = as_of - chrono::Duration::days(self.config.medium_window_days);
        let mut events: Vec<DateTime<Utc>> = donor
            .interactions
            .iter()
            .filter(|i| i.occurred_at >= cutoff && i.occurred_at <= as_of)
            .map(|i| i.occurred_at)
            .collect();
        if events.len() < self.config.minimum_activity {
            return None;
        }
        events.sort_by_key(|d| std::cmp::Reverse(*d));

        let span_days = (as_of - *events.last()?).num_days().max(1) as f64;
        let frequency = events.len() as f64 / span_days * 30.0;
        let recency = (as_of - events[0]).num_days().max(0) as f64;

        let gaps: Vec<f64> = events
            .windows(2)
            .map(|w| (w[0] - w[1]).num_days().max(0) as f64)
            .collect();
        let consistency = if gaps.is_empty() { 0.0 } else { consistency_of(&gaps) };

        // Trend from event volume: the short window against the rest of
        // the medium window, scaled to a per-day rate.
        let midpoint = as_of - chrono::Duration::days(self.config.short_window_days);
        let recent_count = events.iter().filter(|d| **d >= midpoint).count() as f64;
        let older_count = events.len() as f64 - recent_count;
        let recent_rate = recent_count / self.config.short_window_days.max(1) as f64;
        let older_rate = older_count
            / (self.config.medium_window_days - self.config.short_window_days).max(1) as f64;
        let trend = ratio_trend(recent_rate, older_rate);

        let metrics = PatternMetrics {
            frequency: Some(frequency),
            recency: Some(recency),
            monetary: None,
            trend: Some(trend),
            consistency: Some(consistency),
        };
        Some(self.pattern(
            PatternType::EngagementLevel,
            as_of,
            self.config.medium_window_days,
            metrics,
            frequency,
            serde_json::json!({ "interactions": events.len() }),
        ))
    }

    /// Dominant contact channel across gifts and touchpoints; the
    /// dominant share doubles as the consistency score.
    fn channel_preference(&self, donor: &Donor, as_of: DateTime<Utc>) -> Option<BehavioralPattern> {
        let cutoff = as_of - chrono::Duration::days(self.config.long_window_days);
        let mut events: Vec<(DateTime<Utc>, Channel)> = donor
            .donations
            .iter()
            .filter(|d| d.date >= cutoff && d.date <= as_of)
            .filter_map(|d| d.channel.map(|c| (d.date, c)))
            .collect();
        events.extend(
            donor
                .interactions
                .iter()
                .filter(|i| i.occurred_at >= cutoff && i.occurred_at <= as_of)
                .map(|i| (i.occurred_at, i.channel)),
        );
        if events.len() < self.config.minimum_activity {
            return None;
        }

        let mut counts: std::collections::HashMap<Channel, usize> = std::collections::HashMap::new();
        for (_, channel) in &events {
            *counts.entry(*channel).or_insert(0) += 1;
        }
        let (dominant, dominant_count) = counts
            .into_iter()
            .max_by(|a, b| a.1.cmp(&b.1).then_with(|| a.0.display_name().cmp(b.0.display_name())))?;
        let share = dominant_count as f64 / events.len() as f64;

        let most_recent_on_dominant = events
            .iter()
            .filter(|(_, c)| *c == dominant)
            .map(|(d, _)| *d)
            .max()?;
        let recency = (as_of - most_recent_on_dominant).num_days().max(0) as f64;
        let span_days = (as_of - events.iter().map(|(d, _)| *d).min()?).num_days().max(1) as f64;

        let metrics = PatternMetrics {
            frequency: Some(events.len() as f64 / span_days * 30.0),
            recency: Some(recency),
            monetary: None,
            trend: Some(Trend::Stable),
            consistency: Some(share),
        };
        Some(self.pattern(
            PatternType::ChannelPreference,
            as_of,
            self.config.long_window_days,
            metrics,
            share,
            serde_json::json!({ "preferred_channel": dominant, "share": share }),
        ))
    }

    /// Response behavior on campaign-linked outreach.
    fn campaign_response(&self, donor: &Donor, as_of: DateTime<Utc>) -> Option<BehavioralPattern> {
        let cutoff = as_of - chrono::Duration::days(self.config.long_window_days);
        let mut touches: Vec<(DateTime<Utc>, bool)> = donor
            .interactions
            .iter()
            .filter(|i| i.campaign_id.is_some() && i.occurred_at >= cutoff && i.occurred_at <= as_of)
            .map(|i| (i.occurred_at, i.responded))
            .collect();
        if touches.len() < self.config.minimum_activity {
            return None;
        }
        touches.sort_by_key(|(d, _)| std::cmp::Reverse(*d));

        let responses = touches.iter().filter(|(_, r)| *r).count();
        let response_rate = responses as f64 / touches.len() as f64;
        let span_days = (as_of - touches.last()?.0).num_days().max(1) as f64;
        let frequency = responses as f64 / span_days * 30.0;
        let recency = (as_of - touches[0].0).num_days().max(0) as f64;

        let mid = touches.len() / 2;
        let recent_rate = rate_of(&touches[..mid.max(1)]);
        let older_rate = rate_of(&touches[mid..]);
        let trend = ratio_trend(recent_rate, older_rate);

        let metrics = PatternMetrics {
            frequency: Some(frequency),
            recency: Some(recency),
            monetary: None,
            trend: Some(trend),
            consistency: Some(response_rate),
        };
        Some(self.pattern(
            PatternType::CampaignResponse,
            as_of,
            self.config.long_window_days,
            metrics,
            frequency,
            serde_json::json!({ "touches": touches.len(), "response_rate": response_rate }),
        ))
    }
}

fn rate_of(touches: &[(DateTime<Utc>, bool)]) -> f64 {
    if touches.is_empty() {
        return 0.0;
    }
    touches.iter().filter(|(_, r)| *r).count() as f64 / touches.len() as f64
}

/// Thresholds self-calibrate to the donor's own observed level rather
/// than fixed population constants.
fn derive_thresholds(observed: f64) -> PatternThresholds {
    PatternThresholds {
        high: observed * 1.5,
        medium: observed,
        low: observed * 0.5,
    }
}

/// Weight decays per 30 days of signal staleness, floored so a reported
/// pattern always carries some weight.
fn decay_weight(decay: f64, recency_days: f64) -> f64 {
    decay.powf(recency_days / 30.0).clamp(0.1, 1.0)
}

/// Compare the mean of the recent half against the older half of a
/// most-recent-first series.
fn trend_of(amounts: &[f64]) -> Trend {
    if amounts.len() < 2 {
        return Trend::Stable;
    }
    let mid = amounts.len() / 2;
    let recent = &amounts[..mid.max(1)];
    let older = &amounts[mid..];
    let recent_mean = recent.iter().sum::<f64>() / recent.len() as f64;
    let older_mean = older.iter().sum::<f64>() / older.len() as f64;
    ratio_trend(recent_mean, older_mean)
}

fn ratio_trend(recent: f64, older: f64) -> Trend {
    if older <= 0.0 {
        return if recent > 0.0 { Trend::Increasing } else { Trend::Stable };
    }
    let ratio = recent / older;
    if ratio > 1.10 {
        Trend::Increasing
    } else if ratio < 0.90 {
        Trend::Decreasing
    } else {
        Trend::Stable
    }
}

fn consistency_of(values: &[f64]) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    let mean = values.iter().sum::<f64>() / values.len() as f64;
    if mean <= 0.0 {
        return 0.0;
    }
    let variance =
        values.iter().map(|v| (v - mean) * (v - mean)).sum::<f64>() / values.len() as f64;
    (1.0 - variance.sqrt() / mean).max(0.0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use donorpulse_core::types::{Demographics, Donation, Interaction, InteractionKind};

    fn base_donor(id: &str) -> Donor {
        Donor {
            id: id.to_string(),
            name: None,
            email: None,
            donations: Vec::new(),
            interactions: Vec::new(),
            demographics: Demographics::default(),
            attributes: std::collections::HashMap::new(),
        }
    }

    fn donation(amount: f64, days_ago: i64, now: DateTime<Utc>) -> Donation {
        Donation {
            amount,
            date: now - Duration::days(days_ago),
            campaign_id: None,
            channel: Some(Channel::Email),
        }
    }

    fn analyzer() -> BehavioralAnalyzer {
        BehavioralAnalyzer::new(BehaviorConfig::default())
    }

    #[test]
    fn test_below_minimum_activity_yields_nothing() {
        let now = Utc::now();
        let mut donor = base_donor("quiet");
        donor.donations = vec![donation(50.0, 10, now), donation(50.0, 40, now)];
        let patterns = analyzer().analyze(&donor, now);
        assert!(patterns.iter().all(|p| p.pattern_type != PatternType::DonationFrequency));
    }

    #[test]
    fn test_donation_frequency_metrics() {
        let now = Utc::now();
        let mut donor = base_donor("steady");
        donor.donations = vec![
            donation(100.0, 10, now),
            donation(100.0, 40, now),
            donation(100.0, 70, now),
            donation(100.0, 100, now),
        ];

        let patterns = analyzer().analyze(&donor, now);
        let p = patterns
            .iter()
            .find(|p| p.pattern_type == PatternType::DonationFrequency)
            .unwrap();

        assert_eq!(p.metrics.monetary, Some(400.0));
        // 4 gifts over 100 days ≈ 1.2 per month.
        let freq = p.metrics.frequency.unwrap();
        assert!((freq - 1.2).abs() < 0.05, "frequency was {freq}");
        assert_eq!(p.metrics.recency, Some(10.0));
        assert_eq!(p.metrics.trend, Some(Trend::Stable));
        // Identical amounts are perfectly consistent.
        assert!((p.metrics.consistency.unwrap() - 1.0).abs() < 1e-9);
        assert!(p.weight > 0.0 && p.weight <= 1.0);
    }

    #[test]
    fn test_increasing_trend() {
        let now = Utc::now();
        let mut donor = base_donor("riser");
        // Recent gifts are far larger than the older half.
        donor.donations = vec![
            donation(500.0, 5, now),
            donation(450.0, 30, now),
            donation(100.0, 60, now),
            donation(90.0, 90, now),
        ];
        let patterns = analyzer().analyze(&donor, now);
        let p = patterns
            .iter()
            .find(|p| p.pattern_type == PatternType::DonationFrequency)
            .unwrap();
        assert_eq!(p.metrics.trend, Some(Trend::Increasing));
    }

    #[test]
    fn test_thresholds_self_calibrate() {
        let now = Utc::now();
        let mut donor = base_donor("cal");
        donor.donations = vec![
            donation(100.0, 15, now),
            donation(100.0, 45, now),
            donation(100.0, 75, now),
        ];
        let patterns = analyzer().analyze(&donor, now);
        let p = patterns
            .iter()
            .find(|p| p.pattern_type == PatternType::DonationFrequency)
            .unwrap();
        let freq = p.metrics.frequency.unwrap();
        assert!((p.thresholds.medium - freq).abs() < 1e-9);
        assert!((p.thresholds.high - freq * 1.5).abs() < 1e-9);
        assert!((p.thresholds.low - freq * 0.5).abs() < 1e-9);
    }

    #[test]
    fn test_channel_preference_dominant_share() {
        let now = Utc::now();
        let mut donor = base_donor("mailer");
        for days_ago in [5, 25, 45, 65] {
            donor.interactions.push(Interaction {
                kind: InteractionKind::EmailOpen,
                channel: Channel::Email,
                occurred_at: now - Duration::days(days_ago),
                campaign_id: None,
                responded: false,
            });
        }
        donor.interactions.push(Interaction {
            kind: InteractionKind::Call,
            channel: Channel::Phone,
            occurred_at: now - Duration::days(15),
            campaign_id: None,
            responded: true,
        });

        let patterns = analyzer().analyze(&donor, now);
        let p = patterns
            .iter()
            .find(|p| p.pattern_type == PatternType::ChannelPreference)
            .unwrap();
        assert_eq!(p.details["preferred_channel"], serde_json::json!("email"));
        assert!((p.metrics.consistency.unwrap() - 0.8).abs() < 1e-9);
    }

    #[test]
    fn test_campaign_response_rate() {
        let now = Utc::now();
        let mut donor = base_donor("responder");
        for (days_ago, responded) in [(5, true), (35, true), (65, false), (95, true)] {
            donor.interactions.push(Interaction {
                kind: InteractionKind::EmailClick,
                channel: Channel::Email,
                occurred_at: now - Duration::days(days_ago),
                campaign_id: Some("spring-appeal".to_string()),
                responded,
            });
        }

        let patterns = analyzer().analyze(&donor, now);
        let p = patterns
            .iter()
            .find(|p| p.pattern_type == PatternType::CampaignResponse)
            .unwrap();
        assert!((p.metrics.consistency.unwrap() - 0.75).abs() < 1e-9);
    }

    #[test]
    fn test_analysis_is_deterministic() {
        let now = Utc::now();
        let mut donor = base_donor("det");
        donor.donations = vec![
            donation(120.0, 10, now),
            donation(80.0, 50, now),
            donation(60.0, 90, now),
        ];
        let a = analyzer().analyze(&donor, now);
        let b = analyzer().analyze(&donor, now);
        assert_eq!(
            serde_json::to_value(&a).unwrap(),
            serde_json::to_value(&b).unwrap()
        );
    }
}
