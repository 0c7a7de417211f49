//! Shared domain types — the donor model consumed by the segmentation
//! engine and the alert records it emits.
//!
//! Donor records are supplied by an external repository and are read-only
//! inputs; the engine never mutates them.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Channel through which a donor gave or was contacted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Channel {
    Email,
    Sms,
    Phone,
    DirectMail,
    Social,
    Web,
    Event,
}

impl Channel {
    pub fn display_name(&self) -> &'static str {
        match self {
            Channel::Email => "Email",
            Channel::Sms => "SMS",
            Channel::Phone => "Phone",
            Channel::DirectMail => "Direct Mail",
            Channel::Social => "Social",
            Channel::Web => "Web",
            Channel::Event => "Event",
        }
    }
}

/// A single gift in a donor's giving history.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Donation {
    pub amount: f64,
    pub date: DateTime<Utc>,
    pub campaign_id: Option<String>,
    pub channel: Option<Channel>,
}

/// Kind of non-gift touchpoint recorded for a donor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InteractionKind {
    EmailOpen,
    EmailClick,
    WebsiteVisit,
    EventAttendance,
    Call,
    Survey,
    SocialEngagement,
}

/// A recorded touchpoint between the organization and a donor.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Interaction {
    pub kind: InteractionKind,
    pub channel: Channel,
    pub occurred_at: DateTime<Utc>,
    pub campaign_id: Option<String>,
    /// Whether the donor responded to the outreach (clicked, replied,
    /// attended, donated in response).
    pub responded: bool,
}

/// Optional demographic fields attached to a donor record.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Demographics {
    pub age: Option<u32>,
    pub region: Option<String>,
    pub joined_at: Option<DateTime<Utc>>,
}

/// A donor record as handed over by the donor repository.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Donor {
    pub id: String,
    pub name: Option<String>,
    pub email: Option<String>,
    #[serde(default)]
    pub donations: Vec<Donation>,
    #[serde(default)]
    pub interactions: Vec<Interaction>,
    #[serde(default)]
    pub demographics: Demographics,
    /// Open attribute bag for rule-path access to fields the engine does
    /// not model explicitly.
    #[serde(default)]
    pub attributes: HashMap<String, serde_json::Value>,
}

impl Donor {
    pub fn total_donated(&self) -> f64 {
        self.donations.iter().map(|d| d.amount).sum()
    }

    pub fn donation_count(&self) -> usize {
        self.donations.len()
    }

    pub fn first_donation_date(&self) -> Option<DateTime<Utc>> {
        self.donations.iter().map(|d| d.date).min()
    }

    pub fn last_donation_date(&self) -> Option<DateTime<Utc>> {
        self.donations.iter().map(|d| d.date).max()
    }
}

/// Read-only source of donor snapshots. The batch returned by one call
/// must be internally consistent — no torn reads mixing donor states from
/// different points in time.
pub trait DonorRepository: Send + Sync {
    fn snapshot(&self) -> Vec<Donor>;
}

/// In-memory repository used by tests and the demo binary.
#[derive(Default)]
pub struct InMemoryDonorRepository {
    donors: std::sync::RwLock<Vec<Donor>>,
}

impl InMemoryDonorRepository {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_donors(donors: Vec<Donor>) -> Self {
        Self {
            donors: std::sync::RwLock::new(donors),
        }
    }

    pub fn upsert(&self, donor: Donor) {
        let mut donors = self.donors.write().expect("donor repository poisoned");
        match donors.iter_mut().find(|d| d.id == donor.id) {
            Some(existing) => *existing = donor,
            None => donors.push(donor),
        }
    }
}

impl DonorRepository for InMemoryDonorRepository {
    fn snapshot(&self) -> Vec<Donor> {
        self.donors.read().expect("donor repository poisoned").clone()
    }
}

/// Category of segment alert.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertType {
    SizeChange,
    ReconciliationFailure,
}

/// How urgently an alert should be acted on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertSeverity {
    Low,
    Medium,
    High,
}

/// Alert raised when segment membership churn crosses thresholds or a
/// reconciliation pass fails. Append-only; drained by external consumers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SegmentAlert {
    pub id: Uuid,
    pub segment_id: Uuid,
    pub alert_type: AlertType,
    pub severity: AlertSeverity,
    pub message: String,
    pub details: serde_json::Value,
    pub action_required: bool,
    pub created_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn donor_with_amounts(amounts: &[f64]) -> Donor {
        Donor {
            id: "d-1".to_string(),
            name: None,
            email: None,
            donations: amounts
                .iter()
                .enumerate()
                .map(|(i, a)| Donation {
                    amount: *a,
                    date: Utc::now() - chrono::Duration::days(i as i64 * 30),
                    campaign_id: None,
                    channel: None,
                })
                .collect(),
            interactions: Vec::new(),
            demographics: Demographics::default(),
            attributes: HashMap::new(),
        }
    }

    #[test]
    fn test_donor_aggregates() {
        let donor = donor_with_amounts(&[500.0, 700.0]);
        assert_eq!(donor.total_donated(), 1200.0);
        assert_eq!(donor.donation_count(), 2);
        assert!(donor.last_donation_date().unwrap() > donor.first_donation_date().unwrap());
    }

    #[test]
    fn test_in_memory_repository_upsert() {
        let repo = InMemoryDonorRepository::new();
        repo.upsert(donor_with_amounts(&[100.0]));
        repo.upsert(donor_with_amounts(&[100.0, 200.0]));

        let snapshot = repo.snapshot();
        assert_eq!(snapshot.len(), 1);
        assert_eq!(snapshot[0].donation_count(), 2);
    }
}
