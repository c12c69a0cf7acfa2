//! Persisted record types for campaigns, pledges, tiers, and milestones.
//!
//! ## Status as a finite-state machine
//!
//! [`CampaignStatus`] enforces a strict forward-only lifecycle:
//!
//! ```text
//! Draft ──► Active ──► Successful
//!   │          └─────► Failed
//!   ├──► Review ──► Active
//!   └──► Cancelled
//! ```
//!
//! `Review` and `Cancelled` are pre-chain states; the reconciliation engine
//! only ever moves `Draft`/`Active` campaigns, and only forward. Terminal
//! states (`Successful`, `Failed`, `Cancelled`) admit no transitions out.

use serde::{Deserialize, Serialize};

use crate::amount::Usdc;

/// Lifecycle status of a campaign.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "snake_case")]
#[sqlx(rename_all = "snake_case")]
pub enum CampaignStatus {
    /// Created locally; may still be edited or cancelled.
    Draft,
    /// Awaiting approval; pre-chain.
    Review,
    /// Deployed on-chain and accepting pledges.
    Active,
    /// Finalized on-chain with the goal met.
    Successful,
    /// Finalized on-chain with the goal missed; refunds are claimable.
    Failed,
    /// Withdrawn before deployment; pre-chain, terminal.
    Cancelled,
}

impl CampaignStatus {
    /// Short identifier string as stored in the database.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Draft => "draft",
            Self::Review => "review",
            Self::Active => "active",
            Self::Successful => "successful",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }

    /// Statuses the reconciliation engine may move to a terminal outcome.
    pub fn reconcilable(&self) -> bool {
        matches!(self, Self::Draft | Self::Active)
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Successful | Self::Failed | Self::Cancelled)
    }

    /// Forward-only transition validity.
    pub fn can_transition_to(&self, to: CampaignStatus) -> bool {
        matches!(
            (self, to),
            (Self::Draft, Self::Review)
                | (Self::Draft, Self::Active)
                | (Self::Draft, Self::Cancelled)
                | (Self::Review, Self::Draft)
                | (Self::Review, Self::Active)
                | (Self::Review, Self::Cancelled)
                | (Self::Active, Self::Successful)
                | (Self::Active, Self::Failed)
        )
    }
}

/// Lifecycle status of a pledge.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "snake_case")]
#[sqlx(rename_all = "snake_case")]
pub enum PledgeStatus {
    /// Backed by a confirmed on-chain pledge transaction.
    Confirmed,
    /// The backer claimed a refund on a failed campaign.
    Refunded,
}

/// A campaign record as stored in / read from the database.
/// Amount columns hold micro-USDC integers.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct CampaignRecord {
    pub id: i64,
    pub creator: String,
    pub title: String,
    pub description: String,
    pub story: Option<String>,
    pub category: Option<String>,
    /// JSON-encoded string array.
    pub tags: Option<String>,
    pub cover_image: Option<String>,
    /// JSON-encoded string array.
    pub gallery: Option<String>,
    pub video_url: Option<String>,
    pub goal_amount: i64,
    pub currency: String,
    pub duration_days: i64,
    pub start_date: i64,
    pub end_date: i64,
    pub raised_amount: i64,
    pub backers_count: i64,
    pub status: CampaignStatus,
    /// The escrow contract's campaign index; null until deployed.
    /// Set at most once, immutable thereafter.
    pub blockchain_campaign_id: Option<i64>,
    pub created_at: i64,
    pub updated_at: i64,
}

impl CampaignRecord {
    pub fn goal(&self) -> Usdc {
        Usdc::from_micros(self.goal_amount)
    }

    pub fn raised(&self) -> Usdc {
        Usdc::from_micros(self.raised_amount)
    }
}

/// A pledge record as stored in / read from the database.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct PledgeRecord {
    pub id: i64,
    pub campaign_id: i64,
    pub backer: String,
    pub amount: i64,
    pub currency: String,
    pub status: PledgeStatus,
    pub tx_hash: String,
    pub block_number: i64,
    pub created_at: i64,
}

/// A reward tier; the lowest tier amount is the campaign's minimum pledge.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct TierRecord {
    pub id: i64,
    pub campaign_id: i64,
    pub title: String,
    pub description: Option<String>,
    pub amount: i64,
}

/// Informational milestone; not enforced on-chain.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct MilestoneRecord {
    pub id: i64,
    pub campaign_id: i64,
    pub title: String,
    pub description: Option<String>,
    pub target_date: Option<i64>,
}

/// Input for creating a campaign record.
#[derive(Debug, Clone)]
pub struct NewCampaign {
    pub creator: String,
    pub title: String,
    pub description: String,
    pub story: Option<String>,
    pub category: Option<String>,
    pub tags: Option<String>,
    pub cover_image: Option<String>,
    pub gallery: Option<String>,
    pub video_url: Option<String>,
    pub goal_amount: Usdc,
    pub duration_days: i64,
    pub start_date: i64,
}

#[derive(Debug, Clone)]
pub struct NewTier {
    pub title: String,
    pub description: Option<String>,
    pub amount: Usdc,
}

#[derive(Debug, Clone)]
pub struct NewMilestone {
    pub title: String,
    pub description: Option<String>,
    pub target_date: Option<i64>,
}

/// Input for recording a confirmed on-chain pledge. The amount comes from
/// the decoded chain event, never from client input.
#[derive(Debug, Clone)]
pub struct NewPledge {
    pub campaign_id: i64,
    pub backer: String,
    pub amount: Usdc,
    pub tx_hash: String,
    pub block_number: i64,
}
