//! Database layer — migrations, campaign record store, and pledge writes.
//!
//! The store is a read-optimized cache of on-chain truth: every write that
//! represents "what the chain says" is idempotent and re-derivable from a
//! fresh chain read plus recorded transaction hashes. Pledge inserts are
//! keyed on `tx_hash` so replays are no-ops, and the terminal status write
//! is a compare-and-set so concurrent reconcilers cannot double-apply.

use sqlx::{sqlite::SqlitePoolOptions, SqlitePool};
use tracing::info;

use crate::amount::Usdc;
use crate::errors::{ReconcilerError, Result};
use crate::models::{
    CampaignRecord, CampaignStatus, MilestoneRecord, NewCampaign, NewMilestone, NewPledge,
    NewTier, PledgeRecord, TierRecord,
};

/// Establish a SQLite connection pool and run pending migrations.
pub async fn init_pool(database_url: &str) -> Result<SqlitePool> {
    // Make sure the file is created if it doesn't exist yet.
    let url = if database_url.starts_with("sqlite:") {
        database_url.to_string()
    } else {
        format!("sqlite:{database_url}")
    };

    let pool = SqlitePoolOptions::new()
        .max_connections(5)
        .connect(&url)
        .await?;

    sqlx::migrate!("./migrations").run(&pool).await?;
    info!("Database migrations applied successfully");
    Ok(pool)
}

fn now() -> i64 {
    chrono::Utc::now().timestamp()
}

// ─────────────────────────────────────────────────────────
// Campaign writes
// ─────────────────────────────────────────────────────────

/// Create a DRAFT campaign together with its tiers and milestones.
pub async fn create_campaign(
    pool: &SqlitePool,
    new: &NewCampaign,
    tiers: &[NewTier],
    milestones: &[NewMilestone],
) -> Result<CampaignRecord> {
    let ts = now();
    let end_date = new.start_date + new.duration_days * 86_400;

    let mut tx = pool.begin().await?;

    let campaign_id = sqlx::query(
        r#"
        INSERT INTO campaigns
            (creator, title, description, story, category, tags, cover_image, gallery,
             video_url, goal_amount, currency, duration_days, start_date, end_date,
             raised_amount, backers_count, status, created_at, updated_at)
        VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, 'USDC', ?11, ?12, ?13, 0, 0,
                'draft', ?14, ?14)
        "#,
    )
    .bind(&new.creator)
    .bind(&new.title)
    .bind(&new.description)
    .bind(&new.story)
    .bind(&new.category)
    .bind(&new.tags)
    .bind(&new.cover_image)
    .bind(&new.gallery)
    .bind(&new.video_url)
    .bind(new.goal_amount.micros())
    .bind(new.duration_days)
    .bind(new.start_date)
    .bind(end_date)
    .bind(ts)
    .execute(&mut *tx)
    .await?
    .last_insert_rowid();

    for tier in tiers {
        sqlx::query("INSERT INTO tiers (campaign_id, title, description, amount) VALUES (?1, ?2, ?3, ?4)")
            .bind(campaign_id)
            .bind(&tier.title)
            .bind(&tier.description)
            .bind(tier.amount.micros())
            .execute(&mut *tx)
            .await?;
    }

    for milestone in milestones {
        sqlx::query(
            "INSERT INTO milestones (campaign_id, title, description, target_date) VALUES (?1, ?2, ?3, ?4)",
        )
        .bind(campaign_id)
        .bind(&milestone.title)
        .bind(&milestone.description)
        .bind(milestone.target_date)
        .execute(&mut *tx)
        .await?;
    }

    tx.commit().await?;

    get_campaign(pool, campaign_id)
        .await?
        .ok_or_else(|| ReconcilerError::NotFound(format!("campaign {campaign_id}")))
}

/// Sparse partial update of chain-derived campaign fields.
/// Fields not supplied are left untouched.
#[derive(Debug, Clone, Default)]
pub struct BlockchainUpdate {
    pub blockchain_campaign_id: Option<i64>,
    pub status: Option<CampaignStatus>,
    pub raised_amount: Option<Usdc>,
}

/// Apply a [`BlockchainUpdate`].
///
/// `blockchain_campaign_id` is set at most once: re-supplying a different id
/// is rejected, re-supplying the same id is a no-op. Attaching a chain id to
/// a campaign with no explicit status moves it DRAFT/REVIEW → ACTIVE.
pub async fn update_blockchain_data(
    pool: &SqlitePool,
    id: i64,
    update: &BlockchainUpdate,
) -> Result<CampaignRecord> {
    let current = get_campaign(pool, id)
        .await?
        .ok_or_else(|| ReconcilerError::NotFound(format!("campaign {id}")))?;

    let first_attach = update.blockchain_campaign_id.is_some()
        && current.blockchain_campaign_id.is_none();

    if let Some(chain_id) = update.blockchain_campaign_id {
        if let Some(existing) = current.blockchain_campaign_id {
            if existing != chain_id {
                return Err(ReconcilerError::Validation(format!(
                    "campaign {id} is already bound to blockchain campaign {existing}"
                )));
            }
        }
        if current.status == CampaignStatus::Cancelled {
            return Err(ReconcilerError::Validation(format!(
                "campaign {id} is cancelled and cannot be deployed"
            )));
        }
    }

    let status = match update.status {
        Some(next) => {
            if next != current.status && !current.status.can_transition_to(next) {
                return Err(ReconcilerError::Validation(format!(
                    "illegal status transition {} -> {}",
                    current.status.as_str(),
                    next.as_str()
                )));
            }
            Some(next)
        }
        None if first_attach => Some(CampaignStatus::Active),
        None => None,
    };

    sqlx::query(
        r#"
        UPDATE campaigns
        SET    blockchain_campaign_id = COALESCE(?1, blockchain_campaign_id),
               status                 = COALESCE(?2, status),
               raised_amount          = COALESCE(?3, raised_amount),
               updated_at             = ?4
        WHERE  id = ?5
        "#,
    )
    .bind(update.blockchain_campaign_id)
    .bind(status)
    .bind(update.raised_amount.map(Usdc::micros))
    .bind(now())
    .bind(id)
    .execute(pool)
    .await?;

    get_campaign(pool, id)
        .await?
        .ok_or_else(|| ReconcilerError::NotFound(format!("campaign {id}")))
}

/// Terminal compare-and-set used exclusively by the reconciliation engine.
///
/// The status is re-checked inside the statement itself, so two concurrent
/// reconcilers cannot both apply the transition. Returns `true` when this
/// call performed the write, `false` when another caller got there first.
pub async fn finalize_transition(
    pool: &SqlitePool,
    id: i64,
    status: CampaignStatus,
    raised: Usdc,
) -> Result<bool> {
    let affected = sqlx::query(
        r#"
        UPDATE campaigns
        SET    status = ?1, raised_amount = ?2, updated_at = ?3
        WHERE  id = ?4 AND status IN ('draft', 'active')
        "#,
    )
    .bind(status)
    .bind(raised.micros())
    .bind(now())
    .bind(id)
    .execute(pool)
    .await?
    .rows_affected();

    Ok(affected > 0)
}

/// Display-only refresh of `raised_amount` from an authoritative on-chain
/// total. Guarded so it never races a terminal transition.
pub async fn refresh_raised_amount(pool: &SqlitePool, id: i64, raised: Usdc) -> Result<bool> {
    let affected = sqlx::query(
        r#"
        UPDATE campaigns
        SET    raised_amount = ?1, updated_at = ?2
        WHERE  id = ?3 AND status IN ('draft', 'active') AND raised_amount != ?1
        "#,
    )
    .bind(raised.micros())
    .bind(now())
    .bind(id)
    .execute(pool)
    .await?
    .rows_affected();

    Ok(affected > 0)
}

// ─────────────────────────────────────────────────────────
// Campaign reads
// ─────────────────────────────────────────────────────────

pub async fn get_campaign(pool: &SqlitePool, id: i64) -> Result<Option<CampaignRecord>> {
    let row = sqlx::query_as::<_, CampaignRecord>("SELECT * FROM campaigns WHERE id = ?1")
        .bind(id)
        .fetch_optional(pool)
        .await?;
    Ok(row)
}

pub async fn list_campaigns(pool: &SqlitePool) -> Result<Vec<CampaignRecord>> {
    let rows = sqlx::query_as::<_, CampaignRecord>("SELECT * FROM campaigns ORDER BY id ASC")
        .fetch_all(pool)
        .await?;
    Ok(rows)
}

pub async fn list_campaigns_by_creator(
    pool: &SqlitePool,
    creator: &str,
) -> Result<Vec<CampaignRecord>> {
    let rows = sqlx::query_as::<_, CampaignRecord>(
        "SELECT * FROM campaigns WHERE creator = ?1 COLLATE NOCASE ORDER BY id ASC",
    )
    .bind(creator)
    .fetch_all(pool)
    .await?;
    Ok(rows)
}

pub async fn list_campaigns_by_backer(
    pool: &SqlitePool,
    backer: &str,
) -> Result<Vec<CampaignRecord>> {
    let rows = sqlx::query_as::<_, CampaignRecord>(
        r#"
        SELECT DISTINCT c.*
        FROM   campaigns c
        JOIN   pledges p ON p.campaign_id = c.id
        WHERE  p.backer = ?1 COLLATE NOCASE
        ORDER  BY c.id ASC
        "#,
    )
    .bind(backer)
    .fetch_all(pool)
    .await?;
    Ok(rows)
}

/// Campaigns the background sweep re-reconciles: deployed on-chain and not
/// yet terminal locally.
pub async fn list_reconcilable_campaigns(pool: &SqlitePool) -> Result<Vec<CampaignRecord>> {
    let rows = sqlx::query_as::<_, CampaignRecord>(
        r#"
        SELECT * FROM campaigns
        WHERE  blockchain_campaign_id IS NOT NULL AND status IN ('draft', 'active')
        ORDER  BY id ASC
        "#,
    )
    .fetch_all(pool)
    .await?;
    Ok(rows)
}

// ─────────────────────────────────────────────────────────
// Pledge writes
// ─────────────────────────────────────────────────────────

/// Persist a confirmed pledge and bump the campaign aggregates atomically.
///
/// The insert is keyed on `tx_hash`: a replay of an already-recorded
/// transaction leaves both the pledge table and the aggregates untouched and
/// returns `false`. The `raised_amount` bump is relative (`+= amount`) so
/// concurrent confirmations cannot lose updates.
pub async fn insert_pledge(pool: &SqlitePool, new: &NewPledge) -> Result<bool> {
    let mut tx = pool.begin().await?;

    let inserted = sqlx::query(
        r#"
        INSERT OR IGNORE INTO pledges
            (campaign_id, backer, amount, currency, status, tx_hash, block_number, created_at)
        VALUES (?1, ?2, ?3, 'USDC', 'confirmed', ?4, ?5, ?6)
        "#,
    )
    .bind(new.campaign_id)
    .bind(&new.backer)
    .bind(new.amount.micros())
    .bind(&new.tx_hash)
    .bind(new.block_number)
    .bind(now())
    .execute(&mut *tx)
    .await?
    .rows_affected();

    if inserted == 0 {
        tx.rollback().await?;
        return Ok(false);
    }

    // First confirmed pledge by this backer counts a new backer.
    let (backer_pledges,): (i64,) = sqlx::query_as(
        "SELECT COUNT(*) FROM pledges WHERE campaign_id = ?1 AND backer = ?2 AND status = 'confirmed'",
    )
    .bind(new.campaign_id)
    .bind(&new.backer)
    .fetch_one(&mut *tx)
    .await?;

    let new_backer = if backer_pledges == 1 { 1 } else { 0 };

    sqlx::query(
        r#"
        UPDATE campaigns
        SET    raised_amount = raised_amount + ?1,
               backers_count = backers_count + ?2,
               updated_at    = ?3
        WHERE  id = ?4
        "#,
    )
    .bind(new.amount.micros())
    .bind(new_backer)
    .bind(now())
    .bind(new.campaign_id)
    .execute(&mut *tx)
    .await?;

    tx.commit().await?;
    Ok(true)
}

/// Mark the backer's confirmed pledges on a campaign as refunded.
/// Returns the number of rows updated.
pub async fn mark_pledge_refunded(
    pool: &SqlitePool,
    campaign_id: i64,
    backer: &str,
) -> Result<u64> {
    let affected = sqlx::query(
        r#"
        UPDATE pledges
        SET    status = ?1
        WHERE  campaign_id = ?2 AND backer = ?3 COLLATE NOCASE AND status = 'confirmed'
        "#,
    )
    .bind(crate::models::PledgeStatus::Refunded)
    .bind(campaign_id)
    .bind(backer)
    .execute(pool)
    .await?
    .rows_affected();

    Ok(affected)
}

// ─────────────────────────────────────────────────────────
// Pledge / tier / milestone reads
// ─────────────────────────────────────────────────────────

pub async fn list_pledges_for_campaign(
    pool: &SqlitePool,
    campaign_id: i64,
) -> Result<Vec<PledgeRecord>> {
    let rows = sqlx::query_as::<_, PledgeRecord>(
        "SELECT * FROM pledges WHERE campaign_id = ?1 ORDER BY id ASC",
    )
    .bind(campaign_id)
    .fetch_all(pool)
    .await?;
    Ok(rows)
}

pub async fn list_pledges_by_backer(pool: &SqlitePool, backer: &str) -> Result<Vec<PledgeRecord>> {
    let rows = sqlx::query_as::<_, PledgeRecord>(
        "SELECT * FROM pledges WHERE backer = ?1 COLLATE NOCASE ORDER BY id ASC",
    )
    .bind(backer)
    .fetch_all(pool)
    .await?;
    Ok(rows)
}

/// Sum of CONFIRMED pledge amounts for a campaign. Compared against the
/// escrow contract's `totalPledged` to detect missed syncs.
pub async fn sum_confirmed_pledges(pool: &SqlitePool, campaign_id: i64) -> Result<Usdc> {
    let (total,): (i64,) = sqlx::query_as(
        "SELECT COALESCE(SUM(amount), 0) FROM pledges WHERE campaign_id = ?1 AND status = 'confirmed'",
    )
    .bind(campaign_id)
    .fetch_one(pool)
    .await?;
    Ok(Usdc::from_micros(total))
}

pub async fn list_tiers(pool: &SqlitePool, campaign_id: i64) -> Result<Vec<TierRecord>> {
    let rows = sqlx::query_as::<_, TierRecord>(
        "SELECT * FROM tiers WHERE campaign_id = ?1 ORDER BY amount ASC",
    )
    .bind(campaign_id)
    .fetch_all(pool)
    .await?;
    Ok(rows)
}

/// The minimum pledge implied by the campaign's tiers, if any are defined.
pub async fn min_tier_amount(pool: &SqlitePool, campaign_id: i64) -> Result<Option<Usdc>> {
    let row: Option<(Option<i64>,)> =
        sqlx::query_as("SELECT MIN(amount) FROM tiers WHERE campaign_id = ?1")
            .bind(campaign_id)
            .fetch_optional(pool)
            .await?;
    Ok(row.and_then(|(v,)| v).map(Usdc::from_micros))
}

pub async fn list_milestones(pool: &SqlitePool, campaign_id: i64) -> Result<Vec<MilestoneRecord>> {
    let rows = sqlx::query_as::<_, MilestoneRecord>(
        "SELECT * FROM milestones WHERE campaign_id = ?1 ORDER BY id ASC",
    )
    .bind(campaign_id)
    .fetch_all(pool)
    .await?;
    Ok(rows)
}

// ─────────────────────────────────────────────────────────
// Test helpers & unit tests
// ─────────────────────────────────────────────────────────

#[cfg(test)]
pub(crate) async fn test_pool() -> SqlitePool {
    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .connect("sqlite::memory:")
        .await
        .expect("in-memory pool");
    sqlx::migrate!("./migrations").run(&pool).await.expect("migrations");
    pool
}

#[cfg(test)]
pub(crate) fn sample_campaign(creator: &str, goal: Usdc) -> NewCampaign {
    NewCampaign {
        creator: creator.to_string(),
        title: "Solar Water Pumps".to_string(),
        description: "Off-grid irrigation for smallholder farms".to_string(),
        story: None,
        category: Some("hardware".to_string()),
        tags: Some(r#"["solar","agriculture"]"#.to_string()),
        cover_image: None,
        gallery: None,
        video_url: None,
        goal_amount: goal,
        duration_days: 30,
        start_date: 1_700_000_000,
    }
}
