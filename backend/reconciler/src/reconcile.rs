//! Reconciliation engine — converges the local campaign record onto
//! authoritative on-chain escrow state.
//!
//! The chain is ground truth; the record store is a read-optimized cache
//! that may lag but must never contradict a finalized on-chain outcome.
//! Every write here is idempotent and re-derivable from a fresh chain read:
//! applying the same snapshot N times ends in the same state as applying it
//! once, and two concurrent callers cannot double-apply a transition because
//! the terminal write is a compare-and-set at the storage layer.

use std::sync::Arc;
use std::time::Duration;

use sqlx::SqlitePool;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::amount::Usdc;
use crate::db;
use crate::errors::{ReconcilerError, Result};
use crate::escrow::{EscrowGateway, EscrowSnapshot};
use crate::models::{CampaignRecord, CampaignStatus, NewPledge};

/// What a reconciliation pass observed and did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReconcileOutcome {
    /// Final status as re-read after the pass.
    pub status: CampaignStatus,
    /// Final raised amount as re-read after the pass.
    pub raised_amount: Usdc,
    /// `true` only for the caller whose write performed the terminal
    /// transition.
    pub transitioned: bool,
}

/// Apply one snapshot to one campaign record.
///
/// * `finalized && status ∈ {DRAFT, ACTIVE}` — terminal transition to
///   SUCCESSFUL/FAILED with the authoritative total, via compare-and-set.
///   Losing the race to another caller is a benign no-op.
/// * not finalized — at most a display refresh of `raised_amount`.
/// * finalized and already terminal locally — no-op; the outcome was locked
///   in by an earlier pass.
pub async fn reconcile_campaign(
    pool: &SqlitePool,
    campaign: &CampaignRecord,
    snapshot: &EscrowSnapshot,
) -> Result<ReconcileOutcome> {
    if snapshot.finalized && campaign.status.reconcilable() {
        let target = if snapshot.successful {
            CampaignStatus::Successful
        } else {
            CampaignStatus::Failed
        };
        let applied =
            db::finalize_transition(pool, campaign.id, target, snapshot.total_pledged).await?;
        if applied {
            info!(
                "campaign {} reconciled to {} (raised {})",
                campaign.id,
                target.as_str(),
                snapshot.total_pledged
            );
        } else {
            // Another caller got between our read and our write.
            debug!(
                "campaign {}: terminal transition already applied elsewhere",
                campaign.id
            );
        }
        let fresh = reread(pool, campaign.id).await?;
        return Ok(ReconcileOutcome {
            status: fresh.status,
            raised_amount: fresh.raised(),
            transitioned: applied,
        });
    }

    if !snapshot.finalized {
        if campaign.raised() != snapshot.total_pledged {
            db::refresh_raised_amount(pool, campaign.id, snapshot.total_pledged).await?;
        }
        let fresh = reread(pool, campaign.id).await?;
        return Ok(ReconcileOutcome {
            status: fresh.status,
            raised_amount: fresh.raised(),
            transitioned: false,
        });
    }

    // Finalized on-chain, terminal locally: idempotent no-op.
    let fresh = reread(pool, campaign.id).await?;
    let expected = if snapshot.successful {
        CampaignStatus::Successful
    } else {
        CampaignStatus::Failed
    };
    if fresh.status.is_terminal() && fresh.status != CampaignStatus::Cancelled && fresh.status != expected {
        error!(
            "campaign {}: local terminal status {} contradicts on-chain outcome {}",
            campaign.id,
            fresh.status.as_str(),
            expected.as_str()
        );
    }
    Ok(ReconcileOutcome {
        status: fresh.status,
        raised_amount: fresh.raised(),
        transitioned: false,
    })
}

/// Fetch a fresh snapshot for a deployed campaign and reconcile with it.
pub async fn reconcile_from_chain<G: EscrowGateway>(
    pool: &SqlitePool,
    gateway: &G,
    campaign: &CampaignRecord,
) -> Result<ReconcileOutcome> {
    let chain_id = campaign
        .blockchain_campaign_id
        .ok_or(ReconcilerError::NotDeployed)? as u64;
    let snapshot = gateway
        .get_campaign(chain_id)
        .await?
        .ok_or(ReconcilerError::NotDeployed)?;
    reconcile_campaign(pool, campaign, &snapshot).await
}

async fn reread(pool: &SqlitePool, id: i64) -> Result<CampaignRecord> {
    db::get_campaign(pool, id)
        .await?
        .ok_or_else(|| ReconcilerError::NotFound(format!("campaign {id}")))
}

// ─────────────────────────────────────────────────────────
// Background sweep
// ─────────────────────────────────────────────────────────

pub struct SweepState<G> {
    pub pool: SqlitePool,
    pub gateway: G,
    pub interval: Duration,
}

/// Long-running sweep: re-reconciles every deployed, non-terminal campaign
/// and backfills pledges the confirmation path missed. Errors are logged per
/// campaign; the loop never dies.
pub async fn run<G: EscrowGateway>(state: Arc<SweepState<G>>, cancel: CancellationToken) {
    info!("Reconciliation sweep starting (every {:?})", state.interval);
    loop {
        match sweep_once(&state.pool, &state.gateway).await {
            Ok(count) if count > 0 => debug!("Sweep pass covered {count} campaigns"),
            Ok(_) => {}
            Err(e) => error!("Sweep pass error: {e}"),
        }

        tokio::select! {
            _ = cancel.cancelled() => {
                info!("Reconciliation sweep stopped");
                break;
            }
            _ = tokio::time::sleep(state.interval) => {}
        }
    }
}

/// One sweep pass. Returns the number of campaigns visited.
pub async fn sweep_once<G: EscrowGateway>(pool: &SqlitePool, gateway: &G) -> Result<usize> {
    let campaigns = db::list_reconcilable_campaigns(pool).await?;
    let count = campaigns.len();

    for campaign in campaigns {
        let Some(chain_id) = campaign.blockchain_campaign_id else {
            continue;
        };
        let chain_id = chain_id as u64;

        let snapshot = match gateway.get_campaign(chain_id).await {
            Ok(Some(s)) => s,
            Ok(None) => {
                warn!(
                    "campaign {} is bound to chain campaign {chain_id} but the escrow reports no such campaign",
                    campaign.id
                );
                continue;
            }
            Err(e) => {
                warn!("campaign {}: snapshot fetch failed, skipping: {e}", campaign.id);
                continue;
            }
        };

        if let Err(e) = backfill_pledges(pool, gateway, &campaign, chain_id, &snapshot).await {
            warn!("campaign {}: pledge backfill failed: {e}", campaign.id);
        }

        // Re-read after backfill so the pass reconciles current aggregates.
        let fresh = match reread(pool, campaign.id).await {
            Ok(c) => c,
            Err(e) => {
                warn!("campaign {}: re-read failed: {e}", campaign.id);
                continue;
            }
        };
        if let Err(e) = reconcile_campaign(pool, &fresh, &snapshot).await {
            warn!("campaign {}: reconciliation failed: {e}", campaign.id);
        }
    }

    Ok(count)
}

/// Close the "on-chain pledge confirmed, local write lost" gap: when the
/// locally summed confirmed pledges diverge from the escrow's total, replay
/// the campaign's `PledgeMade` events and insert whatever `tx_hash` the
/// store is missing. Inserts are idempotent, so replays are no-ops.
async fn backfill_pledges<G: EscrowGateway>(
    pool: &SqlitePool,
    gateway: &G,
    campaign: &CampaignRecord,
    chain_id: u64,
    snapshot: &EscrowSnapshot,
) -> Result<usize> {
    let local_total = db::sum_confirmed_pledges(pool, campaign.id).await?;
    if local_total == snapshot.total_pledged {
        return Ok(0);
    }

    warn!(
        "campaign {}: local confirmed pledges ({local_total}) diverge from on-chain total ({}); replaying events",
        campaign.id, snapshot.total_pledged
    );

    let events = gateway.pledge_made_events(chain_id).await?;
    let mut inserted = 0usize;
    let mut backfilled = Usdc::ZERO;
    for event in events.iter().filter(|e| e.campaign_id == chain_id) {
        let new = NewPledge {
            campaign_id: campaign.id,
            backer: event.backer.clone(),
            amount: event.amount,
            tx_hash: event.tx_hash.clone(),
            block_number: event.block_number,
        };
        if db::insert_pledge(pool, &new).await? {
            inserted += 1;
            backfilled = backfilled.checked_add(event.amount).ok_or_else(|| {
                ReconcilerError::StaleRead("backfilled pledge total overflows".to_string())
            })?;
        }
    }

    if inserted > 0 {
        info!(
            "campaign {}: backfilled {inserted} missed pledges totalling {backfilled}",
            campaign.id
        );
    }
    Ok(inserted)
}

// ─────────────────────────────────────────────────────────
// Unit tests
// ─────────────────────────────────────────────────────────
