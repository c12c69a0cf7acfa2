//! Finalization and refund workflows.
//!
//! Two independent creator/backer actions, each precondition-gated and
//! driven to completion by the reconciliation engine. On-chain revert
//! reasons surface to the caller verbatim; neither action retries
//! automatically — the user re-invokes.

use sqlx::SqlitePool;
use tracing::{info, warn};

use crate::amount::Usdc;
use crate::db;
use crate::errors::{ReconcilerError, Result};
use crate::escrow::{EscrowGateway, EscrowSnapshot};
use crate::models::{CampaignRecord, CampaignStatus};
use crate::reconcile;

/// Result of a creator-initiated finalize.
#[derive(Debug, Clone)]
pub struct FinalizeOutcome {
    pub status: CampaignStatus,
    pub raised_amount: Usdc,
    pub successful: bool,
    pub tx_hash: String,
}

/// Result of a backer-initiated refund claim.
#[derive(Debug, Clone)]
pub struct RefundOutcome {
    /// The refunded on-chain pledge amount.
    pub amount: Usdc,
    pub tx_hash: String,
    /// `false` when no local pledge record existed to mark (the chain
    /// refund still happened).
    pub pledge_marked: bool,
}

/// Creator-only, post-deadline finalize. The decoded `CampaignFinalized`
/// event carries the authoritative outcome the engine locks in.
pub async fn finalize_campaign<G: EscrowGateway>(
    pool: &SqlitePool,
    gateway: &G,
    campaign_id: i64,
    caller: &str,
) -> Result<FinalizeOutcome> {
    let campaign = load_campaign(pool, campaign_id).await?;
    let chain_id = campaign
        .blockchain_campaign_id
        .ok_or(ReconcilerError::NotDeployed)? as u64;

    let snapshot = gateway
        .get_campaign(chain_id)
        .await?
        .ok_or(ReconcilerError::NotDeployed)?;

    if !caller.eq_ignore_ascii_case(&snapshot.creator) {
        return Err(ReconcilerError::Validation(
            "only the campaign creator can finalize".to_string(),
        ));
    }
    if chrono::Utc::now().timestamp() < snapshot.deadline {
        return Err(ReconcilerError::Validation(
            "deadline not reached".to_string(),
        ));
    }
    if snapshot.finalized {
        return Err(ReconcilerError::Validation(
            "campaign is already finalized".to_string(),
        ));
    }

    let event = gateway.finalize_campaign(chain_id, caller).await?;
    info!(
        "campaign {} finalized on-chain: successful={}, total={} (tx {})",
        campaign.id, event.successful, event.total_amount, event.tx_hash
    );

    // Drive the engine with the event's authoritative outcome rather than
    // waiting for the next poll to observe it.
    let terminal = EscrowSnapshot {
        finalized: true,
        successful: event.successful,
        total_pledged: event.total_amount,
        ..snapshot
    };
    let outcome = reconcile::reconcile_campaign(pool, &campaign, &terminal).await?;

    Ok(FinalizeOutcome {
        status: outcome.status,
        raised_amount: outcome.raised_amount,
        successful: event.successful,
        tx_hash: event.tx_hash,
    })
}

/// Backer-only refund claim on a failed campaign. On confirmation the
/// backer's local pledge records flip to REFUNDED.
pub async fn claim_refund<G: EscrowGateway>(
    pool: &SqlitePool,
    gateway: &G,
    campaign_id: i64,
    backer: &str,
) -> Result<RefundOutcome> {
    let campaign = load_campaign(pool, campaign_id).await?;
    let chain_id = campaign
        .blockchain_campaign_id
        .ok_or(ReconcilerError::NotDeployed)? as u64;

    // The campaign must have failed — locally, or on-chain if the local
    // record is lagging (in which case reconcile it on the way through).
    if campaign.status != CampaignStatus::Failed {
        let snapshot = gateway
            .get_campaign(chain_id)
            .await?
            .ok_or(ReconcilerError::NotDeployed)?;
        if !(snapshot.finalized && !snapshot.successful) {
            return Err(ReconcilerError::Validation(
                "campaign has not failed; nothing to refund".to_string(),
            ));
        }
        reconcile::reconcile_campaign(pool, &campaign, &snapshot).await?;
    }

    let pledge = gateway.get_pledge(chain_id, backer).await?;
    if pledge.amount.is_zero() {
        return Err(ReconcilerError::Validation(
            "no on-chain pledge to refund".to_string(),
        ));
    }
    if pledge.has_claimed_refund {
        return Err(ReconcilerError::Validation(
            "refund already claimed".to_string(),
        ));
    }

    let receipt = gateway.claim_refund(chain_id, backer).await?;
    info!(
        "refund of {} claimed by {} for campaign {} (tx {})",
        pledge.amount, backer, campaign.id, receipt.tx_hash
    );

    let marked = db::mark_pledge_refunded(pool, campaign.id, backer).await?;
    if marked == 0 {
        warn!(
            "refund confirmed for {backer} on campaign {} but no local pledge record was found",
            campaign.id
        );
    }

    Ok(RefundOutcome {
        amount: pledge.amount,
        tx_hash: receipt.tx_hash,
        pledge_marked: marked > 0,
    })
}

async fn load_campaign(pool: &SqlitePool, campaign_id: i64) -> Result<CampaignRecord> {
    db::get_campaign(pool, campaign_id)
        .await?
        .ok_or_else(|| ReconcilerError::NotFound(format!("campaign {campaign_id}")))
}

// ─────────────────────────────────────────────────────────
// Unit tests
// ─────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::{sample_campaign, test_pool, BlockchainUpdate};
    use crate::escrow::mock::MockGateway;
    use crate::models::PledgeStatus;
    use crate::pledge;

    fn usdc(s: &str) -> Usdc {
        s.parse().unwrap()
    }

    /// Deadline already in the past so finalize preconditions pass.
    const PAST_DEADLINE: i64 = 1_700_000_000;

    async fn setup(pool: &SqlitePool, deadline: i64) -> (CampaignRecord, MockGateway) {
        let campaign =
            db::create_campaign(pool, &sample_campaign("0xcreator", usdc("1000")), &[], &[])
                .await
                .unwrap();
        let campaign = db::update_blockchain_data(
            pool,
            campaign.id,
            &BlockchainUpdate {
                blockchain_campaign_id: Some(7),
                ..Default::default()
            },
        )
        .await
        .unwrap();

        let gateway = MockGateway::new();
        gateway.add_campaign(7, "0xcreator", usdc("1000"), deadline);
        (campaign, gateway)
    }

    #[tokio::test]
    async fn finalize_success_path() {
        let pool = test_pool().await;
        let (campaign, gateway) = setup(&pool, PAST_DEADLINE).await;
        gateway.pledge_behind_our_back(7, "0xalice", usdc("1000"));

        let outcome = finalize_campaign(&pool, &gateway, campaign.id, "0xcreator")
            .await
            .unwrap();

        assert!(outcome.successful);
        assert_eq!(outcome.status, CampaignStatus::Successful);
        assert_eq!(outcome.raised_amount, usdc("1000"));

        // Re-running fails the already-finalized precondition.
        let err = finalize_campaign(&pool, &gateway, campaign.id, "0xcreator")
            .await
            .unwrap_err();
        assert!(matches!(err, ReconcilerError::Validation(_)));
    }

    #[tokio::test]
    async fn finalize_rejects_non_creator() {
        let pool = test_pool().await;
        let (campaign, gateway) = setup(&pool, PAST_DEADLINE).await;

        let err = finalize_campaign(&pool, &gateway, campaign.id, "0xmallory")
            .await
            .unwrap_err();
        assert!(matches!(err, ReconcilerError::Validation(_)));
        assert!(!gateway.calls().iter().any(|c| c.starts_with("finalize:")));
    }

    #[tokio::test]
    async fn finalize_rejects_before_deadline() {
        let pool = test_pool().await;
        let future = chrono::Utc::now().timestamp() + 86_400;
        let (campaign, gateway) = setup(&pool, future).await;

        let err = finalize_campaign(&pool, &gateway, campaign.id, "0xcreator")
            .await
            .unwrap_err();
        match err {
            ReconcilerError::Validation(reason) => assert_eq!(reason, "deadline not reached"),
            other => panic!("expected Validation, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn refund_flow_marks_pledge_refunded() {
        let pool = test_pool().await;
        let (campaign, gateway) = setup(&pool, PAST_DEADLINE).await;

        // Goal not met: $25 of $1000.
        let tx_hash = gateway.pledge_behind_our_back(7, "0xbacker", usdc("25"));
        pledge::confirm(&pool, &gateway, campaign.id, "0xbacker", usdc("25"), &tx_hash)
            .await
            .unwrap();
        finalize_campaign(&pool, &gateway, campaign.id, "0xcreator")
            .await
            .unwrap();

        let outcome = claim_refund(&pool, &gateway, campaign.id, "0xbacker")
            .await
            .unwrap();
        assert_eq!(outcome.amount, usdc("25"));
        assert!(outcome.pledge_marked);

        let pledges = db::list_pledges_for_campaign(&pool, campaign.id).await.unwrap();
        assert_eq!(pledges[0].status, PledgeStatus::Refunded);

        // Second claim fails the already-claimed precondition before any write.
        let err = claim_refund(&pool, &gateway, campaign.id, "0xbacker")
            .await
            .unwrap_err();
        match err {
            ReconcilerError::Validation(reason) => assert_eq!(reason, "refund already claimed"),
            other => panic!("expected Validation, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn refund_rejected_while_campaign_active() {
        let pool = test_pool().await;
        let (campaign, gateway) = setup(&pool, PAST_DEADLINE).await;
        gateway.pledge_behind_our_back(7, "0xbacker", usdc("25"));

        let err = claim_refund(&pool, &gateway, campaign.id, "0xbacker")
            .await
            .unwrap_err();
        assert!(matches!(err, ReconcilerError::Validation(_)));
    }

    #[tokio::test]
    async fn refund_rejected_without_pledge() {
        let pool = test_pool().await;
        let (campaign, gateway) = setup(&pool, PAST_DEADLINE).await;
        gateway.pledge_behind_our_back(7, "0xalice", usdc("25"));
        finalize_campaign(&pool, &gateway, campaign.id, "0xcreator")
            .await
            .unwrap();

        let err = claim_refund(&pool, &gateway, campaign.id, "0xnobody")
            .await
            .unwrap_err();
        match err {
            ReconcilerError::Validation(reason) => assert_eq!(reason, "no on-chain pledge to refund"),
            other => panic!("expected Validation, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn refund_reconciles_lagging_local_status() {
        let pool = test_pool().await;
        let (campaign, gateway) = setup(&pool, PAST_DEADLINE).await;
        let tx_hash = gateway.pledge_behind_our_back(7, "0xbacker", usdc("25"));
        pledge::confirm(&pool, &gateway, campaign.id, "0xbacker", usdc("25"), &tx_hash)
            .await
            .unwrap();

        // Finalized on-chain by someone else; the local record still says
        // ACTIVE when the backer claims.
        gateway.finalize_on_chain(7);
        let outcome = claim_refund(&pool, &gateway, campaign.id, "0xbacker")
            .await
            .unwrap();
        assert!(outcome.pledge_marked);

        let fresh = db::get_campaign(&pool, campaign.id).await.unwrap().unwrap();
        assert_eq!(fresh.status, CampaignStatus::Failed);
    }
}
