//! Pledge intake workflow — INPUT → APPROVE → PLEDGE.
//!
//! Two entry points share one persistence tail:
//!
//! * [`execute`] runs the full sequence against the gateway (allowance check,
//!   exact-amount approval, pledge submission).
//! * [`confirm`] is driven by the HTTP boundary: the backer's wallet already
//!   submitted the transaction, and the client hands over its hash. The
//!   decoded on-chain event — never the client-supplied amount — is what
//!   gets persisted.
//!
//! A revert at any step surfaces to the caller with no local writes. A
//! database failure *after* on-chain confirmation is logged and reported as
//! `synced = false`; the pledge is not lost — the background sweep backfills
//! it from the event log.

use sqlx::SqlitePool;
use tracing::{debug, error, info, warn};

use crate::amount::Usdc;
use crate::db;
use crate::errors::{ReconcilerError, Result};
use crate::escrow::{is_tx_hash, EscrowGateway, PledgeEvent};
use crate::models::{CampaignRecord, CampaignStatus, NewPledge};
use crate::reconcile;

/// Named steps of the intake sequence, used to report where a failure
/// happened.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PledgeStep {
    Input,
    Approve,
    Pledge,
}

/// What the workflow observed after the pledge confirmed.
#[derive(Debug, Clone)]
pub struct PledgeOutcome {
    /// `false` when the transaction hash was already recorded (replay).
    pub recorded: bool,
    /// `false` when the local write failed after on-chain success.
    pub synced: bool,
    /// Authoritative amount from the decoded event.
    pub amount: Usdc,
    pub tx_hash: String,
    pub campaign_status: CampaignStatus,
    pub raised_amount: Usdc,
}

/// Run the full intake sequence for `backer` pledging `amount`.
pub async fn execute<G: EscrowGateway>(
    pool: &SqlitePool,
    gateway: &G,
    campaign_id: i64,
    backer: &str,
    amount: Usdc,
) -> Result<PledgeOutcome> {
    // INPUT — local preconditions come first; a campaign with no on-chain
    // counterpart is rejected before any network call.
    let campaign = load_campaign(pool, campaign_id).await?;
    let chain_id = campaign
        .blockchain_campaign_id
        .ok_or(ReconcilerError::NotDeployed)? as u64;

    if amount <= Usdc::ZERO {
        return Err(ReconcilerError::Validation(
            "pledge amount must be positive".to_string(),
        ));
    }
    if let Some(min) = db::min_tier_amount(pool, campaign_id).await? {
        if amount < min {
            return Err(ReconcilerError::Validation(format!(
                "pledge amount {amount} is below the minimum tier of {min}"
            )));
        }
    }

    step(PledgeStep::Input, gateway.get_campaign(chain_id).await)?
        .ok_or(ReconcilerError::NotDeployed)?;

    let balance = step(PledgeStep::Input, gateway.token_balance(backer).await)?;
    if balance < amount {
        return Err(ReconcilerError::Validation(format!(
            "insufficient USDC balance: have {balance}, need {amount}"
        )));
    }

    // APPROVE — grant exactly the requested allowance, only when short.
    let allowance = gateway.token_allowance(backer).await?;
    if allowance < amount {
        let receipt = step(PledgeStep::Approve, gateway.approve(backer, amount).await)?;
        debug!("allowance of {amount} approved in tx {}", receipt.tx_hash);
    }

    // PLEDGE — submit, then let the decoded event drive persistence.
    let event = step(PledgeStep::Pledge, gateway.pledge(chain_id, backer, amount).await)?;
    verify_event(&event, chain_id, backer)?;

    persist_and_reconcile(pool, gateway, &campaign, chain_id, &event).await
}

/// Persist a pledge the backer's wallet already submitted. `claimed` is the
/// UI-entered amount; the decoded event wins if they disagree.
pub async fn confirm<G: EscrowGateway>(
    pool: &SqlitePool,
    gateway: &G,
    campaign_id: i64,
    wallet: &str,
    claimed: Usdc,
    tx_hash: &str,
) -> Result<PledgeOutcome> {
    if !is_tx_hash(tx_hash) {
        return Err(ReconcilerError::Validation(format!(
            "malformed transaction hash: {tx_hash}"
        )));
    }

    let campaign = load_campaign(pool, campaign_id).await?;
    let chain_id = campaign
        .blockchain_campaign_id
        .ok_or(ReconcilerError::NotDeployed)? as u64;

    let event = gateway
        .pledge_event_for_tx(tx_hash)
        .await?
        .ok_or_else(|| {
            ReconcilerError::EventDecode(format!(
                "transaction {tx_hash} carries no confirmed pledge event"
            ))
        })?;
    verify_event(&event, chain_id, wallet)?;

    if event.amount != claimed {
        warn!(
            "client-supplied amount {claimed} differs from decoded event amount {}; using the event",
            event.amount
        );
    }

    persist_and_reconcile(pool, gateway, &campaign, chain_id, &event).await
}

async fn load_campaign(pool: &SqlitePool, campaign_id: i64) -> Result<CampaignRecord> {
    db::get_campaign(pool, campaign_id)
        .await?
        .ok_or_else(|| ReconcilerError::NotFound(format!("campaign {campaign_id}")))
}

fn step<T>(at: PledgeStep, result: Result<T>) -> Result<T> {
    result.map_err(|e| {
        warn!("pledge workflow failed at {at:?}: {e}");
        e
    })
}

/// The decoded event must name the campaign and backer this workflow is
/// acting for; client input is never trusted over it.
fn verify_event(event: &PledgeEvent, chain_id: u64, backer: &str) -> Result<()> {
    if event.campaign_id != chain_id {
        return Err(ReconcilerError::EventDecode(format!(
            "pledge event names campaign {}, expected {}",
            event.campaign_id, chain_id
        )));
    }
    if !event.backer.eq_ignore_ascii_case(backer) {
        return Err(ReconcilerError::EventDecode(format!(
            "pledge event names backer {}, expected {}",
            event.backer, backer
        )));
    }
    Ok(())
}

/// Shared tail: atomic pledge insert, then a fresh-snapshot reconciliation.
/// On-chain success is never reported as failure from here on — persistence
/// errors degrade to `synced = false`.
async fn persist_and_reconcile<G: EscrowGateway>(
    pool: &SqlitePool,
    gateway: &G,
    campaign: &CampaignRecord,
    chain_id: u64,
    event: &PledgeEvent,
) -> Result<PledgeOutcome> {
    let new_pledge = NewPledge {
        campaign_id: campaign.id,
        backer: event.backer.clone(),
        amount: event.amount,
        tx_hash: event.tx_hash.clone(),
        block_number: event.block_number,
    };

    let (recorded, synced) = match db::insert_pledge(pool, &new_pledge).await {
        Ok(true) => {
            info!(
                "pledge of {} by {} recorded for campaign {} (tx {})",
                event.amount, event.backer, campaign.id, event.tx_hash
            );
            (true, true)
        }
        Ok(false) => {
            info!("pledge tx {} already recorded; replay ignored", event.tx_hash);
            (false, true)
        }
        Err(e) => {
            error!(
                "on-chain pledge {} confirmed but local write failed: {e}; the sweep will backfill it",
                event.tx_hash
            );
            (false, false)
        }
    };

    match gateway.get_campaign(chain_id).await {
        Ok(Some(snapshot)) => {
            if let Err(e) = reconcile::reconcile_campaign(pool, campaign, &snapshot).await {
                warn!("post-pledge reconciliation failed: {e}");
            }
        }
        Ok(None) => warn!("campaign {chain_id} vanished from the escrow during pledge"),
        Err(e) => warn!("post-pledge snapshot fetch failed: {e}"),
    }

    // Best-effort re-read; fall back to the pre-pledge record rather than
    // hiding an on-chain success behind a read error.
    let (campaign_status, raised_amount) = match db::get_campaign(pool, campaign.id).await {
        Ok(Some(fresh)) => (fresh.status, fresh.raised()),
        _ => (campaign.status, campaign.raised()),
    };

    Ok(PledgeOutcome {
        recorded,
        synced,
        amount: event.amount,
        tx_hash: event.tx_hash.clone(),
        campaign_status,
        raised_amount,
    })
}

// ─────────────────────────────────────────────────────────
// Unit tests
// ─────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::{sample_campaign, test_pool, BlockchainUpdate};
    use crate::escrow::mock::MockGateway;
    use crate::models::NewTier;

    fn usdc(s: &str) -> Usdc {
        s.parse().unwrap()
    }

    async fn setup(pool: &SqlitePool, tiers: &[NewTier]) -> (CampaignRecord, MockGateway) {
        let campaign =
            db::create_campaign(pool, &sample_campaign("0xcreator", usdc("1000")), tiers, &[])
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
        gateway.add_campaign(7, "0xcreator", usdc("1000"), 1_700_000_000);
        (campaign, gateway)
    }

    #[tokio::test]
    async fn happy_path_pledge() {
        let pool = test_pool().await;
        let (campaign, gateway) = setup(&pool, &[]).await;
        gateway.set_balance("0xbacker", usdc("100"));

        let outcome = execute(&pool, &gateway, campaign.id, "0xbacker", usdc("50"))
            .await
            .unwrap();

        assert!(outcome.recorded);
        assert!(outcome.synced);
        assert_eq!(outcome.amount, usdc("50"));
        assert_eq!(outcome.raised_amount, usdc("50"));
        assert_eq!(outcome.campaign_status, CampaignStatus::Active);

        let pledges = db::list_pledges_for_campaign(&pool, campaign.id).await.unwrap();
        assert_eq!(pledges.len(), 1);
        assert_eq!(Usdc::from_micros(pledges[0].amount), usdc("50"));
        assert_eq!(pledges[0].backer, "0xbacker");
    }

    #[tokio::test]
    async fn not_deployed_fails_before_any_network_call() {
        let pool = test_pool().await;
        let campaign =
            db::create_campaign(&pool, &sample_campaign("0xcreator", usdc("1000")), &[], &[])
                .await
                .unwrap();
        let gateway = MockGateway::new();

        let err = execute(&pool, &gateway, campaign.id, "0xbacker", usdc("50"))
            .await
            .unwrap_err();
        assert!(matches!(err, ReconcilerError::NotDeployed));
        assert!(gateway.calls().is_empty());
    }

    #[tokio::test]
    async fn rejects_pledge_below_minimum_tier() {
        let pool = test_pool().await;
        let tiers = vec![NewTier {
            title: "Supporter".to_string(),
            description: None,
            amount: usdc("25"),
        }];
        let (campaign, gateway) = setup(&pool, &tiers).await;
        gateway.set_balance("0xbacker", usdc("100"));

        let err = execute(&pool, &gateway, campaign.id, "0xbacker", usdc("10"))
            .await
            .unwrap_err();
        assert!(matches!(err, ReconcilerError::Validation(_)));
        assert!(db::list_pledges_for_campaign(&pool, campaign.id).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn rejects_insufficient_balance() {
        let pool = test_pool().await;
        let (campaign, gateway) = setup(&pool, &[]).await;
        gateway.set_balance("0xbacker", usdc("10"));

        let err = execute(&pool, &gateway, campaign.id, "0xbacker", usdc("50"))
            .await
            .unwrap_err();
        assert!(matches!(err, ReconcilerError::Validation(_)));
    }

    #[tokio::test]
    async fn approval_only_when_allowance_is_short() {
        let pool = test_pool().await;
        let (campaign, gateway) = setup(&pool, &[]).await;
        gateway.set_balance("0xbacker", usdc("100"));
        gateway.set_allowance("0xbacker", usdc("80"));

        execute(&pool, &gateway, campaign.id, "0xbacker", usdc("50"))
            .await
            .unwrap();
        assert!(!gateway.calls().iter().any(|c| c.starts_with("approve:")));

        // Second pledge exceeds the leftover allowance: exact-amount approval.
        execute(&pool, &gateway, campaign.id, "0xbacker", usdc("90"))
            .await
            .unwrap();
        assert!(gateway.calls().contains(&"approve:0xbacker:90".to_string()));
    }

    #[tokio::test]
    async fn revert_leaves_no_local_writes() {
        let pool = test_pool().await;
        let (campaign, gateway) = setup(&pool, &[]).await;
        gateway.set_balance("0xbacker", usdc("100"));
        gateway.set_allowance("0xbacker", usdc("100"));
        gateway.revert_next("insufficient balance");

        let err = execute(&pool, &gateway, campaign.id, "0xbacker", usdc("50"))
            .await
            .unwrap_err();
        match err {
            ReconcilerError::ChainRevert(reason) => assert_eq!(reason, "insufficient balance"),
            other => panic!("expected ChainRevert, got {other:?}"),
        }

        assert!(db::list_pledges_for_campaign(&pool, campaign.id).await.unwrap().is_empty());
        let fresh = db::get_campaign(&pool, campaign.id).await.unwrap().unwrap();
        assert_eq!(fresh.raised(), Usdc::ZERO);
    }

    #[tokio::test]
    async fn confirm_uses_decoded_amount_over_client_amount() {
        let pool = test_pool().await;
        let (campaign, gateway) = setup(&pool, &[]).await;
        let tx_hash = gateway.pledge_behind_our_back(7, "0xbacker", usdc("50"));

        // Client claims $9000; the decoded event says $50.
        let outcome = confirm(&pool, &gateway, campaign.id, "0xbacker", usdc("9000"), &tx_hash)
            .await
            .unwrap();

        assert_eq!(outcome.amount, usdc("50"));
        assert_eq!(outcome.raised_amount, usdc("50"));
        let pledges = db::list_pledges_for_campaign(&pool, campaign.id).await.unwrap();
        assert_eq!(Usdc::from_micros(pledges[0].amount), usdc("50"));
    }

    #[tokio::test]
    async fn confirm_rejects_event_for_other_backer() {
        let pool = test_pool().await;
        let (campaign, gateway) = setup(&pool, &[]).await;
        let tx_hash = gateway.pledge_behind_our_back(7, "0xalice", usdc("50"));

        let err = confirm(&pool, &gateway, campaign.id, "0xmallory", usdc("50"), &tx_hash)
            .await
            .unwrap_err();
        assert!(matches!(err, ReconcilerError::EventDecode(_)));
        assert!(db::list_pledges_for_campaign(&pool, campaign.id).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn confirm_rejects_malformed_and_unknown_tx_hashes() {
        let pool = test_pool().await;
        let (campaign, gateway) = setup(&pool, &[]).await;

        let err = confirm(&pool, &gateway, campaign.id, "0xbacker", usdc("50"), "nonsense")
            .await
            .unwrap_err();
        assert!(matches!(err, ReconcilerError::Validation(_)));

        let unknown = format!("0x{}", "ef".repeat(32));
        let err = confirm(&pool, &gateway, campaign.id, "0xbacker", usdc("50"), &unknown)
            .await
            .unwrap_err();
        assert!(matches!(err, ReconcilerError::EventDecode(_)));
    }

    #[tokio::test]
    async fn replayed_confirmation_is_a_no_op() {
        let pool = test_pool().await;
        let (campaign, gateway) = setup(&pool, &[]).await;
        let tx_hash = gateway.pledge_behind_our_back(7, "0xbacker", usdc("50"));

        let first = confirm(&pool, &gateway, campaign.id, "0xbacker", usdc("50"), &tx_hash)
            .await
            .unwrap();
        let second = confirm(&pool, &gateway, campaign.id, "0xbacker", usdc("50"), &tx_hash)
            .await
            .unwrap();

        assert!(first.recorded);
        assert!(!second.recorded);
        assert_eq!(second.raised_amount, usdc("50"));
        assert_eq!(
            db::list_pledges_for_campaign(&pool, campaign.id).await.unwrap().len(),
            1
        );
    }
}
