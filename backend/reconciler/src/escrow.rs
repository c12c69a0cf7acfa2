//! Escrow gateway — typed access to the on-chain escrow authority.
//!
//! The chain is always ground truth: everything here is either a pure read
//! (safe to poll, idempotent) or a write whose decoded event is the
//! authoritative record of what happened. Amounts cross this boundary as
//! base-unit integers (micro-USDC) and are wrapped in [`Usdc`] immediately.
//!
//! ## Resilience
//!
//! * Reads retry transient failures with exponential back-off, bounded at
//!   [`MAX_READ_ATTEMPTS`] because reads also run on request paths.
//! * Writes are submitted exactly once. A revert surfaces the node's reason
//!   verbatim as [`ReconcilerError::ChainRevert`] and is never retried.

use std::time::Duration;

use reqwest::Client;
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::{debug, warn};

use crate::amount::Usdc;
use crate::config::Config;
use crate::errors::{ReconcilerError, Result};

const MAX_READ_ATTEMPTS: u32 = 3;
const INITIAL_BACKOFF_MS: u64 = 250;
const MAX_BACKOFF_MS: u64 = 2_000;

// ─────────────────────────────────────────────────────────
// Snapshot & event types
// ─────────────────────────────────────────────────────────

/// Point-in-time read of on-chain campaign state. Never persisted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EscrowSnapshot {
    pub campaign_id: u64,
    pub creator: String,
    pub goal: Usdc,
    pub total_pledged: Usdc,
    /// Unix seconds.
    pub deadline: i64,
    /// One-way flag; once true, `successful` never changes.
    pub finalized: bool,
    pub successful: bool,
    /// Basis points.
    pub platform_fee_bps: u32,
}

/// Per-backer escrow state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackerPledge {
    pub amount: Usdc,
    pub has_claimed_refund: bool,
}

/// Decoded `PledgeMade(campaignId, backer, amount)` event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PledgeEvent {
    pub campaign_id: u64,
    pub backer: String,
    pub amount: Usdc,
    pub tx_hash: String,
    pub block_number: i64,
}

/// Decoded `CampaignFinalized(campaignId, successful, totalAmount)` event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FinalizeEvent {
    pub campaign_id: u64,
    pub successful: bool,
    pub total_amount: Usdc,
    pub tx_hash: String,
    pub block_number: i64,
}

/// Confirmation of a transaction that carries no event we persist.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TxReceipt {
    pub tx_hash: String,
    pub block_number: i64,
}

/// `true` for a well-formed 32-byte transaction hash.
pub fn is_tx_hash(s: &str) -> bool {
    s.strip_prefix("0x")
        .map(|h| h.len() == 64 && hex::decode(h).is_ok())
        .unwrap_or(false)
}

/// `true` when `addr` is the zero address in any casing.
pub fn is_zero_address(addr: &str) -> bool {
    let h = addr.strip_prefix("0x").unwrap_or(addr);
    !h.is_empty() && h.chars().all(|c| c == '0')
}

// ─────────────────────────────────────────────────────────
// Gateway trait
// ─────────────────────────────────────────────────────────

/// Reads and writes against the escrow authority. Workflows and the
/// reconciliation engine are generic over this so they can run against an
/// in-memory chain in tests.
#[allow(async_fn_in_trait)]
pub trait EscrowGateway: Send + Sync {
    /// Fetch a campaign's escrow state. `Ok(None)` means the campaign does
    /// not exist on-chain yet (zero creator) — distinct from a read error.
    async fn get_campaign(&self, chain_id: u64) -> Result<Option<EscrowSnapshot>>;

    /// Fetch a backer's pledge state for a campaign.
    async fn get_pledge(&self, chain_id: u64, backer: &str) -> Result<BackerPledge>;

    async fn token_balance(&self, address: &str) -> Result<Usdc>;

    async fn token_allowance(&self, owner: &str) -> Result<Usdc>;

    /// Approve exactly `amount` of allowance toward the escrow contract.
    async fn approve(&self, owner: &str, amount: Usdc) -> Result<TxReceipt>;

    /// Submit a pledge. The returned decoded event is authoritative for the
    /// persisted amount and backer.
    async fn pledge(&self, chain_id: u64, backer: &str, amount: Usdc) -> Result<PledgeEvent>;

    async fn finalize_campaign(&self, chain_id: u64, caller: &str) -> Result<FinalizeEvent>;

    async fn claim_refund(&self, chain_id: u64, backer: &str) -> Result<TxReceipt>;

    /// All decoded `PledgeMade` events for a campaign (sweep backfill).
    async fn pledge_made_events(&self, chain_id: u64) -> Result<Vec<PledgeEvent>>;

    /// The `PledgeMade` event carried by a specific confirmed transaction,
    /// if any.
    async fn pledge_event_for_tx(&self, tx_hash: &str) -> Result<Option<PledgeEvent>>;
}

// ─────────────────────────────────────────────────────────
// JSON-RPC response shapes
// ─────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct RpcResponse {
    result: Option<Value>,
    error: Option<RpcError>,
}

#[derive(Debug, Deserialize)]
struct RpcError {
    code: i64,
    message: String,
}

// ─────────────────────────────────────────────────────────
// Production client
// ─────────────────────────────────────────────────────────

/// JSON-RPC client for the escrow node.
#[derive(Clone)]
pub struct EscrowClient {
    client: Client,
    rpc_url: String,
    escrow_contract: String,
    token_contract: String,
}

impl EscrowClient {
    pub fn new(client: Client, config: &Config) -> Self {
        EscrowClient {
            client,
            rpc_url: config.rpc_url.clone(),
            escrow_contract: config.escrow_contract.clone(),
            token_contract: config.token_contract.clone(),
        }
    }

    async fn call_once(&self, method: &str, params: &Value) -> Result<Value> {
        let response = self
            .client
            .post(&self.rpc_url)
            .json(&json!({
                "jsonrpc": "2.0",
                "id": 1,
                "method": method,
                "params": params,
            }))
            .send()
            .await?;

        if response.status() == reqwest::StatusCode::TOO_MANY_REQUESTS {
            return Err(ReconcilerError::StaleRead(
                "rate-limited by escrow node".to_string(),
            ));
        }

        let body: RpcResponse = response.json().await?;
        if let Some(err) = body.error {
            return Err(ReconcilerError::StaleRead(format!(
                "RPC error {}: {}",
                err.code, err.message
            )));
        }
        body.result
            .ok_or_else(|| ReconcilerError::StaleRead(format!("empty result from {method}")))
    }

    /// Read call with bounded exponential back-off.
    async fn call_read(&self, method: &str, params: Value) -> Result<Value> {
        let mut backoff = INITIAL_BACKOFF_MS;
        let mut attempt = 0;
        loop {
            attempt += 1;
            match self.call_once(method, &params).await {
                Ok(value) => return Ok(value),
                Err(e) if attempt < MAX_READ_ATTEMPTS => {
                    warn!("RPC {method} failed (attempt {attempt}, retrying in {backoff}ms): {e}");
                    tokio::time::sleep(Duration::from_millis(backoff)).await;
                    backoff = (backoff * 2).min(MAX_BACKOFF_MS);
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Write call: single submission, reverts surfaced verbatim.
    async fn call_write(&self, method: &str, params: Value) -> Result<Value> {
        let response = self
            .client
            .post(&self.rpc_url)
            .json(&json!({
                "jsonrpc": "2.0",
                "id": 1,
                "method": method,
                "params": params,
            }))
            .send()
            .await?;

        let body: RpcResponse = response.json().await?;
        if let Some(err) = body.error {
            return Err(ReconcilerError::ChainRevert(err.message));
        }
        body.result
            .ok_or_else(|| ReconcilerError::StaleRead(format!("empty result from {method}")))
    }
}

impl EscrowGateway for EscrowClient {
    async fn get_campaign(&self, chain_id: u64) -> Result<Option<EscrowSnapshot>> {
        let value = self
            .call_read(
                "escrow_getCampaign",
                json!({ "contract": self.escrow_contract, "campaignId": chain_id }),
            )
            .await?;
        debug!("fetched escrow state for campaign {chain_id}");
        decode_snapshot(chain_id, &value)
    }

    async fn get_pledge(&self, chain_id: u64, backer: &str) -> Result<BackerPledge> {
        let value = self
            .call_read(
                "escrow_getPledge",
                json!({ "contract": self.escrow_contract, "campaignId": chain_id, "backer": backer }),
            )
            .await?;
        Ok(BackerPledge {
            amount: micros_field(&value, "amount")?,
            has_claimed_refund: bool_field(&value, "hasClaimedRefund")?,
        })
    }

    async fn token_balance(&self, address: &str) -> Result<Usdc> {
        let value = self
            .call_read(
                "token_balanceOf",
                json!({ "contract": self.token_contract, "address": address }),
            )
            .await?;
        micros_value(&value, "balance")
    }

    async fn token_allowance(&self, owner: &str) -> Result<Usdc> {
        let value = self
            .call_read(
                "token_allowance",
                json!({
                    "contract": self.token_contract,
                    "owner": owner,
                    "spender": self.escrow_contract,
                }),
            )
            .await?;
        micros_value(&value, "allowance")
    }

    async fn approve(&self, owner: &str, amount: Usdc) -> Result<TxReceipt> {
        let value = self
            .call_write(
                "token_approve",
                json!({
                    "contract": self.token_contract,
                    "owner": owner,
                    "spender": self.escrow_contract,
                    "amount": amount.micros().to_string(),
                }),
            )
            .await?;
        decode_receipt(&value)
    }

    async fn pledge(&self, chain_id: u64, backer: &str, amount: Usdc) -> Result<PledgeEvent> {
        let value = self
            .call_write(
                "escrow_pledge",
                json!({
                    "contract": self.escrow_contract,
                    "campaignId": chain_id,
                    "backer": backer,
                    "amount": amount.micros().to_string(),
                }),
            )
            .await?;
        let receipt = decode_receipt(&value)?;
        let event = find_event(&value, "PledgeMade").ok_or_else(|| {
            ReconcilerError::EventDecode(format!(
                "transaction {} confirmed but carries no PledgeMade event",
                receipt.tx_hash
            ))
        })?;
        decode_pledge_event(event, &receipt)
    }

    async fn finalize_campaign(&self, chain_id: u64, caller: &str) -> Result<FinalizeEvent> {
        let value = self
            .call_write(
                "escrow_finalizeCampaign",
                json!({
                    "contract": self.escrow_contract,
                    "campaignId": chain_id,
                    "caller": caller,
                }),
            )
            .await?;
        let receipt = decode_receipt(&value)?;
        let event = find_event(&value, "CampaignFinalized").ok_or_else(|| {
            ReconcilerError::EventDecode(format!(
                "transaction {} confirmed but carries no CampaignFinalized event",
                receipt.tx_hash
            ))
        })?;
        Ok(FinalizeEvent {
            campaign_id: u64_field(event, "campaignId")?,
            successful: bool_field(event, "successful")?,
            total_amount: micros_field(event, "totalAmount")?,
            tx_hash: receipt.tx_hash,
            block_number: receipt.block_number,
        })
    }

    async fn claim_refund(&self, chain_id: u64, backer: &str) -> Result<TxReceipt> {
        let value = self
            .call_write(
                "escrow_claimRefund",
                json!({
                    "contract": self.escrow_contract,
                    "campaignId": chain_id,
                    "backer": backer,
                }),
            )
            .await?;
        decode_receipt(&value)
    }

    async fn pledge_made_events(&self, chain_id: u64) -> Result<Vec<PledgeEvent>> {
        let value = self
            .call_read(
                "escrow_getEvents",
                json!({
                    "contract": self.escrow_contract,
                    "campaignId": chain_id,
                    "event": "PledgeMade",
                }),
            )
            .await?;
        let raw = value
            .as_array()
            .ok_or_else(|| ReconcilerError::StaleRead("event list is not an array".to_string()))?;

        // Undecodable entries are skipped, not fatal — the next sweep retries.
        let mut events = Vec::with_capacity(raw.len());
        for entry in raw {
            let receipt = match decode_receipt(entry) {
                Ok(r) => r,
                Err(e) => {
                    warn!("skipping undecodable pledge event: {e}");
                    continue;
                }
            };
            match decode_pledge_event(entry, &receipt) {
                Ok(ev) => events.push(ev),
                Err(e) => warn!("skipping undecodable pledge event: {e}"),
            }
        }
        Ok(events)
    }

    async fn pledge_event_for_tx(&self, tx_hash: &str) -> Result<Option<PledgeEvent>> {
        let value = self
            .call_read(
                "escrow_getTransactionEvents",
                json!({ "txHash": tx_hash }),
            )
            .await?;
        if value.is_null() {
            return Ok(None);
        }
        // A reverted transaction carries nothing we persist.
        if value.get("status").and_then(|v| v.as_str()) == Some("reverted") {
            return Ok(None);
        }
        let receipt = decode_receipt(&value)?;
        match find_event(&value, "PledgeMade") {
            Some(event) => decode_pledge_event(event, &receipt).map(Some),
            None => Ok(None),
        }
    }
}

// ─────────────────────────────────────────────────────────
// Decoding
// ─────────────────────────────────────────────────────────

/// Decode an `escrow_getCampaign` result. A zero-address creator means the
/// campaign does not exist on-chain yet and maps to `Ok(None)`.
pub fn decode_snapshot(chain_id: u64, value: &Value) -> Result<Option<EscrowSnapshot>> {
    if value.is_null() {
        return Ok(None);
    }
    let creator = str_field(value, "creator")?;
    if is_zero_address(&creator) {
        return Ok(None);
    }
    Ok(Some(EscrowSnapshot {
        campaign_id: chain_id,
        creator,
        goal: micros_field(value, "goal")?,
        total_pledged: micros_field(value, "totalPledged")?,
        deadline: i64_field(value, "deadline")?,
        finalized: bool_field(value, "finalized")?,
        successful: bool_field(value, "successful")?,
        platform_fee_bps: u64_field(value, "platformFeePercent")? as u32,
    }))
}

/// Decode a transaction receipt; a reverted receipt becomes `ChainRevert`
/// with the node's reason verbatim.
fn decode_receipt(value: &Value) -> Result<TxReceipt> {
    if value.get("status").and_then(|v| v.as_str()) == Some("reverted") {
        let reason = value
            .get("revertReason")
            .and_then(|v| v.as_str())
            .unwrap_or("execution reverted");
        return Err(ReconcilerError::ChainRevert(reason.to_string()));
    }
    Ok(TxReceipt {
        tx_hash: str_field(value, "txHash")?,
        block_number: i64_field(value, "blockNumber")?,
    })
}

/// Find a decoded event by name inside a receipt's `events` array, falling
/// back to the receipt itself when the node inlines a single event.
fn find_event<'a>(receipt: &'a Value, name: &str) -> Option<&'a Value> {
    if let Some(events) = receipt.get("events").and_then(|v| v.as_array()) {
        return events
            .iter()
            .find(|e| e.get("name").and_then(|n| n.as_str()) == Some(name));
    }
    (receipt.get("name").and_then(|n| n.as_str()) == Some(name)).then_some(receipt)
}

fn decode_pledge_event(event: &Value, receipt: &TxReceipt) -> Result<PledgeEvent> {
    Ok(PledgeEvent {
        campaign_id: u64_field(event, "campaignId")?,
        backer: str_field(event, "backer")?,
        amount: micros_field(event, "amount")?,
        tx_hash: receipt.tx_hash.clone(),
        block_number: receipt.block_number,
    })
}

/// Pull a base-unit amount out of a JSON value that may be a string or a
/// number (nodes disagree on how to render large integers).
fn micros_value(value: &Value, what: &str) -> Result<Usdc> {
    let micros = match value {
        Value::Number(n) => n.as_i64(),
        Value::String(s) => s.parse::<i64>().ok(),
        _ => None,
    };
    micros
        .map(Usdc::from_micros)
        .ok_or_else(|| ReconcilerError::StaleRead(format!("unreadable amount in `{what}`")))
}

fn micros_field(value: &Value, key: &str) -> Result<Usdc> {
    let v = value
        .get(key)
        .ok_or_else(|| ReconcilerError::StaleRead(format!("missing field `{key}`")))?;
    micros_value(v, key)
}

fn str_field(value: &Value, key: &str) -> Result<String> {
    value
        .get(key)
        .and_then(|v| v.as_str())
        .map(String::from)
        .ok_or_else(|| ReconcilerError::StaleRead(format!("missing field `{key}`")))
}

fn bool_field(value: &Value, key: &str) -> Result<bool> {
    value
        .get(key)
        .and_then(|v| v.as_bool())
        .ok_or_else(|| ReconcilerError::StaleRead(format!("missing field `{key}`")))
}

fn i64_field(value: &Value, key: &str) -> Result<i64> {
    let v = value
        .get(key)
        .ok_or_else(|| ReconcilerError::StaleRead(format!("missing field `{key}`")))?;
    match v {
        Value::Number(n) => n.as_i64(),
        Value::String(s) => s.parse::<i64>().ok(),
        _ => None,
    }
    .ok_or_else(|| ReconcilerError::StaleRead(format!("unreadable field `{key}`")))
}

fn u64_field(value: &Value, key: &str) -> Result<u64> {
    let v = value
        .get(key)
        .ok_or_else(|| ReconcilerError::StaleRead(format!("missing field `{key}`")))?;
    match v {
        Value::Number(n) => n.as_u64(),
        Value::String(s) => s.parse::<u64>().ok(),
        _ => None,
    }
    .ok_or_else(|| ReconcilerError::StaleRead(format!("unreadable field `{key}`")))
}

// ─────────────────────────────────────────────────────────
// In-memory chain for tests
// ─────────────────────────────────────────────────────────

#[cfg(test)]
pub(crate) mod mock {
    use std::collections::HashMap;
    use std::sync::Mutex;

    use super::*;

    #[derive(Debug, Default)]
    pub struct ChainCampaign {
        pub creator: String,
        pub goal: Usdc,
        pub total_pledged: Usdc,
        pub deadline: i64,
        pub finalized: bool,
        pub successful: bool,
        /// backer -> (amount, has_claimed_refund)
        pub pledges: HashMap<String, (Usdc, bool)>,
        pub events: Vec<PledgeEvent>,
    }

    #[derive(Debug, Default)]
    pub struct ChainState {
        pub campaigns: HashMap<u64, ChainCampaign>,
        pub balances: HashMap<String, Usdc>,
        pub allowances: HashMap<String, Usdc>,
        pub next_tx: u64,
        /// Every gateway method invocation, for precondition-gating tests.
        pub calls: Vec<String>,
        /// Scripted revert applied to the next write.
        pub revert_next: Option<String>,
    }

    /// An in-memory escrow chain that behaves like the contract: pledges
    /// accumulate, finalize compares total to goal, refunds are one-shot.
    #[derive(Debug, Default)]
    pub struct MockGateway {
        state: Mutex<ChainState>,
    }

    impl MockGateway {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn add_campaign(&self, chain_id: u64, creator: &str, goal: Usdc, deadline: i64) {
            let mut st = self.state.lock().unwrap();
            st.campaigns.insert(
                chain_id,
                ChainCampaign {
                    creator: creator.to_string(),
                    goal,
                    deadline,
                    ..Default::default()
                },
            );
        }

        pub fn set_balance(&self, address: &str, amount: Usdc) {
            self.state
                .lock()
                .unwrap()
                .balances
                .insert(address.to_string(), amount);
        }

        pub fn set_allowance(&self, owner: &str, amount: Usdc) {
            self.state
                .lock()
                .unwrap()
                .allowances
                .insert(owner.to_string(), amount);
        }

        /// Flip the on-chain finalized flag directly (as if some other actor
        /// finalized the campaign).
        pub fn finalize_on_chain(&self, chain_id: u64) {
            let mut st = self.state.lock().unwrap();
            let campaign = st.campaigns.get_mut(&chain_id).expect("campaign");
            campaign.finalized = true;
            campaign.successful = campaign.total_pledged >= campaign.goal;
        }

        /// Record a pledge on-chain without going through the gateway, as if
        /// it happened while this service was down.
        pub fn pledge_behind_our_back(&self, chain_id: u64, backer: &str, amount: Usdc) -> String {
            let mut st = self.state.lock().unwrap();
            let (tx_hash, block) = next_tx(&mut st);
            let campaign = st.campaigns.get_mut(&chain_id).expect("campaign");
            campaign.total_pledged = campaign.total_pledged.checked_add(amount).unwrap();
            let entry = campaign.pledges.entry(backer.to_string()).or_default();
            entry.0 = entry.0.checked_add(amount).unwrap();
            campaign.events.push(PledgeEvent {
                campaign_id: chain_id,
                backer: backer.to_string(),
                amount,
                tx_hash: tx_hash.clone(),
                block_number: block,
            });
            tx_hash
        }

        pub fn revert_next(&self, reason: &str) {
            self.state.lock().unwrap().revert_next = Some(reason.to_string());
        }

        pub fn calls(&self) -> Vec<String> {
            self.state.lock().unwrap().calls.clone()
        }

        fn take_revert(st: &mut ChainState) -> Result<()> {
            match st.revert_next.take() {
                Some(reason) => Err(ReconcilerError::ChainRevert(reason)),
                None => Ok(()),
            }
        }
    }

    fn next_tx(st: &mut ChainState) -> (String, i64) {
        st.next_tx += 1;
        (format!("0x{:064x}", st.next_tx), st.next_tx as i64)
    }

    fn snapshot_of(chain_id: u64, c: &ChainCampaign) -> EscrowSnapshot {
        EscrowSnapshot {
            campaign_id: chain_id,
            creator: c.creator.clone(),
            goal: c.goal,
            total_pledged: c.total_pledged,
            deadline: c.deadline,
            finalized: c.finalized,
            successful: c.successful,
            platform_fee_bps: 250,
        }
    }

    impl EscrowGateway for MockGateway {
        async fn get_campaign(&self, chain_id: u64) -> Result<Option<EscrowSnapshot>> {
            let mut st = self.state.lock().unwrap();
            st.calls.push(format!("get_campaign:{chain_id}"));
            Ok(st.campaigns.get(&chain_id).map(|c| snapshot_of(chain_id, c)))
        }

        async fn get_pledge(&self, chain_id: u64, backer: &str) -> Result<BackerPledge> {
            let mut st = self.state.lock().unwrap();
            st.calls.push(format!("get_pledge:{chain_id}:{backer}"));
            let (amount, has_claimed_refund) = st
                .campaigns
                .get(&chain_id)
                .and_then(|c| c.pledges.get(backer))
                .copied()
                .unwrap_or((Usdc::ZERO, false));
            Ok(BackerPledge {
                amount,
                has_claimed_refund,
            })
        }

        async fn token_balance(&self, address: &str) -> Result<Usdc> {
            let mut st = self.state.lock().unwrap();
            st.calls.push(format!("token_balance:{address}"));
            Ok(st.balances.get(address).copied().unwrap_or(Usdc::ZERO))
        }

        async fn token_allowance(&self, owner: &str) -> Result<Usdc> {
            let mut st = self.state.lock().unwrap();
            st.calls.push(format!("token_allowance:{owner}"));
            Ok(st.allowances.get(owner).copied().unwrap_or(Usdc::ZERO))
        }

        async fn approve(&self, owner: &str, amount: Usdc) -> Result<TxReceipt> {
            let mut st = self.state.lock().unwrap();
            st.calls.push(format!("approve:{owner}:{amount}"));
            Self::take_revert(&mut st)?;
            st.allowances.insert(owner.to_string(), amount);
            let (tx_hash, block_number) = next_tx(&mut st);
            Ok(TxReceipt {
                tx_hash,
                block_number,
            })
        }

        async fn pledge(&self, chain_id: u64, backer: &str, amount: Usdc) -> Result<PledgeEvent> {
            let mut st = self.state.lock().unwrap();
            st.calls.push(format!("pledge:{chain_id}:{backer}:{amount}"));
            Self::take_revert(&mut st)?;
            if !st.campaigns.contains_key(&chain_id) {
                return Err(ReconcilerError::ChainRevert("campaign not found".to_string()));
            }
            if st.campaigns[&chain_id].finalized {
                return Err(ReconcilerError::ChainRevert("already finalized".to_string()));
            }
            let (tx_hash, block_number) = next_tx(&mut st);
            let campaign = st.campaigns.get_mut(&chain_id).unwrap();
            campaign.total_pledged = campaign.total_pledged.checked_add(amount).unwrap();
            let entry = campaign.pledges.entry(backer.to_string()).or_default();
            entry.0 = entry.0.checked_add(amount).unwrap();
            let event = PledgeEvent {
                campaign_id: chain_id,
                backer: backer.to_string(),
                amount,
                tx_hash,
                block_number,
            };
            campaign.events.push(event.clone());
            Ok(event)
        }

        async fn finalize_campaign(&self, chain_id: u64, caller: &str) -> Result<FinalizeEvent> {
            let mut st = self.state.lock().unwrap();
            st.calls.push(format!("finalize:{chain_id}:{caller}"));
            Self::take_revert(&mut st)?;
            let (tx_hash, block_number) = next_tx(&mut st);
            let campaign = st
                .campaigns
                .get_mut(&chain_id)
                .ok_or_else(|| ReconcilerError::ChainRevert("campaign not found".to_string()))?;
            if campaign.finalized {
                return Err(ReconcilerError::ChainRevert("already finalized".to_string()));
            }
            campaign.finalized = true;
            campaign.successful = campaign.total_pledged >= campaign.goal;
            Ok(FinalizeEvent {
                campaign_id: chain_id,
                successful: campaign.successful,
                total_amount: campaign.total_pledged,
                tx_hash,
                block_number,
            })
        }

        async fn claim_refund(&self, chain_id: u64, backer: &str) -> Result<TxReceipt> {
            let mut st = self.state.lock().unwrap();
            st.calls.push(format!("claim_refund:{chain_id}:{backer}"));
            Self::take_revert(&mut st)?;
            let (tx_hash, block_number) = next_tx(&mut st);
            let campaign = st
                .campaigns
                .get_mut(&chain_id)
                .ok_or_else(|| ReconcilerError::ChainRevert("campaign not found".to_string()))?;
            if !campaign.finalized || campaign.successful {
                return Err(ReconcilerError::ChainRevert("campaign has not failed".to_string()));
            }
            let entry = campaign
                .pledges
                .get_mut(backer)
                .filter(|(amount, _)| !amount.is_zero())
                .ok_or_else(|| ReconcilerError::ChainRevert("nothing to refund".to_string()))?;
            if entry.1 {
                return Err(ReconcilerError::ChainRevert("already claimed".to_string()));
            }
            entry.1 = true;
            Ok(TxReceipt {
                tx_hash,
                block_number,
            })
        }

        async fn pledge_made_events(&self, chain_id: u64) -> Result<Vec<PledgeEvent>> {
            let mut st = self.state.lock().unwrap();
            st.calls.push(format!("pledge_made_events:{chain_id}"));
            Ok(st
                .campaigns
                .get(&chain_id)
                .map(|c| c.events.clone())
                .unwrap_or_default())
        }

        async fn pledge_event_for_tx(&self, tx_hash: &str) -> Result<Option<PledgeEvent>> {
            let mut st = self.state.lock().unwrap();
            st.calls.push(format!("pledge_event_for_tx:{tx_hash}"));
            Ok(st
                .campaigns
                .values()
                .flat_map(|c| c.events.iter())
                .find(|e| e.tx_hash == tx_hash)
                .cloned())
        }
    }
}

// ─────────────────────────────────────────────────────────
// Unit tests
// ─────────────────────────────────────────────────────────
