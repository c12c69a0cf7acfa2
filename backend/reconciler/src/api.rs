//! Axum REST API handlers.

use std::sync::Arc;

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::{Deserialize, Serialize};
use sqlx::SqlitePool;

use crate::amount::Usdc;
use crate::db;
use crate::errors::{ReconcilerError, Result};
use crate::escrow::EscrowClient;
use crate::finalize;
use crate::models::{
    CampaignRecord, CampaignStatus, MilestoneRecord, NewCampaign, NewMilestone, NewTier,
    PledgeRecord, PledgeStatus, TierRecord,
};
use crate::pledge;
use crate::reconcile;

#[derive(Clone)]
pub struct ApiState {
    pub pool: SqlitePool,
    pub gateway: EscrowClient,
}

// ─────────────────────────────────────────────────────────
// Request shapes
// ─────────────────────────────────────────────────────────

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateCampaignRequest {
    pub creator: String,
    pub title: String,
    pub description: String,
    pub story: Option<String>,
    pub category: Option<String>,
    #[serde(default)]
    pub tags: Vec<String>,
    pub cover_image: Option<String>,
    #[serde(default)]
    pub gallery: Vec<String>,
    pub video_url: Option<String>,
    pub goal_amount: Usdc,
    pub duration_days: i64,
    #[serde(default)]
    pub tiers: Vec<TierInput>,
    #[serde(default)]
    pub milestones: Vec<MilestoneInput>,
}

#[derive(Deserialize)]
pub struct TierInput {
    pub title: String,
    pub description: Option<String>,
    pub amount: Usdc,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MilestoneInput {
    pub title: String,
    pub description: Option<String>,
    pub target_date: Option<i64>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BlockchainUpdateRequest {
    pub blockchain_campaign_id: Option<i64>,
    pub status: Option<CampaignStatus>,
    pub raised_amount: Option<Usdc>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConfirmPledgeRequest {
    pub wallet_address: String,
    pub amount: Usdc,
    pub tx_hash: String,
}

#[derive(Deserialize)]
pub struct IntakePledgeRequest {
    pub backer: String,
    pub amount: Usdc,
}

#[derive(Deserialize)]
pub struct FinalizeRequest {
    pub caller: String,
}

#[derive(Deserialize)]
pub struct RefundRequest {
    pub backer: String,
}

// ─────────────────────────────────────────────────────────
// Response shapes
// ─────────────────────────────────────────────────────────

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CampaignResponse {
    pub id: i64,
    pub creator: String,
    pub title: String,
    pub description: String,
    pub story: Option<String>,
    pub category: Option<String>,
    pub tags: Vec<String>,
    pub cover_image: Option<String>,
    pub gallery: Vec<String>,
    pub video_url: Option<String>,
    pub goal_amount: Usdc,
    pub currency: String,
    pub duration_days: i64,
    pub start_date: i64,
    pub end_date: i64,
    pub raised_amount: Usdc,
    pub backers_count: i64,
    pub status: CampaignStatus,
    pub blockchain_campaign_id: Option<i64>,
    pub created_at: i64,
    pub updated_at: i64,
}

impl From<CampaignRecord> for CampaignResponse {
    fn from(c: CampaignRecord) -> Self {
        let goal_amount = c.goal();
        let raised_amount = c.raised();
        CampaignResponse {
            id: c.id,
            creator: c.creator,
            title: c.title,
            description: c.description,
            story: c.story,
            category: c.category,
            tags: parse_string_list(c.tags.as_deref()),
            cover_image: c.cover_image,
            gallery: parse_string_list(c.gallery.as_deref()),
            video_url: c.video_url,
            goal_amount,
            currency: c.currency,
            duration_days: c.duration_days,
            start_date: c.start_date,
            end_date: c.end_date,
            raised_amount,
            backers_count: c.backers_count,
            status: c.status,
            blockchain_campaign_id: c.blockchain_campaign_id,
            created_at: c.created_at,
            updated_at: c.updated_at,
        }
    }
}

fn parse_string_list(raw: Option<&str>) -> Vec<String> {
    raw.and_then(|s| serde_json::from_str(s).ok()).unwrap_or_default()
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TierResponse {
    pub id: i64,
    pub title: String,
    pub description: Option<String>,
    pub amount: Usdc,
}

impl From<TierRecord> for TierResponse {
    fn from(t: TierRecord) -> Self {
        TierResponse {
            id: t.id,
            title: t.title,
            description: t.description,
            amount: Usdc::from_micros(t.amount),
        }
    }
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MilestoneResponse {
    pub id: i64,
    pub title: String,
    pub description: Option<String>,
    pub target_date: Option<i64>,
}

impl From<MilestoneRecord> for MilestoneResponse {
    fn from(m: MilestoneRecord) -> Self {
        MilestoneResponse {
            id: m.id,
            title: m.title,
            description: m.description,
            target_date: m.target_date,
        }
    }
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PledgeResponse {
    pub id: i64,
    pub campaign_id: i64,
    pub backer: String,
    pub amount: Usdc,
    pub currency: String,
    pub status: PledgeStatus,
    pub tx_hash: String,
    pub block_number: i64,
    pub created_at: i64,
}

impl From<PledgeRecord> for PledgeResponse {
    fn from(p: PledgeRecord) -> Self {
        PledgeResponse {
            id: p.id,
            campaign_id: p.campaign_id,
            backer: p.backer,
            amount: Usdc::from_micros(p.amount),
            currency: p.currency,
            status: p.status,
            tx_hash: p.tx_hash,
            block_number: p.block_number,
            created_at: p.created_at,
        }
    }
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CampaignDetailResponse {
    #[serde(flatten)]
    pub campaign: CampaignResponse,
    pub tiers: Vec<TierResponse>,
    pub milestones: Vec<MilestoneResponse>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PledgeConfirmResponse {
    pub recorded: bool,
    pub synced: bool,
    pub amount: Usdc,
    pub tx_hash: String,
    pub campaign_status: CampaignStatus,
    pub raised_amount: Usdc,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FinalizeResponse {
    pub status: CampaignStatus,
    pub raised_amount: Usdc,
    pub successful: bool,
    pub tx_hash: String,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RefundResponse {
    pub amount: Usdc,
    pub tx_hash: String,
    pub pledge_marked: bool,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReconcileResponse {
    pub status: CampaignStatus,
    pub raised_amount: Usdc,
    pub transitioned: bool,
}

#[derive(Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub version: &'static str,
}

#[derive(Serialize)]
pub struct ErrorResponse {
    pub error: String,
}

fn fail(e: ReconcilerError) -> Response {
    (
        e.status(),
        Json(ErrorResponse {
            error: e.to_string(),
        }),
    )
        .into_response()
}

// ─────────────────────────────────────────────────────────
// Handlers
// ─────────────────────────────────────────────────────────

/// `GET /health`
pub async fn health() -> impl IntoResponse {
    Json(HealthResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
    })
}

/// `POST /campaigns`
pub async fn create_campaign(
    State(state): State<Arc<ApiState>>,
    Json(req): Json<CreateCampaignRequest>,
) -> Response {
    match create_campaign_inner(&state.pool, req).await {
        Ok(detail) => (StatusCode::CREATED, Json(detail)).into_response(),
        Err(e) => fail(e),
    }
}

async fn create_campaign_inner(
    pool: &SqlitePool,
    req: CreateCampaignRequest,
) -> Result<CampaignDetailResponse> {
    if req.creator.trim().is_empty() {
        return Err(ReconcilerError::Validation("creator is required".to_string()));
    }
    if req.title.trim().is_empty() {
        return Err(ReconcilerError::Validation("title is required".to_string()));
    }
    if req.goal_amount.is_zero() {
        return Err(ReconcilerError::Validation(
            "goal amount must be positive".to_string(),
        ));
    }
    if req.duration_days <= 0 {
        return Err(ReconcilerError::Validation(
            "duration must be at least one day".to_string(),
        ));
    }

    let new = NewCampaign {
        creator: req.creator,
        title: req.title,
        description: req.description,
        story: req.story,
        category: req.category,
        tags: encode_string_list(&req.tags)?,
        cover_image: req.cover_image,
        gallery: encode_string_list(&req.gallery)?,
        video_url: req.video_url,
        goal_amount: req.goal_amount,
        duration_days: req.duration_days,
        start_date: chrono::Utc::now().timestamp(),
    };
    let tiers: Vec<NewTier> = req
        .tiers
        .into_iter()
        .map(|t| NewTier {
            title: t.title,
            description: t.description,
            amount: t.amount,
        })
        .collect();
    let milestones: Vec<NewMilestone> = req
        .milestones
        .into_iter()
        .map(|m| NewMilestone {
            title: m.title,
            description: m.description,
            target_date: m.target_date,
        })
        .collect();

    let campaign = db::create_campaign(pool, &new, &tiers, &milestones).await?;
    campaign_detail(pool, campaign).await
}

fn encode_string_list(items: &[String]) -> Result<Option<String>> {
    if items.is_empty() {
        Ok(None)
    } else {
        Ok(Some(serde_json::to_string(items)?))
    }
}

async fn campaign_detail(
    pool: &SqlitePool,
    campaign: CampaignRecord,
) -> Result<CampaignDetailResponse> {
    let tiers = db::list_tiers(pool, campaign.id).await?;
    let milestones = db::list_milestones(pool, campaign.id).await?;
    Ok(CampaignDetailResponse {
        campaign: campaign.into(),
        tiers: tiers.into_iter().map(Into::into).collect(),
        milestones: milestones.into_iter().map(Into::into).collect(),
    })
}

/// `GET /campaigns`
pub async fn list_campaigns(State(state): State<Arc<ApiState>>) -> Response {
    match db::list_campaigns(&state.pool).await {
        Ok(campaigns) => Json(
            campaigns
                .into_iter()
                .map(CampaignResponse::from)
                .collect::<Vec<_>>(),
        )
        .into_response(),
        Err(e) => fail(e),
    }
}

/// `GET /campaigns/:id`
pub async fn get_campaign(
    State(state): State<Arc<ApiState>>,
    Path(id): Path<i64>,
) -> Response {
    match get_campaign_inner(&state.pool, id).await {
        Ok(detail) => Json(detail).into_response(),
        Err(e) => fail(e),
    }
}

async fn get_campaign_inner(pool: &SqlitePool, id: i64) -> Result<CampaignDetailResponse> {
    let campaign = db::get_campaign(pool, id)
        .await?
        .ok_or_else(|| ReconcilerError::NotFound(format!("campaign {id}")))?;
    campaign_detail(pool, campaign).await
}

/// `GET /creators/:address/campaigns`
pub async fn campaigns_by_creator(
    State(state): State<Arc<ApiState>>,
    Path(address): Path<String>,
) -> Response {
    match db::list_campaigns_by_creator(&state.pool, &address).await {
        Ok(campaigns) => Json(
            campaigns
                .into_iter()
                .map(CampaignResponse::from)
                .collect::<Vec<_>>(),
        )
        .into_response(),
        Err(e) => fail(e),
    }
}

/// `GET /backers/:address/campaigns`
pub async fn campaigns_by_backer(
    State(state): State<Arc<ApiState>>,
    Path(address): Path<String>,
) -> Response {
    match db::list_campaigns_by_backer(&state.pool, &address).await {
        Ok(campaigns) => Json(
            campaigns
                .into_iter()
                .map(CampaignResponse::from)
                .collect::<Vec<_>>(),
        )
        .into_response(),
        Err(e) => fail(e),
    }
}

/// `GET /campaigns/:id/pledges`
pub async fn pledges_for_campaign(
    State(state): State<Arc<ApiState>>,
    Path(id): Path<i64>,
) -> Response {
    match db::list_pledges_for_campaign(&state.pool, id).await {
        Ok(pledges) => Json(
            pledges
                .into_iter()
                .map(PledgeResponse::from)
                .collect::<Vec<_>>(),
        )
        .into_response(),
        Err(e) => fail(e),
    }
}

/// `GET /backers/:address/pledges`
pub async fn pledges_by_backer(
    State(state): State<Arc<ApiState>>,
    Path(address): Path<String>,
) -> Response {
    match db::list_pledges_by_backer(&state.pool, &address).await {
        Ok(pledges) => Json(
            pledges
                .into_iter()
                .map(PledgeResponse::from)
                .collect::<Vec<_>>(),
        )
        .into_response(),
        Err(e) => fail(e),
    }
}

/// `POST /campaigns/:id/blockchain`
///
/// Sparse partial update of chain-derived fields; the deploy workflow uses
/// it to attach the escrow contract's campaign index.
pub async fn update_blockchain(
    State(state): State<Arc<ApiState>>,
    Path(id): Path<i64>,
    Json(req): Json<BlockchainUpdateRequest>,
) -> Response {
    let update = db::BlockchainUpdate {
        blockchain_campaign_id: req.blockchain_campaign_id,
        status: req.status,
        raised_amount: req.raised_amount,
    };
    match db::update_blockchain_data(&state.pool, id, &update).await {
        Ok(campaign) => Json(CampaignResponse::from(campaign)).into_response(),
        Err(e) => fail(e),
    }
}

/// `POST /campaigns/:id/pledges`
///
/// Pledge confirmation: verifies the decoded on-chain event behind the
/// submitted transaction hash, persists the pledge, reconciles.
pub async fn confirm_pledge(
    State(state): State<Arc<ApiState>>,
    Path(id): Path<i64>,
    Json(req): Json<ConfirmPledgeRequest>,
) -> Response {
    match pledge::confirm(
        &state.pool,
        &state.gateway,
        id,
        &req.wallet_address,
        req.amount,
        &req.tx_hash,
    )
    .await
    {
        Ok(outcome) => Json(PledgeConfirmResponse {
            recorded: outcome.recorded,
            synced: outcome.synced,
            amount: outcome.amount,
            tx_hash: outcome.tx_hash,
            campaign_status: outcome.campaign_status,
            raised_amount: outcome.raised_amount,
        })
        .into_response(),
        Err(e) => fail(e),
    }
}

/// `POST /campaigns/:id/pledge`
///
/// Full intake sequence through the escrow node: allowance check,
/// exact-amount approval, pledge submission, persist, reconcile.
pub async fn intake_pledge(
    State(state): State<Arc<ApiState>>,
    Path(id): Path<i64>,
    Json(req): Json<IntakePledgeRequest>,
) -> Response {
    match pledge::execute(&state.pool, &state.gateway, id, &req.backer, req.amount).await {
        Ok(outcome) => Json(PledgeConfirmResponse {
            recorded: outcome.recorded,
            synced: outcome.synced,
            amount: outcome.amount,
            tx_hash: outcome.tx_hash,
            campaign_status: outcome.campaign_status,
            raised_amount: outcome.raised_amount,
        })
        .into_response(),
        Err(e) => fail(e),
    }
}

/// `POST /campaigns/:id/finalize`
pub async fn finalize_campaign(
    State(state): State<Arc<ApiState>>,
    Path(id): Path<i64>,
    Json(req): Json<FinalizeRequest>,
) -> Response {
    match finalize::finalize_campaign(&state.pool, &state.gateway, id, &req.caller).await {
        Ok(outcome) => Json(FinalizeResponse {
            status: outcome.status,
            raised_amount: outcome.raised_amount,
            successful: outcome.successful,
            tx_hash: outcome.tx_hash,
        })
        .into_response(),
        Err(e) => fail(e),
    }
}

/// `POST /campaigns/:id/refund`
pub async fn claim_refund(
    State(state): State<Arc<ApiState>>,
    Path(id): Path<i64>,
    Json(req): Json<RefundRequest>,
) -> Response {
    match finalize::claim_refund(&state.pool, &state.gateway, id, &req.backer).await {
        Ok(outcome) => Json(RefundResponse {
            amount: outcome.amount,
            tx_hash: outcome.tx_hash,
            pledge_marked: outcome.pledge_marked,
        })
        .into_response(),
        Err(e) => fail(e),
    }
}

/// `POST /campaigns/:id/reconcile`
///
/// Force a reconciliation pass against a fresh escrow snapshot.
pub async fn reconcile_campaign(
    State(state): State<Arc<ApiState>>,
    Path(id): Path<i64>,
) -> Response {
    match reconcile_inner(&state, id).await {
        Ok(outcome) => Json(ReconcileResponse {
            status: outcome.status,
            raised_amount: outcome.raised_amount,
            transitioned: outcome.transitioned,
        })
        .into_response(),
        Err(e) => fail(e),
    }
}

async fn reconcile_inner(state: &ApiState, id: i64) -> Result<reconcile::ReconcileOutcome> {
    let campaign = db::get_campaign(&state.pool, id)
        .await?
        .ok_or_else(|| ReconcilerError::NotFound(format!("campaign {id}")))?;
    reconcile::reconcile_from_chain(&state.pool, &state.gateway, &campaign).await
}
