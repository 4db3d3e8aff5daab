//! HTTP surface
//!
//! Thin handlers over the engine orchestrators. Payment completion is
//! the webhook target for the payment provider and is safe to retry.

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use uuid::Uuid;

use tunnelbot_engine::{CompletionOutcome, ReconcileOutcome};
use tunnelbot_shared::{EngineError, Notification, Payment, Subscription};

use crate::error::ApiResult;
use crate::state::AppState;

pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/payments", post(create_payment))
        .route("/payments/{id}/complete", post(complete_payment))
        .route("/payments/{id}/fail", post(fail_payment))
        .route("/payments/{id}/refund", post(refund_payment))
        .route("/users/{id}/trial", post(start_trial))
        .route("/users/{id}/reconcile", post(reconcile))
        .route("/users/{id}/notifications", get(list_notifications))
        .route("/users/{id}/referral-link", post(issue_referral_link))
        .route("/users/{id}/promo", post(redeem_promo))
        .route("/notifications/{id}/read", post(mark_notification_read))
        .route("/referrals", post(register_referral))
        .route("/promos", post(create_promo))
        .with_state(state)
}

async fn healthz(State(state): State<AppState>) -> ApiResult<&'static str> {
    sqlx::query_scalar::<_, i32>("SELECT 1")
        .fetch_one(&state.pool)
        .await
        .map_err(EngineError::from)?;
    Ok("ok")
}

#[derive(Deserialize)]
struct CreatePaymentRequest {
    user_id: Uuid,
    plan_id: Uuid,
}

#[derive(Serialize)]
struct PaymentResponse {
    id: Uuid,
    user_id: Uuid,
    plan_id: Uuid,
    amount_cents: i64,
    currency: String,
    status: String,
}

impl From<Payment> for PaymentResponse {
    fn from(p: Payment) -> Self {
        Self {
            id: p.id,
            user_id: p.user_id,
            plan_id: p.plan_id,
            amount_cents: p.amount_cents,
            currency: p.currency,
            status: p.status.as_str().to_string(),
        }
    }
}

async fn create_payment(
    State(state): State<AppState>,
    Json(req): Json<CreatePaymentRequest>,
) -> ApiResult<(StatusCode, Json<PaymentResponse>)> {
    let payment = state.payments.create_payment(req.user_id, req.plan_id).await?;
    Ok((StatusCode::CREATED, Json(payment.into())))
}

#[derive(Serialize)]
struct CompletionResponse {
    status: &'static str,
    provisioned: bool,
}

async fn complete_payment(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> ApiResult<Json<CompletionResponse>> {
    let outcome = state.payments.complete_payment(id).await?;
    let response = match outcome {
        CompletionOutcome::Completed { provisioned } => CompletionResponse {
            status: "completed",
            provisioned,
        },
        CompletionOutcome::AlreadyCompleted => CompletionResponse {
            status: "already_completed",
            provisioned: true,
        },
    };
    Ok(Json(response))
}

async fn fail_payment(State(state): State<AppState>, Path(id): Path<Uuid>) -> ApiResult<StatusCode> {
    state.payments.fail_payment(id).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn refund_payment(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> ApiResult<StatusCode> {
    state.payments.refund_payment(id).await?;
    Ok(StatusCode::NO_CONTENT)
}

#[derive(Serialize)]
struct SubscriptionResponse {
    id: Uuid,
    starts_at: OffsetDateTime,
    ends_at: OffsetDateTime,
}

impl From<Subscription> for SubscriptionResponse {
    fn from(s: Subscription) -> Self {
        Self {
            id: s.id,
            starts_at: s.starts_at,
            ends_at: s.ends_at,
        }
    }
}

async fn start_trial(
    State(state): State<AppState>,
    Path(user_id): Path<Uuid>,
) -> ApiResult<(StatusCode, Json<SubscriptionResponse>)> {
    let sub = state.payments.start_trial(user_id).await?;
    Ok((StatusCode::CREATED, Json(sub.into())))
}

#[derive(Serialize)]
struct ReconcileResponse {
    outcome: &'static str,
}

async fn reconcile(
    State(state): State<AppState>,
    Path(user_id): Path<Uuid>,
) -> ApiResult<Json<ReconcileResponse>> {
    let outcome = match state.vpn.reconcile(user_id).await? {
        ReconcileOutcome::Unchanged => "unchanged",
        ReconcileOutcome::Enabled => "enabled",
        ReconcileOutcome::Disabled => "disabled",
        ReconcileOutcome::Repaired => "repaired",
    };
    Ok(Json(ReconcileResponse { outcome }))
}

#[derive(Serialize)]
struct NotificationResponse {
    id: Uuid,
    kind: String,
    message: String,
    created_at: OffsetDateTime,
}

async fn list_notifications(
    State(state): State<AppState>,
    Path(user_id): Path<Uuid>,
) -> ApiResult<Json<Vec<NotificationResponse>>> {
    let mut tx = state.ledger.begin().await?;
    let notifications = tx.unread_notifications(user_id).await?;
    let body = notifications
        .into_iter()
        .map(|n: Notification| NotificationResponse {
            id: n.id,
            kind: n.kind.as_str().to_string(),
            message: n.message,
            created_at: n.created_at,
        })
        .collect();
    Ok(Json(body))
}

async fn mark_notification_read(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> ApiResult<StatusCode> {
    let mut tx = state.ledger.begin().await?;
    tx.mark_notification_read(id).await?;
    tx.commit().await?;
    Ok(StatusCode::NO_CONTENT)
}

/// The referrer comes either as an id or as an invite code from their
/// referral link.
#[derive(Deserialize)]
struct RegisterReferralRequest {
    referee_id: Uuid,
    referrer_id: Option<Uuid>,
    code: Option<String>,
}

#[derive(Serialize)]
struct ReferralResponse {
    id: Uuid,
    referrer_id: Uuid,
    referee_id: Uuid,
}

async fn register_referral(
    State(state): State<AppState>,
    Json(req): Json<RegisterReferralRequest>,
) -> ApiResult<(StatusCode, Json<ReferralResponse>)> {
    let mut tx = state.ledger.begin().await?;
    let referrer_id = match (req.referrer_id, req.code) {
        (Some(id), _) => id,
        (None, Some(code)) => {
            tx.referral_link_by_code(&code)
                .await?
                .ok_or(EngineError::NotFound("referral link"))?
                .user_id
        }
        (None, None) => return Err(EngineError::NotFound("referrer").into()),
    };
    let referral = state
        .referrals
        .register_referral(tx.as_mut(), referrer_id, req.referee_id)
        .await?;
    tx.commit().await?;
    Ok((
        StatusCode::CREATED,
        Json(ReferralResponse {
            id: referral.id,
            referrer_id: referral.referrer_id,
            referee_id: referral.referee_id,
        }),
    ))
}

#[derive(Deserialize)]
struct CreatePromoRequest {
    code: String,
    bonus_days: i32,
    usage_limit: i32,
    expires_at: Option<OffsetDateTime>,
}

#[derive(Serialize)]
struct PromoResponse {
    id: Uuid,
    code: String,
    bonus_days: i32,
    usage_limit: i32,
    expires_at: Option<OffsetDateTime>,
}

async fn create_promo(
    State(state): State<AppState>,
    Json(req): Json<CreatePromoRequest>,
) -> ApiResult<(StatusCode, Json<PromoResponse>)> {
    let promo = state
        .promos
        .create_code(&req.code, req.bonus_days, req.usage_limit, req.expires_at)
        .await?;
    Ok((
        StatusCode::CREATED,
        Json(PromoResponse {
            id: promo.id,
            code: promo.code,
            bonus_days: promo.bonus_days,
            usage_limit: promo.usage_limit,
            expires_at: promo.expires_at,
        }),
    ))
}

#[derive(Deserialize)]
struct RedeemPromoRequest {
    code: String,
}

#[derive(Serialize)]
struct RedemptionResponse {
    code: String,
    bonus_days: i64,
    ends_at: OffsetDateTime,
}

async fn redeem_promo(
    State(state): State<AppState>,
    Path(user_id): Path<Uuid>,
    Json(req): Json<RedeemPromoRequest>,
) -> ApiResult<Json<RedemptionResponse>> {
    let redemption = state.promos.redeem(user_id, &req.code).await?;
    Ok(Json(RedemptionResponse {
        code: redemption.code,
        bonus_days: redemption.bonus_days,
        ends_at: redemption.new_end,
    }))
}

#[derive(Serialize)]
struct ReferralLinkResponse {
    code: String,
}

async fn issue_referral_link(
    State(state): State<AppState>,
    Path(user_id): Path<Uuid>,
) -> ApiResult<Json<ReferralLinkResponse>> {
    let mut tx = state.ledger.begin().await?;
    let link = state.referrals.issue_link(tx.as_mut(), user_id).await?;
    tx.commit().await?;
    Ok(Json(ReferralLinkResponse { code: link.code }))
}
