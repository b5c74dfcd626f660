//! Quote, create, lookup and cancel.

use crate::models::{BuyerData, NewAttendee, PaymentChannel, PaymentMethod};
use crate::services::{CreateRegistration, PaymentChoice, Quote, RegistrationDetails};
use crate::startup::AppState;
use crate::utils::ValidatedJson;
use axum::{
    extract::{Path, State},
    http::StatusCode,
    Json,
};
use serde::{Deserialize, Serialize};
use service_core::error::AppError;
use std::collections::BTreeMap;
use uuid::Uuid;
use validator::Validate;

#[derive(Debug, Serialize, Deserialize, Validate)]
pub struct BatchSelection {
    pub batch_id: Uuid,
    #[validate(range(min = 1, max = 100))]
    pub quantity: i32,
}

#[derive(Debug, Deserialize, Validate)]
pub struct QuoteRequest {
    #[validate(length(min = 1, max = 50), nested)]
    pub batches: Vec<BatchSelection>,
    #[validate(length(min = 1, max = 64))]
    pub coupon_code: Option<String>,
}

#[derive(Debug, Clone, Copy, Deserialize)]
pub struct PaymentSelection {
    pub channel: PaymentChannel,
    pub method: PaymentMethod,
}

#[derive(Debug, Deserialize, Validate)]
pub struct CreateRegistrationRequest {
    #[validate(nested)]
    pub buyer: BuyerData,
    #[validate(length(min = 1, max = 100), nested)]
    pub attendees: Vec<NewAttendee>,
    #[validate(length(min = 1, max = 64))]
    pub coupon_code: Option<String>,
    /// Required for single-payment events with a non-zero price.
    pub payment: Option<PaymentSelection>,
}

pub async fn quote(
    State(state): State<AppState>,
    Path(event_id): Path<Uuid>,
    ValidatedJson(request): ValidatedJson<QuoteRequest>,
) -> Result<Json<Quote>, AppError> {
    let mut per_batch = BTreeMap::new();
    for selection in &request.batches {
        *per_batch.entry(selection.batch_id).or_insert(0) += selection.quantity;
    }

    let quote = state
        .registrations
        .quote(event_id, &per_batch, request.coupon_code.as_deref())
        .await?;
    Ok(Json(quote))
}

pub async fn create_registration(
    State(state): State<AppState>,
    Path(event_id): Path<Uuid>,
    ValidatedJson(request): ValidatedJson<CreateRegistrationRequest>,
) -> Result<(StatusCode, Json<RegistrationDetails>), AppError> {
    tracing::info!(
        event_id = %event_id,
        attendees = request.attendees.len(),
        coupon = request.coupon_code.is_some(),
        "Creating registration"
    );

    let details = state
        .registrations
        .create(
            event_id,
            CreateRegistration {
                buyer: request.buyer,
                attendees: request.attendees,
                coupon_code: request.coupon_code,
                payment: request.payment.map(|p| PaymentChoice {
                    channel: p.channel,
                    method: p.method,
                }),
            },
        )
        .await?;

    Ok((StatusCode::CREATED, Json(details)))
}

pub async fn get_registration(
    State(state): State<AppState>,
    Path(order_code): Path<String>,
) -> Result<Json<RegistrationDetails>, AppError> {
    Ok(Json(state.registrations.get(&order_code).await?))
}

pub async fn cancel_registration(
    State(state): State<AppState>,
    Path(order_code): Path<String>,
) -> Result<Json<RegistrationDetails>, AppError> {
    tracing::info!(order_code = %order_code, "Cancelling registration");
    Ok(Json(state.registrations.cancel(&order_code).await?))
}
