//! Payment attempts and offline settlement.

use crate::models::{NewPayment, PaymentChannel, PaymentMethod, RegistrationPayment};
use crate::startup::AppState;
use axum::{
    extract::{Path, State},
    http::StatusCode,
    Json,
};
use rust_decimal::Decimal;
use serde::Deserialize;
use service_core::error::AppError;
use uuid::Uuid;

#[derive(Debug, Deserialize)]
pub struct AddPaymentRequest {
    pub channel: PaymentChannel,
    pub method: PaymentMethod,
    pub amount: Decimal,
}

pub async fn add_payment(
    State(state): State<AppState>,
    Path(order_code): Path<String>,
    Json(request): Json<AddPaymentRequest>,
) -> Result<(StatusCode, Json<RegistrationPayment>), AppError> {
    tracing::info!(
        order_code = %order_code,
        channel = request.channel.as_str(),
        amount = %request.amount,
        "Adding payment"
    );

    let payment = state
        .payments
        .add_payment(
            &order_code,
            NewPayment {
                channel: request.channel,
                method: request.method,
                amount: request.amount,
            },
        )
        .await?;

    Ok((StatusCode::CREATED, Json(payment)))
}

pub async fn confirm_offline(
    State(state): State<AppState>,
    Path(payment_id): Path<Uuid>,
) -> Result<Json<RegistrationPayment>, AppError> {
    Ok(Json(state.payments.confirm_offline(payment_id).await?))
}

pub async fn deny_offline(
    State(state): State<AppState>,
    Path(payment_id): Path<Uuid>,
) -> Result<Json<RegistrationPayment>, AppError> {
    Ok(Json(state.payments.deny_offline(payment_id).await?))
}
