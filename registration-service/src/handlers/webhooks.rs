use crate::services::WebhookNotice;
use crate::startup::AppState;
use axum::{
    extract::{Path, State},
    Json,
};
use serde_json::{json, Value};
use service_core::error::AppError;

/// Provider status callback. Ignored reports still answer 200 so the
/// provider stops redelivering; only processing failures surface as 5xx.
pub async fn receive_webhook(
    State(state): State<AppState>,
    Path(provider): Path<String>,
    Json(notice): Json<WebhookNotice>,
) -> Result<Json<Value>, AppError> {
    let outcome = state.reconciler.handle(&provider, notice).await?;

    Ok(Json(json!({
        "result": if outcome.is_applied() { "ok" } else { "ignored" },
        "outcome": outcome.as_str(),
    })))
}
