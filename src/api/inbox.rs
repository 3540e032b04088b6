//! ActivityPub inbox endpoints
//!
//! - Personal inbox
//! - Shared inbox
//!
//! Signatures are verified in front of this service; the handlers only
//! parse the body and hand the activity to the processor.

use axum::body::Bytes;
use axum::{
    Router,
    extract::{Path, State},
    http::StatusCode,
    response::Json,
    routing::post,
};
use serde::Serialize;

use crate::AppState;
use crate::error::AppError;
use crate::federation::InboundOutcome;
use crate::metrics::HTTP_REQUESTS_TOTAL;

/// Create inbox router
///
/// Routes:
/// - POST /users/:username/inbox - Personal inbox
/// - POST /inbox - Shared inbox
pub fn inbox_router() -> Router<AppState> {
    Router::new()
        .route("/users/:username/inbox", post(inbox))
        .route("/inbox", post(shared_inbox))
}

/// Body of an inbox answer
#[derive(Debug, Serialize)]
pub struct InboxReceipt {
    /// "accepted" or "rejected"
    pub status: &'static str,
    /// Outcome label, e.g. "handed_off" or "not_followed"
    pub outcome: &'static str,
}

impl From<&InboundOutcome> for InboxReceipt {
    fn from(outcome: &InboundOutcome) -> Self {
        Self {
            status: match outcome {
                InboundOutcome::HandedOff(_) => "accepted",
                InboundOutcome::Rejected(_) => "rejected",
            },
            outcome: outcome.label(),
        }
    }
}

/// POST /users/:username/inbox
async fn inbox(
    State(state): State<AppState>,
    Path(username): Path<String>,
    body: Bytes,
) -> Result<(StatusCode, Json<InboxReceipt>), AppError> {
    receive(&state, Some(&username), &body, "/users/:username/inbox").await
}

/// POST /inbox
///
/// Announced objects are fetched on behalf of the main user.
async fn shared_inbox(
    State(state): State<AppState>,
    body: Bytes,
) -> Result<(StatusCode, Json<InboxReceipt>), AppError> {
    receive(&state, None, &body, "/inbox").await
}

async fn receive(
    state: &AppState,
    acting_user: Option<&str>,
    body: &[u8],
    endpoint: &str,
) -> Result<(StatusCode, Json<InboxReceipt>), AppError> {
    let activity: serde_json::Value = match serde_json::from_slice(body) {
        Ok(activity) => activity,
        Err(e) => {
            HTTP_REQUESTS_TOTAL
                .with_label_values(&["POST", endpoint, "400"])
                .inc();
            return Err(AppError::InvalidActivity(format!("Invalid JSON: {}", e)));
        }
    };

    let outcome = state.processor.process(activity, acting_user).await;

    HTTP_REQUESTS_TOTAL
        .with_label_values(&["POST", endpoint, "202"])
        .inc();

    Ok((StatusCode::ACCEPTED, Json(InboxReceipt::from(&outcome))))
}
