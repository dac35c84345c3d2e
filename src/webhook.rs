use std::sync::Arc;

use axum::{Router, body::Body, extract::State, http::StatusCode, routing::post};
use futures::StreamExt;
use serde::{Deserialize, Deserializer};
use serde_json::Value;
use tracing::{debug, error, warn};

use crate::domain::{Error, GatewayStatus, Money, Notification, StatusChange};
use crate::gateway::{id_text, token};
use crate::reconciliation::{Outcome, ReconciliationService};

pub const WEBHOOK_PATH: &str = "/payments/webhook";

/// Larger bodies are read to the end and dropped.
pub const MAX_NOTIFICATION_BYTES: usize = 64 * 1024;

const ACK: (StatusCode, &str) = (StatusCode::OK, "OK");

/// Wire shape of a provider notification. Unknown fields are dropped here.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct RawNotification {
    #[serde(default, deserialize_with = "id_text")]
    payment_id: Option<String>,
    #[serde(default, deserialize_with = "id_text")]
    order_id: Option<String>,
    #[serde(default)]
    status: Option<String>,
    #[serde(default)]
    success: Option<bool>,
    #[serde(default, deserialize_with = "minor_units")]
    amount: Option<i64>,
    #[serde(default, deserialize_with = "id_text")]
    sp_accumulation_id: Option<String>,
    #[serde(default)]
    notification_type: Option<String>,
}

fn minor_units<'de, D>(deserializer: D) -> Result<Option<i64>, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(match Option::<Value>::deserialize(deserializer)? {
        Some(Value::Number(n)) => n.as_i64(),
        Some(Value::String(s)) => s.trim().parse().ok(),
        _ => None,
    })
}

impl TryFrom<RawNotification> for Notification {
    type Error = Error;

    fn try_from(raw: RawNotification) -> Result<Self, Self::Error> {
        let Some(status) = raw.status.as_deref().map(GatewayStatus::parse) else {
            return Ok(match (raw.sp_accumulation_id, raw.order_id) {
                (Some(accumulation_id), Some(order_id)) => Notification::DealAccumulation {
                    accumulation_id,
                    order_id,
                },
                _ => Notification::Unrecognized,
            });
        };

        let payment_id = raw
            .payment_id
            .ok_or_else(|| Error::Validation(format!("{} notification without PaymentId", status)))?;

        let is_payout = raw
            .notification_type
            .as_deref()
            .is_some_and(|t| t.to_ascii_lowercase().contains("payout"))
            || status.is_payout_only();

        let change = StatusChange {
            payment_id,
            order_id: raw.order_id,
            status,
            success: raw.success.unwrap_or(false),
            amount: Money::from_minor(raw.amount.unwrap_or_default()),
            accumulation_id: raw.sp_accumulation_id,
        };

        Ok(if is_payout {
            Notification::Payout(change)
        } else {
            Notification::Payment(change)
        })
    }
}

/// Verifies inbound notifications and hands them to reconciliation.
pub struct WebhookState {
    reconciliation: Arc<ReconciliationService>,
    password: String,
}

impl WebhookState {
    pub fn new(reconciliation: Arc<ReconciliationService>, password: impl Into<String>) -> Self {
        Self {
            reconciliation,
            password: password.into(),
        }
    }

    /// Unparseable bodies come back as `Ignored`; a bad token is an error so
    /// callers can tell it apart, but neither is ever retried.
    pub async fn handle(&self, body: &str) -> Result<Outcome, Error> {
        let fields = match serde_json::from_str::<Value>(body) {
            Ok(Value::Object(fields)) => fields,
            Ok(_) | Err(_) => {
                warn!(len = body.len(), "malformed notification dropped");
                return Ok(Outcome::Ignored);
            }
        };

        if !token::verify(&fields, &self.password) {
            return Err(Error::SignatureVerificationFailed);
        }

        let raw: RawNotification = match serde_json::from_value(Value::Object(fields)) {
            Ok(raw) => raw,
            Err(e) => {
                warn!(error = %e, "notification with unexpected field types dropped");
                return Ok(Outcome::Ignored);
            }
        };
        let notification = match Notification::try_from(raw) {
            Ok(notification) => notification,
            Err(e) => {
                warn!(error = %e, "incomplete notification dropped");
                return Ok(Outcome::Ignored);
            }
        };

        debug!(kind = notification.kind(), "notification verified");
        self.reconciliation.apply(notification).await
    }
}

pub fn router(state: Arc<WebhookState>) -> Router {
    Router::new()
        .route(WEBHOOK_PATH, post(receive))
        .with_state(state)
}

/// The provider retries anything but a plain 200 `OK`, so every path ends
/// here. The body is taken raw: axum's `String` and `Bytes` extractors answer
/// 400 or 413 on their own.
async fn receive(State(state): State<Arc<WebhookState>>, body: Body) -> (StatusCode, &'static str) {
    let bytes = match read_limited(body, MAX_NOTIFICATION_BYTES).await {
        Ok(Some(bytes)) => bytes,
        Ok(None) => {
            warn!(limit = MAX_NOTIFICATION_BYTES, "oversized notification dropped");
            return ACK;
        }
        Err(e) => {
            warn!(error = %e, "notification body could not be read");
            return ACK;
        }
    };
    let text = match std::str::from_utf8(&bytes) {
        Ok(text) => text,
        Err(e) => {
            warn!(len = bytes.len(), error = %e, "non-UTF-8 notification dropped");
            return ACK;
        }
    };

    match state.handle(text).await {
        Ok(outcome) => debug!(?outcome, "webhook processed"),
        Err(Error::SignatureVerificationFailed) => {
            warn!("webhook signature mismatch, notification dropped")
        }
        Err(e) => error!(error = %e, fatal = e.is_fatal(), "webhook processing failed"),
    }
    ACK
}

/// Drains the whole body but buffers at most `limit` bytes. `None` when the
/// body was larger.
async fn read_limited(body: Body, limit: usize) -> Result<Option<Vec<u8>>, axum::Error> {
    let mut chunks = body.into_data_stream();
    let mut buf = Vec::new();
    let mut oversized = false;
    while let Some(chunk) = chunks.next().await {
        let chunk = chunk?;
        if oversized {
            continue;
        }
        if buf.len() + chunk.len() > limit {
            oversized = true;
            buf = Vec::new();
        } else {
            buf.extend_from_slice(&chunk);
        }
    }
    Ok((!oversized).then_some(buf))
}
