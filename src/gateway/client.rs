use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use serde_json::{Map, Value, json};
use tracing::{debug, warn};

use crate::config::GatewayConfig;
use crate::domain::{
    Confirmation, Error, GatewayReceipt, GatewayStatus, Money, PaymentGateway, PaymentRequest,
    PayoutRequest, UserId,
};
use crate::gateway::token;

/// Envelope shared by every provider answer.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct ProviderReply {
    success: bool,
    #[serde(default)]
    error_code: Option<String>,
    #[serde(default)]
    message: Option<String>,
    #[serde(default)]
    details: Option<String>,
    #[serde(default, deserialize_with = "crate::gateway::id_text")]
    payment_id: Option<String>,
    #[serde(default)]
    status: Option<String>,
    #[serde(default, deserialize_with = "crate::gateway::id_text")]
    sp_accumulation_id: Option<String>,
}

impl ProviderReply {
    fn into_result(self) -> Result<Self, Error> {
        let code = self.error_code.clone().unwrap_or_else(|| "0".to_string());
        if self.success && code == "0" {
            return Ok(self);
        }
        // provider wording is kept as-is for the caller
        let message = match (&self.message, &self.details) {
            (Some(m), Some(d)) if !d.is_empty() => format!("{}: {}", m, d),
            (Some(m), _) => m.clone(),
            (None, Some(d)) => d.clone(),
            (None, None) => "request rejected".to_string(),
        };
        Err(Error::gateway(code, message))
    }

    fn status(&self) -> GatewayStatus {
        GatewayStatus::parse(self.status.as_deref().unwrap_or("NEW"))
    }

    fn require_payment_id(&self) -> Result<String, Error> {
        self.payment_id
            .clone()
            .ok_or_else(|| Error::gateway("MALFORMED", "reply carries no PaymentId"))
    }
}

/// Signed JSON-over-HTTPS client for the acquiring and payout APIs.
#[derive(Debug, Clone)]
pub struct HttpGateway {
    http: Client,
    cfg: GatewayConfig,
}

impl HttpGateway {
    pub fn new(cfg: GatewayConfig) -> Result<Self, Error> {
        let http = Client::builder()
            .use_rustls_tls()
            .timeout(cfg.timeout)
            .build()
            .map_err(|e| Error::gateway("CLIENT", e.to_string()))?;
        Ok(Self { http, cfg })
    }

    async fn call(&self, path: &str, params: Value) -> Result<ProviderReply, Error> {
        let mut body = match params {
            Value::Object(map) => map,
            _ => Map::new(),
        };
        body.insert(
            "TerminalKey".to_string(),
            Value::String(self.cfg.terminal_key.clone()),
        );
        token::attach(&mut body, &self.cfg.password);

        let url = format!("{}/{}", self.cfg.base_url.trim_end_matches('/'), path);
        debug!(%url, "calling payment gateway");

        let response = self.http.post(&url).json(&body).send().await?;
        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            warn!(%url, %status, "payment gateway answered with HTTP error");
            return Err(Error::gateway(status.as_str(), text));
        }
        let reply: ProviderReply = response.json().await?;
        reply.into_result()
    }
}

fn minor(amount: Money) -> Result<i64, Error> {
    amount
        .to_minor()
        .ok_or_else(|| Error::Validation(format!("amount {} out of range", amount)))
}

#[async_trait]
impl PaymentGateway for HttpGateway {
    async fn create_deal(&self, user_id: UserId) -> Result<String, Error> {
        let reply = self
            .call("v2/createSpDeal", json!({ "SpDealType": "NN", "CustomerKey": user_id.to_string() }))
            .await?;
        reply
            .sp_accumulation_id
            .ok_or_else(|| Error::gateway("MALFORMED", "reply carries no SpAccumulationId"))
    }

    async fn close_deal(&self, accumulation_id: &str) -> Result<(), Error> {
        self.call("v2/closeSpDeal", json!({ "SpAccumulationId": accumulation_id }))
            .await
            .map(|_| ())
    }

    async fn init_payment(&self, request: &PaymentRequest) -> Result<GatewayReceipt, Error> {
        let mut params = json!({
            "Amount": minor(request.amount)?,
            "OrderId": request.order_id,
            "Description": request.description,
            "CustomerKey": request.user_id.to_string(),
        });
        if let (Some(deal_id), Value::Object(map)) = (&request.deal_id, &mut params) {
            map.insert("SpAccumulationId".into(), Value::String(deal_id.clone()));
        }
        let reply = self.call("v2/Init", params).await?;
        Ok(GatewayReceipt {
            payment_id: reply.require_payment_id()?,
            status: reply.status(),
        })
    }

    async fn confirm_payment(&self, payment_id: &str) -> Result<Confirmation, Error> {
        let reply = self
            .call("v2/Confirm", json!({ "PaymentId": payment_id }))
            .await?;
        Ok(Confirmation {
            success: reply.success,
            status: reply.status(),
        })
    }

    /// Two provider calls: `Init` registers the payout, `Payment` releases it.
    async fn init_payout(&self, request: &PayoutRequest) -> Result<GatewayReceipt, Error> {
        let init = self
            .call(
                "e2c/v2/Init",
                json!({
                    "Amount": minor(request.amount)?,
                    "OrderId": request.order_id,
                    "SpAccumulationId": request.deal_id,
                    "Phone": request.phone,
                    "FinalPayout": request.is_final,
                    "PaymentRecipientId": request.phone,
                }),
            )
            .await?;
        let payment_id = init.require_payment_id()?;

        let payment = self
            .call("e2c/v2/Payment", json!({ "PaymentId": payment_id }))
            .await?;
        Ok(GatewayReceipt {
            payment_id,
            status: payment.status(),
        })
    }

    async fn payout_state(&self, payment_id: &str) -> Result<GatewayStatus, Error> {
        self.call("e2c/v2/GetState", json!({ "PaymentId": payment_id }))
            .await
            .map(|reply| reply.status())
    }
}
