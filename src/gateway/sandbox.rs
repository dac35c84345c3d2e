use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use serde_json::{Map, Value, json};

use crate::domain::{
    Confirmation, Error, GatewayReceipt, GatewayStatus, Money, PaymentGateway, PaymentRequest,
    PayoutRequest, UserId,
};
use crate::gateway::token;

#[derive(Debug, Default)]
struct SandboxState {
    sequence: u64,
    calls: Vec<String>,
    payout_failure: Option<(String, String)>,
    confirm_failure: Option<(String, String)>,
    closed_deals: Vec<String>,
    payout_states: HashMap<String, GatewayStatus>,
}

/// In-process provider that accepts everything unless told otherwise.
/// Used for dry-run replays and by the test suite.
#[derive(Debug, Default)]
pub struct SandboxGateway {
    password: String,
    state: Mutex<SandboxState>,
}

impl SandboxGateway {
    pub fn new(password: impl Into<String>) -> Self {
        Self {
            password: password.into(),
            state: Mutex::new(SandboxState::default()),
        }
    }

    fn with_state<T>(&self, f: impl FnOnce(&mut SandboxState) -> T) -> T {
        let mut state = self.state.lock().unwrap_or_else(|p| p.into_inner());
        f(&mut state)
    }

    fn next_id(&self, prefix: &str, call: String) -> String {
        self.with_state(|s| {
            s.sequence += 1;
            s.calls.push(call);
            format!("{}-{}", prefix, s.sequence)
        })
    }

    /// Every later payout is refused with this provider error.
    pub fn reject_payouts(&self, code: &str, message: &str) {
        self.with_state(|s| s.payout_failure = Some((code.into(), message.into())));
    }

    pub fn fail_confirmations(&self, code: &str, message: &str) {
        self.with_state(|s| s.confirm_failure = Some((code.into(), message.into())));
    }

    /// What `payout_state` answers for this payout from now on.
    pub fn set_payout_state(&self, payment_id: &str, status: GatewayStatus) {
        self.with_state(|s| s.payout_states.insert(payment_id.to_string(), status));
    }

    pub fn heal(&self) {
        self.with_state(|s| {
            s.payout_failure = None;
            s.confirm_failure = None;
        });
    }

    pub fn calls(&self) -> Vec<String> {
        self.with_state(|s| s.calls.clone())
    }

    pub fn closed_deals(&self) -> Vec<String> {
        self.with_state(|s| s.closed_deals.clone())
    }

    /// Builds a notification signed with this sandbox's password.
    pub fn notification(
        &self,
        payment_id: &str,
        status: &str,
        success: bool,
        amount: Money,
        order_id: Option<&str>,
    ) -> String {
        notification_body(&self.password, payment_id, status, success, amount, order_id)
    }
}

/// A signed notification body the way the provider sends it.
pub fn notification_body(
    password: &str,
    payment_id: &str,
    status: &str,
    success: bool,
    amount: Money,
    order_id: Option<&str>,
) -> String {
    let mut body = Map::new();
    body.insert("TerminalKey".into(), json!("sandbox"));
    body.insert("PaymentId".into(), json!(payment_id));
    body.insert("Status".into(), json!(status));
    body.insert("Success".into(), json!(success));
    body.insert("Amount".into(), json!(amount.to_minor().unwrap_or_default()));
    body.insert("ErrorCode".into(), json!("0"));
    if let Some(order_id) = order_id {
        body.insert("OrderId".into(), json!(order_id));
    }
    token::attach(&mut body, password);
    Value::Object(body).to_string()
}

#[async_trait]
impl PaymentGateway for SandboxGateway {
    async fn create_deal(&self, user_id: UserId) -> Result<String, Error> {
        Ok(self.next_id("acc", format!("create_deal:{}", user_id)))
    }

    async fn close_deal(&self, accumulation_id: &str) -> Result<(), Error> {
        self.with_state(|s| {
            s.calls.push(format!("close_deal:{}", accumulation_id));
            s.closed_deals.push(accumulation_id.to_string());
        });
        Ok(())
    }

    async fn init_payment(&self, request: &PaymentRequest) -> Result<GatewayReceipt, Error> {
        let payment_id = self.next_id("pay", format!("init_payment:{}", request.order_id));
        Ok(GatewayReceipt {
            payment_id,
            status: GatewayStatus::New,
        })
    }

    async fn confirm_payment(&self, payment_id: &str) -> Result<Confirmation, Error> {
        let failure = self.with_state(|s| {
            s.calls.push(format!("confirm_payment:{}", payment_id));
            s.confirm_failure.clone()
        });
        match failure {
            Some((code, message)) => Err(Error::gateway(code, message)),
            None => Ok(Confirmation {
                success: true,
                status: GatewayStatus::Confirmed,
            }),
        }
    }

    async fn init_payout(&self, request: &PayoutRequest) -> Result<GatewayReceipt, Error> {
        if let Some((code, message)) = self.with_state(|s| s.payout_failure.clone()) {
            return Err(Error::gateway(code, message));
        }
        let payment_id = self.next_id("po", format!("init_payout:{}", request.order_id));
        Ok(GatewayReceipt {
            payment_id,
            status: GatewayStatus::Checking,
        })
    }

    async fn payout_state(&self, payment_id: &str) -> Result<GatewayStatus, Error> {
        Ok(self.with_state(|s| {
            s.calls.push(format!("payout_state:{}", payment_id));
            s.payout_states
                .get(payment_id)
                .cloned()
                .unwrap_or(GatewayStatus::Checking)
        }))
    }
}
