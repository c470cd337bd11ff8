//! The `PaymentGateway` port (SPEC_FULL.md §6.2). Grounded in the original
//! system's `PaymentServiceInterface` (`initiate_payment`, `get_payment_status`,
//! `handle_payment_callback`) — `original_source/backend/services/payment_interface.py`.

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use tanda_core::{Error, Money};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PaymentStatus {
    Pending,
    Completed,
    Failed,
    Cancelled,
    Expired,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PaymentRequest {
    pub amount: Money,
    pub currency: String,
    pub payer_ref: String,
    pub reference: String,
    pub metadata: HashMap<String, String>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PaymentCallback {
    pub payment_id: String,
    pub final_status: PaymentStatus,
}

#[async_trait]
pub trait PaymentGateway: Send + Sync {
    /// Starts a payment and returns the gateway's payment id. Does not block
    /// until settlement; callers track the result via `query` or a callback.
    async fn initiate(&self, request: PaymentRequest) -> Result<String, Error>;

    async fn query(&self, payment_id: &str) -> Result<PaymentStatus, Error>;

    /// Parses a gateway webhook payload into a normalized callback. Adapters
    /// are responsible for any signature verification the gateway requires.
    async fn parse_callback(&self, payload: serde_json::Value) -> Result<PaymentCallback, Error>;
}

/// Production adapter: a webhook-style HTTP payment processor.
pub struct HttpPaymentGateway {
    client: reqwest::Client,
    base_url: String,
}

impl HttpPaymentGateway {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: base_url.into(),
        }
    }
}

#[async_trait]
impl PaymentGateway for HttpPaymentGateway {
    async fn initiate(&self, request: PaymentRequest) -> Result<String, Error> {
        let resp = self
            .client
            .post(format!("{}/payments", self.base_url))
            .json(&request)
            .send()
            .await
            .map_err(|e| Error::PaymentGateway(e.to_string()))?;
        if !resp.status().is_success() {
            return Err(Error::PaymentGateway(format!(
                "gateway returned {}",
                resp.status()
            )));
        }
        #[derive(Deserialize)]
        struct InitiateResponse {
            payment_id: String,
        }
        let body: InitiateResponse = resp
            .json()
            .await
            .map_err(|e| Error::PaymentGateway(e.to_string()))?;
        Ok(body.payment_id)
    }

    async fn query(&self, payment_id: &str) -> Result<PaymentStatus, Error> {
        let resp = self
            .client
            .get(format!("{}/payments/{}", self.base_url, payment_id))
            .send()
            .await
            .map_err(|e| Error::PaymentGateway(e.to_string()))?;
        if !resp.status().is_success() {
            return Err(Error::PaymentGateway(format!(
                "gateway returned {}",
                resp.status()
            )));
        }
        #[derive(Deserialize)]
        struct StatusResponse {
            status: PaymentStatus,
        }
        let body: StatusResponse = resp
            .json()
            .await
            .map_err(|e| Error::PaymentGateway(e.to_string()))?;
        Ok(body.status)
    }

    async fn parse_callback(&self, payload: serde_json::Value) -> Result<PaymentCallback, Error> {
        serde_json::from_value(payload).map_err(|e| Error::PaymentGateway(e.to_string()))
    }
}

/// Test adapter: records every call so assertions can inspect what the core
/// asked the gateway to do, and returns a scripted status per payment id.
#[derive(Default)]
pub struct StubPaymentGateway {
    pub initiated: Mutex<Vec<PaymentRequest>>,
    pub scripted_status: Mutex<HashMap<String, PaymentStatus>>,
}

impl StubPaymentGateway {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_status(&self, payment_id: &str, status: PaymentStatus) {
        self.scripted_status
            .lock()
            .expect("stub gateway poisoned")
            .insert(payment_id.to_string(), status);
    }
}

#[async_trait]
impl PaymentGateway for StubPaymentGateway {
    async fn initiate(&self, request: PaymentRequest) -> Result<String, Error> {
        let id = request.reference.clone();
        self.initiated.lock().expect("stub gateway poisoned").push(request);
        Ok(id)
    }

    async fn query(&self, payment_id: &str) -> Result<PaymentStatus, Error> {
        Ok(self
            .scripted_status
            .lock()
            .expect("stub gateway poisoned")
            .get(payment_id)
            .copied()
            .unwrap_or(PaymentStatus::Pending))
    }

    async fn parse_callback(&self, payload: serde_json::Value) -> Result<PaymentCallback, Error> {
        serde_json::from_value(payload).map_err(|e| Error::PaymentGateway(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn stub_gateway_records_requests_and_honors_scripted_status() {
        let gw = StubPaymentGateway::new();
        let req = PaymentRequest {
            amount: Money::from_cents(5_000),
            currency: "USD".into(),
            payer_ref: "user-1".into(),
            reference: "pay-abc".into(),
            metadata: HashMap::new(),
        };
        let id = gw.initiate(req).await.unwrap();
        assert_eq!(id, "pay-abc");
        assert_eq!(gw.initiated.lock().unwrap().len(), 1);

        gw.set_status("pay-abc", PaymentStatus::Completed);
        assert_eq!(gw.query("pay-abc").await.unwrap(), PaymentStatus::Completed);
        assert_eq!(gw.query("unknown").await.unwrap(), PaymentStatus::Pending);
    }
}
