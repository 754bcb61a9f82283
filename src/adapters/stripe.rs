// src/adapters/stripe.rs

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::Client;
use serde::Deserialize;
use serde::de::DeserializeOwned;

use crate::{
    ports::{
        CheckoutRequest, CompletedCheckout, PaymentError, PaymentEvent, PaymentProcessor,
        RefundReceipt,
    },
    utils::signature::verify_stripe,
};

#[derive(Debug, Deserialize)]
struct Event {
    #[serde(rename = "type")]
    event_type: String,
    data: EventData,
}

#[derive(Debug, Deserialize)]
struct EventData {
    object: serde_json::Value,
}

#[derive(Debug, Deserialize)]
struct CheckoutSession {
    id: String,
    client_reference_id: Option<String>,
    payment_intent: Option<String>,
    customer_details: Option<CustomerDetails>,
    #[serde(default)]
    metadata: serde_json::Map<String, serde_json::Value>,
}

#[derive(Debug, Deserialize)]
struct CustomerDetails {
    email: Option<String>,
}

#[derive(Debug, Deserialize)]
struct LineItems {
    data: Vec<LineItem>,
}

#[derive(Debug, Deserialize)]
struct LineItem {
    amount_total: i64,
    quantity: Option<i64>,
}

#[derive(Debug, Deserialize)]
struct Charge {
    payment_intent: Option<String>,
    refunds: Option<RefundList>,
}

#[derive(Debug, Deserialize)]
struct RefundList {
    data: Vec<Refund>,
}

#[derive(Debug, Deserialize)]
struct Refund {
    amount: i64,
    created: i64,
}

#[derive(Debug, Deserialize)]
struct PaymentIntent {
    latest_charge: Option<ExpandedCharge>,
}

#[derive(Debug, Deserialize)]
struct ExpandedCharge {
    balance_transaction: Option<BalanceTransaction>,
}

#[derive(Debug, Deserialize)]
struct BalanceTransaction {
    amount: i64,
    net: i64,
}

#[derive(Debug, Deserialize)]
struct CreatedSession {
    url: Option<String>,
}

/// Stripe REST client plus webhook verification.
pub struct StripePayments {
    client: Client,
    api_base: String,
    secret_key: String,
    webhook_secret: String,
}

impl StripePayments {
    pub fn new(api_base: String, secret_key: String, webhook_secret: String) -> Self {
        let client = Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .expect("Failed to create HTTP client");

        Self {
            client,
            api_base: api_base.trim_end_matches('/').to_string(),
            secret_key,
            webhook_secret,
        }
    }

    async fn send<T: DeserializeOwned>(&self, request: reqwest::RequestBuilder) -> Result<T, PaymentError> {
        let response = request
            .bearer_auth(&self.secret_key)
            .send()
            .await
            .map_err(|e| PaymentError::Upstream(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            tracing::error!("Stripe responded {}: {}", status, text);
            return Err(PaymentError::Upstream(format!("stripe responded {}", status)));
        }

        response
            .json()
            .await
            .map_err(|e| PaymentError::Upstream(format!("unreadable stripe response: {}", e)))
    }

    async fn completed_checkout(&self, object: serde_json::Value) -> Result<PaymentEvent, PaymentError> {
        let session: CheckoutSession = serde_json::from_value(object)
            .map_err(|e| PaymentError::InvalidPayload(e.to_string()))?;

        let items: LineItems = self
            .send(
                self.client
                    .get(format!("{}/v1/checkout/sessions/{}/line_items", self.api_base, session.id)),
            )
            .await?;
        let item = items.data.into_iter().next();

        Ok(PaymentEvent::CheckoutCompleted(CompletedCheckout {
            payment_id: session.payment_intent,
            reconciliation_id: session.client_reference_id,
            email: session.customer_details.and_then(|d| d.email),
            amount_total: item.as_ref().map_or(0, |i| i.amount_total),
            quantity: item.and_then(|i| i.quantity),
            costless_refund: costless_flag(&session.metadata),
        }))
    }
}

/// Reads the `isCostlessRefundApplied` metadata value, stored as "0" or "1".
fn costless_flag(metadata: &serde_json::Map<String, serde_json::Value>) -> Option<bool> {
    let value = match metadata.get("isCostlessRefundApplied")? {
        serde_json::Value::String(s) => s.trim().parse::<i64>().ok()?,
        serde_json::Value::Number(n) => n.as_i64()?,
        _ => return None,
    };
    match value {
        0 => Some(false),
        1 => Some(true),
        _ => None,
    }
}

fn timestamp(secs: i64) -> DateTime<Utc> {
    DateTime::<Utc>::from_timestamp(secs, 0).unwrap_or_else(Utc::now)
}

#[async_trait]
impl PaymentProcessor for StripePayments {
    async fn create_checkout(&self, req: CheckoutRequest) -> Result<String, PaymentError> {
        let quantity = req.quantity.to_string();
        let costless = if req.costless_refund { "1" } else { "0" };

        let mut form: Vec<(&str, &str)> = vec![
            ("client_reference_id", req.reconciliation_id.as_str()),
            ("customer_creation", "if_required"),
            ("cancel_url", req.cancel_url.as_str()),
            ("success_url", req.success_url.as_str()),
            ("mode", "payment"),
            ("line_items[0][price]", req.price.as_str()),
            ("line_items[0][quantity]", quantity.as_str()),
            ("line_items[0][adjustable_quantity][enabled]", "true"),
            ("line_items[0][adjustable_quantity][minimum]", quantity.as_str()),
            ("metadata[isCostlessRefundApplied]", costless),
            ("allow_promotion_codes", "true"),
            ("automatic_tax[enabled]", "true"),
        ];
        if let Some(email) = &req.customer_email {
            form.push(("customer_email", email.as_str()));
        }

        let session: CreatedSession = self
            .send(
                self.client
                    .post(format!("{}/v1/checkout/sessions", self.api_base))
                    .form(&form),
            )
            .await?;

        session
            .url
            .ok_or_else(|| PaymentError::Upstream("checkout session has no url".to_string()))
    }

    async fn parse_event(&self, payload: &str, signature: &str) -> Result<PaymentEvent, PaymentError> {
        verify_stripe(payload, signature, &self.webhook_secret, Utc::now().timestamp())
            .map_err(|e| PaymentError::InvalidSignature(e.to_string()))?;

        let event: Event =
            serde_json::from_str(payload).map_err(|e| PaymentError::InvalidPayload(e.to_string()))?;

        match event.event_type.as_str() {
            "checkout.session.completed" => self.completed_checkout(event.data.object).await,
            "charge.refunded" => {
                let charge: Charge = serde_json::from_value(event.data.object)
                    .map_err(|e| PaymentError::InvalidPayload(e.to_string()))?;

                let Some(payment_id) = charge.payment_intent else {
                    return Ok(PaymentEvent::Ignored("charge without payment intent".to_string()));
                };
                let refund = charge.refunds.and_then(|r| r.data.into_iter().next());

                Ok(PaymentEvent::ChargeRefunded {
                    payment_id,
                    refunded_amount: refund.as_ref().map_or(0, |r| r.amount),
                    refunded_at: refund.map_or_else(Utc::now, |r| timestamp(r.created)),
                })
            }
            other => Ok(PaymentEvent::Ignored(other.to_string())),
        }
    }

    async fn refund(&self, payment_id: &str, costless: bool) -> Result<RefundReceipt, PaymentError> {
        let intent: PaymentIntent = self
            .send(
                self.client
                    .get(format!("{}/v1/payment_intents/{}", self.api_base, payment_id))
                    .query(&[("expand[]", "latest_charge.balance_transaction")]),
            )
            .await?;

        let balance = intent
            .latest_charge
            .and_then(|c| c.balance_transaction)
            .ok_or_else(|| PaymentError::Upstream("payment has no balance transaction".to_string()))?;

        let amount = (if costless { balance.amount } else { balance.net }).to_string();

        let refund: Refund = self
            .send(
                self.client
                    .post(format!("{}/v1/refunds", self.api_base))
                    .form(&[
                        ("payment_intent", payment_id),
                        ("reason", "requested_by_customer"),
                        ("amount", amount.as_str()),
                    ]),
            )
            .await?;

        Ok(RefundReceipt {
            amount: refund.amount,
            refunded_at: timestamp(refund.created),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn reads_costless_metadata() {
        let m = |v: serde_json::Value| v.as_object().cloned().unwrap();

        assert_eq!(costless_flag(&m(json!({ "isCostlessRefundApplied": "1" }))), Some(true));
        assert_eq!(costless_flag(&m(json!({ "isCostlessRefundApplied": "0" }))), Some(false));
        assert_eq!(costless_flag(&m(json!({ "isCostlessRefundApplied": 1 }))), Some(true));
        assert_eq!(costless_flag(&m(json!({ "isCostlessRefundApplied": "7" }))), None);
        assert_eq!(costless_flag(&m(json!({}))), None);
    }

    #[tokio::test]
    async fn rejects_unsigned_events() {
        let stripe = StripePayments::new(
            "http://127.0.0.1:9".to_string(),
            "sk_test".to_string(),
            "whsec_test".to_string(),
        );

        let result = stripe.parse_event("{}", "t=1,v1=00").await;

        assert!(matches!(result, Err(PaymentError::InvalidSignature(_))));
    }

    #[tokio::test]
    async fn parses_signed_refund_event() {
        let stripe = StripePayments::new(
            "http://127.0.0.1:9".to_string(),
            "sk_test".to_string(),
            "whsec_test".to_string(),
        );
        let payload = json!({
            "type": "charge.refunded",
            "data": { "object": {
                "payment_intent": "pi_1",
                "refunds": { "data": [{ "amount": 450, "created": 1_700_000_000 }] }
            }}
        })
        .to_string();
        let t = Utc::now().timestamp();
        let header = format!(
            "t={},v1={}",
            t,
            crate::utils::signature::stripe_signature(&payload, "whsec_test", t)
        );

        let event = stripe.parse_event(&payload, &header).await.unwrap();

        match event {
            PaymentEvent::ChargeRefunded {
                payment_id,
                refunded_amount,
                refunded_at,
            } => {
                assert_eq!(payment_id, "pi_1");
                assert_eq!(refunded_amount, 450);
                assert_eq!(refunded_at.timestamp(), 1_700_000_000);
            }
            other => panic!("unexpected event {:?}", other),
        }
    }
}
