//! Settlement callbacks. When an invoice with a merchant-supplied callback
//! URL settles, the settled payment is POSTed to that URL together with an
//! HMAC over its id, keyed by the SHA-256 of the user's most recent API key.
//! The merchant re-derives the key from the cleartext only they hold and
//! compares. Delivery is fire-and-forget with respect to settlement: it runs
//! on its own task, retries a few times, and a persistent failure is logged
//! and swallowed; the settlement itself is never undone.

use crate::apikey;
use crate::database::Database;
use crate::offchain;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use serde::Serialize;
use sha2::Sha256;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use url::Url;

const MAX_ATTEMPTS: u32 = 5;
const RETRY_GAP: Duration = Duration::from_secs(1);

#[derive(Debug, Error)]
#[error("callback delivery failed: {0}")]
pub struct SendError(pub String);

/// The HTTP capability the notifier posts through. Injected so tests can
/// observe deliveries without a network.
#[async_trait]
pub trait HttpSender: Send + Sync {
    async fn post_json(&self, url: &Url, body: serde_json::Value) -> Result<(), SendError>;
}

pub struct ReqwestSender {
    client: reqwest::Client,
}

impl ReqwestSender {
    pub fn new() -> Self {
        Self {
            client: reqwest::Client::new(),
        }
    }
}

impl Default for ReqwestSender {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl HttpSender for ReqwestSender {
    async fn post_json(&self, url: &Url, body: serde_json::Value) -> Result<(), SendError> {
        let response = self
            .client
            .post(url.clone())
            .json(&body)
            .send()
            .await
            .map_err(|e| SendError(e.to_string()))?;
        response
            .error_for_status()
            .map_err(|e| SendError(e.to_string()))?;
        Ok(())
    }
}

#[derive(Clone)]
pub struct Notifier {
    db: Database,
    sender: Arc<dyn HttpSender>,
}

impl Notifier {
    pub fn new(db: Database, sender: Arc<dyn HttpSender>) -> Self {
        Self { db, sender }
    }

    /// Fires the callback for a settled payment on its own task, so delivery
    /// can never delay the settlement that triggered it.
    pub fn spawn(&self, payment: offchain::Payment) {
        let notifier = self.clone();
        tokio::spawn(async move {
            notifier.notify(payment).await;
        });
    }

    async fn notify(&self, payment: offchain::Payment) {
        let url = match payment.callback_url.clone() {
            Some(url) => url,
            None => return,
        };
        let key_hash = match apikey::newest_key_hash(&self.db, payment.user_id).await {
            Ok(Some(key_hash)) => key_hash,
            Ok(None) => {
                log::error!(
                    "{:?} has no api key, dropping callback for payment {:?}",
                    payment.user_id,
                    payment.id
                );
                return;
            }
            Err(e) => {
                log::error!("api key lookup failed for {:?}: {}", payment.user_id, e);
                return;
            }
        };
        let body = match serde_json::to_value(Body::new(&payment, &key_hash)) {
            Ok(body) => body,
            Err(e) => {
                log::error!("could not serialize payment {:?}: {}", payment.id, e);
                return;
            }
        };
        deliver(self.sender.as_ref(), &url, body, payment.id).await;
    }
}

async fn deliver(sender: &dyn HttpSender, url: &Url, body: serde_json::Value, id: offchain::Id) {
    for attempt in 1..=MAX_ATTEMPTS {
        match sender.post_json(url, body.clone()).await {
            Ok(()) => {
                log::info!(
                    "callback for payment {:?} delivered on attempt {}",
                    id,
                    attempt
                );
                return;
            }
            Err(e) => log::info!(
                "callback attempt {}/{} for payment {:?} failed: {}",
                attempt,
                MAX_ATTEMPTS,
                id,
                e
            ),
        }
        if attempt < MAX_ATTEMPTS {
            tokio::time::sleep(RETRY_GAP).await;
        }
    }
    log::error!(
        "giving up on callback for payment {:?} after {} attempts",
        id,
        MAX_ATTEMPTS
    );
}

/// HMAC-SHA256 over the ASCII decimal payment id, lower-hex.
fn sign(id: offchain::Id, key_hash: &[u8]) -> String {
    let mut mac =
        Hmac::<Sha256>::new_from_slice(key_hash).expect("hmac accepts keys of any length");
    mac.update(id.0.to_string().as_bytes());
    hex::encode(mac.finalize().into_bytes())
}

#[derive(Debug, Serialize)]
struct Body<'a> {
    payment: PaymentBody<'a>,
    hash: String,
}

impl<'a> Body<'a> {
    fn new(payment: &'a offchain::Payment, key_hash: &[u8]) -> Self {
        Self {
            payment: PaymentBody::new(payment),
            hash: sign(payment.id, key_hash),
        }
    }
}

#[derive(Debug, Serialize)]
struct PaymentBody<'a> {
    id: i32,
    user_id: i32,
    payment_request: &'a str,
    hashed_preimage: &'a str,
    preimage: Option<&'a str>,
    memo: Option<&'a str>,
    description: Option<&'a str>,
    callback_url: Option<String>,
    customer_order_id: Option<&'a str>,
    expiry_sec: i64,
    amount_sat: i64,
    amount_msat: i64,
    direction: &'static str,
    status: &'static str,
    settled_at: Option<DateTime<Utc>>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl<'a> PaymentBody<'a> {
    fn new(payment: &'a offchain::Payment) -> Self {
        Self {
            id: payment.id.0,
            user_id: payment.user_id.0,
            payment_request: payment.payment_request.as_str(),
            hashed_preimage: payment.hashed_preimage.as_str(),
            preimage: payment.preimage.as_ref().map(|preimage| preimage.as_str()),
            memo: payment.memo.as_deref(),
            description: payment.description.as_deref(),
            callback_url: payment.callback_url.as_ref().map(|url| url.to_string()),
            customer_order_id: payment.customer_order_id.as_deref(),
            expiry_sec: payment.expiry.0,
            amount_sat: payment.amount.0,
            amount_msat: payment.amount.msats().0,
            direction: payment.direction.as_str(),
            status: payment.status.as_str(),
            settled_at: payment.settled_at,
            created_at: payment.created,
            updated_at: payment.updated,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hex::Hex;
    use crate::seconds::Seconds;
    use crate::{apikey, btc, ln, user};
    use std::sync::Mutex;

    fn settled_payment() -> offchain::Payment {
        let now = Utc::now();
        offchain::Payment {
            id: offchain::Id(42),
            user_id: user::Id(7),
            payment_request: ln::RawInvoice::new("lnbcrt1example"),
            hashed_preimage: Hex::encode(&[1u8; 32]),
            preimage: Some(Hex::encode(&[2u8; 32])),
            memo: Some("coffee".to_owned()),
            description: None,
            callback_url: Some(Url::parse("https://merchant.example/hook").unwrap()),
            customer_order_id: Some("order-1".to_owned()),
            expiry: Seconds::one_hour(),
            amount: btc::Sats(50_000),
            direction: offchain::Direction::Inbound,
            status: offchain::Status::Succeeded,
            settled_at: Some(now),
            created: now,
            updated: now,
        }
    }

    #[test]
    fn merchant_can_verify_the_signature() {
        // The merchant holds the cleartext key, hashes it themselves, and
        // HMACs the payment id from the body.
        let cleartext = "00112233445566778899aabbccddeeff";
        let key_hash = apikey::hash_key(cleartext);
        let payment = settled_payment();
        let body = Body::new(&payment, &key_hash);

        let mut mac = Hmac::<Sha256>::new_from_slice(&key_hash).unwrap();
        mac.update(b"42");
        assert_eq!(body.hash, hex::encode(mac.finalize().into_bytes()));
        assert_eq!(body.hash.len(), 64);
    }

    #[test]
    fn body_carries_the_full_payment() {
        let payment = settled_payment();
        let key_hash = apikey::hash_key("00112233445566778899aabbccddeeff");
        let value = serde_json::to_value(Body::new(&payment, &key_hash)).unwrap();
        assert_eq!(value["payment"]["id"], 42);
        assert_eq!(value["payment"]["amount_sat"], 50_000);
        assert_eq!(value["payment"]["amount_msat"], 50_000_000);
        assert_eq!(value["payment"]["status"], "SUCCEEDED");
        assert_eq!(value["payment"]["direction"], "INBOUND");
        assert!(value["payment"]["preimage"].is_string());
        assert!(value["hash"].is_string());
    }

    struct FlakySender {
        calls: Mutex<u32>,
        succeed_on: Option<u32>,
    }

    #[async_trait]
    impl HttpSender for FlakySender {
        async fn post_json(&self, _url: &Url, _body: serde_json::Value) -> Result<(), SendError> {
            let mut calls = self.calls.lock().unwrap();
            *calls += 1;
            match self.succeed_on {
                Some(n) if *calls >= n => Ok(()),
                _ => Err(SendError("connection refused".to_owned())),
            }
        }
    }

    #[tokio::test(start_paused = true)]
    async fn gives_up_after_five_attempts() {
        let sender = FlakySender {
            calls: Mutex::new(0),
            succeed_on: None,
        };
        let url = Url::parse("https://merchant.example/hook").unwrap();
        deliver(&sender, &url, serde_json::json!({}), offchain::Id(1)).await;
        assert_eq!(*sender.calls.lock().unwrap(), 5);
    }

    #[tokio::test(start_paused = true)]
    async fn stops_retrying_once_delivered() {
        let sender = FlakySender {
            calls: Mutex::new(0),
            succeed_on: Some(3),
        };
        let url = Url::parse("https://merchant.example/hook").unwrap();
        deliver(&sender, &url, serde_json::json!({}), offchain::Id(1)).await;
        assert_eq!(*sender.calls.lock().unwrap(), 3);
    }
}
