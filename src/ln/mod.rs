//! Contains code related to integrating with the Lightning network. The most
//! important abstraction exposed by this module is [`LightningClient`], the
//! capability set the rest of the crate needs from our Lightning node. The
//! production implementation is [`LndClient`]; tests substitute deterministic
//! doubles.

use crate::btc;
use crate::hex::Hex;
use crate::seconds::Seconds;
use async_trait::async_trait;
use futures::stream::BoxStream;
use serde::Deserialize;
use std::str::FromStr;
use thiserror::Error;
use url::Url;

mod node;

pub(crate) use lightning_invoice::Invoice as ParsedInvoice;
pub use node::LndClient;

#[derive(Debug, Error)]
pub enum Error {
    #[error("lightning node unavailable: {0}")]
    Unavailable(String),
}

#[derive(Debug, Error)]
#[error("{0}")]
pub struct InvoiceError(pub String);

/// An unparsed BOLT11 invoice, commonly referred to as a "payment request".
/// Payment requests are normalized to upper case on construction so that
/// database matches are stable no matter which casing a payer presents.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawInvoice(String);

impl RawInvoice {
    pub fn new(payment_request: &str) -> Self {
        Self(payment_request.to_uppercase())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Bech32 decoders want a single-case string, so parsing goes through
    /// the lower-case form.
    pub(crate) fn parse(&self) -> Result<ParsedInvoice, InvoiceError> {
        ParsedInvoice::from_str(&self.0.to_lowercase()).map_err(|e| InvoiceError(e.to_string()))
    }
}

impl std::fmt::Display for RawInvoice {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// An invoice freshly issued by the node.
#[derive(Debug, Clone)]
pub struct AddedInvoice {
    pub payment_request: RawInvoice,
    pub hashed_preimage: Hex,
    pub expiry: Seconds,
    pub amount: btc::Sats,
}

/// The fields of a decoded payment request the core cares about. A zero
/// amount means the invoice left the amount to the payer.
#[derive(Debug, Clone)]
pub struct DecodedInvoice {
    pub payment_hash: Hex,
    pub description: String,
    pub amount: btc::Sats,
}

/// The outcome of a synchronous payment attempt. An empty `payment_error`
/// means the payment settled and `preimage` is the proof.
#[derive(Debug, Clone)]
pub struct SentPayment {
    pub payment_error: String,
    pub preimage: Hex,
    pub payment_hash: Hex,
}

/// One event from the invoice-update subscription. Updates also fire on
/// invoice creation, in which case `settled` is false.
#[derive(Debug, Clone)]
pub struct InvoiceUpdate {
    pub payment_request: RawInvoice,
    pub hashed_preimage: Hex,
    pub preimage: Hex,
    pub settled: bool,
    pub amount: btc::Sats,
}

/// Capabilities the core needs from the Lightning node. The implementation
/// is shared process-wide and must be safe for concurrent calls; it is the
/// only collaborator allowed to block on Lightning network I/O.
#[async_trait]
pub trait LightningClient: Send + Sync {
    async fn add_invoice(
        &self,
        amount: btc::Sats,
        memo: Option<String>,
        expiry: Seconds,
    ) -> Result<AddedInvoice, Error>;

    async fn decode_pay_req(&self, invoice: &RawInvoice) -> Result<DecodedInvoice, Error>;

    /// Blocks for the duration of the HTLC attempt. There is no cancellation
    /// beyond the request deadline.
    async fn send_payment_sync(&self, invoice: &RawInvoice) -> Result<SentPayment, Error>;

    async fn new_address(&self) -> Result<btc::Address, Error>;

    /// Broadcasts an on-chain send from the node wallet. Callers resolve
    /// send-all amounts themselves; the node is never asked to drain the
    /// wallet.
    async fn send_coins(
        &self,
        address: &btc::Address,
        amount: btc::Sats,
        target_conf: Option<i32>,
        sat_per_byte: Option<i64>,
    ) -> Result<btc::TxId, Error>;

    /// A lazy, infinite sequence of invoice updates in arrival order. The
    /// stream ends when the node closes it; consumers resubscribe.
    async fn subscribe_invoices(&self) -> Result<BoxStream<'static, InvoiceUpdate>, Error>;
}

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub endpoint: Url,
    pub macaroon_path: String,
    pub cert_path: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    // The BOLT11 "please consider supporting this project" example invoice.
    const PAYMENT_REQUEST: &str = "lnbc1pvjluezpp5qqqsyqcyq5rqwzqfqqqsyqcyq5rqwzqfqqqsyqcyq5rqwzqfqypqdpl2pkx2ctnv5sxxmmwwd5kgetjypeh2ursdae8g6twvus8g6rfwvs8qun0dfjkxaq8rkx3yf5tcsyz3d73gafnh3cax9rn449d9p5uxz9ezhhypd0elx87sjle52x86fux2ypatgddc6k63n7erqz25le42c4u4ecky03ylcqca784w";

    #[test]
    fn normalizes_to_upper_case() {
        let invoice = RawInvoice::new(PAYMENT_REQUEST);
        assert_eq!(invoice.as_str(), PAYMENT_REQUEST.to_uppercase());
        assert_eq!(invoice, RawInvoice::new(&PAYMENT_REQUEST.to_uppercase()));
    }

    #[test]
    fn parses_either_casing() {
        assert!(RawInvoice::new(PAYMENT_REQUEST).parse().is_ok());
        assert!(RawInvoice::new(&PAYMENT_REQUEST.to_uppercase())
            .parse()
            .is_ok());
        assert!(RawInvoice::new("lnbc1notaninvoice").parse().is_err());
    }
}
