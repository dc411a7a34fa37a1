//! Handles the lifecycle of Lightning payments within the service: invoices
//! we issue for users (inbound) and invoices we pay on their behalf
//! (outbound). A payment starts `Open` and ends in exactly one of
//! `Succeeded` or `Failed`; settlement is the only transition that touches
//! the user balance, and it carries the revealed preimage as proof.

use crate::hex::Hex;
use crate::seconds::Seconds;
use crate::{balance, btc, ln, user};
use chrono::{DateTime, Duration, Utc};
use const_format::formatcp;
use thiserror::Error;
use url::Url;

/// The per-invoice maximum, 2^32 - 1 msat expressed in whole sats.
pub const MAX_INVOICE_SATS: i64 = u32::MAX as i64 / 1000;

const MAX_MEMO_CHARS: usize = 256;

#[derive(Debug, Error)]
pub enum Error {
    #[error("amount must be positive and at most {} sat", MAX_INVOICE_SATS)]
    InvalidAmount,
    #[error("zero-amount invoices are not supported")]
    ZeroAmountInvoice,
    #[error("invalid memo: {0}")]
    InvalidMemo(&'static str),
    #[error("invalid expiry: {0}")]
    InvalidExpiry(&'static str),
    #[error("invalid invoice: {0}")]
    InvalidInvoice(#[from] ln::InvoiceError),
    #[error("payment has already been settled")]
    AlreadySettled,
    #[error("settlement matched more than one open payment")]
    SettleConflict,
    #[error("payment rejected by the node: {reason}")]
    Rejected { reason: String },
    #[error("{0}")]
    Gateway(#[from] ln::Error),
    #[error("{0}")]
    Balance(#[from] balance::Error),
    #[error(transparent)]
    Database(#[from] sqlx::Error),
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Id(pub i32);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    Open,
    Succeeded,
    Failed,
}

impl Status {
    pub(crate) fn as_str(&self) -> &'static str {
        match self {
            Status::Open => "OPEN",
            Status::Succeeded => "SUCCEEDED",
            Status::Failed => "FAILED",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Inbound,
    Outbound,
}

impl Direction {
    pub(crate) fn as_str(&self) -> &'static str {
        match self {
            Direction::Inbound => "INBOUND",
            Direction::Outbound => "OUTBOUND",
        }
    }
}

/// A Lightning payment as stored. `preimage` and `settled_at` are set
/// exactly when the payment has succeeded.
#[derive(Debug, Clone)]
pub struct Payment {
    pub id: Id,
    pub user_id: user::Id,
    pub payment_request: ln::RawInvoice,
    pub hashed_preimage: Hex,
    pub preimage: Option<Hex>,
    pub memo: Option<String>,
    pub description: Option<String>,
    pub callback_url: Option<Url>,
    pub customer_order_id: Option<String>,
    pub expiry: Seconds,
    pub amount: btc::Sats,
    pub direction: Direction,
    pub status: Status,
    pub settled_at: Option<DateTime<Utc>>,
    pub created: DateTime<Utc>,
    pub updated: DateTime<Utc>,
}

impl Payment {
    pub fn amount_msats(&self) -> btc::MilliSats {
        self.amount.msats()
    }

    pub fn expires_at(&self) -> DateTime<Utc> {
        self.created + Duration::seconds(self.expiry.0)
    }

    pub fn is_expired(&self) -> bool {
        Utc::now() > self.expires_at()
    }

    pub fn is_settled(&self) -> bool {
        self.settled_at.is_some()
    }
}

/// Parameters for issuing a new inbound invoice.
#[derive(Debug, Clone)]
pub struct NewInvoice {
    pub amount: btc::Sats,
    pub memo: Option<String>,
    pub description: Option<String>,
    pub callback_url: Option<Url>,
    pub customer_order_id: Option<String>,
    pub expiry: Seconds,
}

impl NewInvoice {
    pub(crate) fn validate(&self) -> Result<(), Error> {
        if self.amount <= btc::Sats(0) || self.amount > btc::Sats(MAX_INVOICE_SATS) {
            return Err(Error::InvalidAmount);
        }
        if let Some(memo) = &self.memo {
            if memo.chars().count() > MAX_MEMO_CHARS {
                return Err(Error::InvalidMemo(formatcp!(
                    "memo can be up to {} characters long",
                    MAX_MEMO_CHARS
                )));
            }
        }
        if self.expiry <= Seconds(0) {
            return Err(Error::InvalidExpiry("expiry must be positive"));
        }
        Ok(())
    }
}

/// A payment row about to be inserted. The id and the timestamps come back
/// from the database.
#[derive(Debug, Clone)]
pub(crate) struct NewPayment {
    pub user_id: user::Id,
    pub payment_request: ln::RawInvoice,
    pub hashed_preimage: Hex,
    pub preimage: Option<Hex>,
    pub memo: Option<String>,
    pub description: Option<String>,
    pub callback_url: Option<Url>,
    pub customer_order_id: Option<String>,
    pub expiry: Seconds,
    pub amount: btc::Sats,
    pub direction: Direction,
    pub status: Status,
    pub settled_at: Option<DateTime<Utc>>,
}

impl NewPayment {
    /// Model invariants that must hold before a row may be persisted.
    /// Violations are programmer errors.
    pub(crate) fn assert_valid(&self) {
        if self.hashed_preimage.is_empty() {
            panic!("payment without a hashed preimage");
        }
        if self.preimage.is_some() != (self.status == Status::Succeeded) {
            panic!(
                "preimage must be present exactly on a succeeded payment, got {:?}",
                self.status
            );
        }
        if self.settled_at.is_some() != (self.status == Status::Succeeded) {
            panic!(
                "settled_at must be present exactly on a succeeded payment, got {:?}",
                self.status
            );
        }
    }
}

/// Empty strings coming in from user input are stored as NULL.
pub(crate) fn normalize(value: Option<String>) -> Option<String> {
    value.filter(|s| !s.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn new_invoice(amount: btc::Sats) -> NewInvoice {
        NewInvoice {
            amount,
            memo: None,
            description: None,
            callback_url: None,
            customer_order_id: None,
            expiry: Seconds::one_hour(),
        }
    }

    #[test]
    fn rejects_out_of_range_amounts() {
        assert!(matches!(
            new_invoice(btc::Sats(0)).validate(),
            Err(Error::InvalidAmount)
        ));
        assert!(matches!(
            new_invoice(btc::Sats(-5)).validate(),
            Err(Error::InvalidAmount)
        ));
        assert!(matches!(
            new_invoice(btc::Sats(MAX_INVOICE_SATS + 1)).validate(),
            Err(Error::InvalidAmount)
        ));
        assert!(new_invoice(btc::Sats(MAX_INVOICE_SATS)).validate().is_ok());
        assert!(new_invoice(btc::Sats(1)).validate().is_ok());
    }

    #[test]
    fn rejects_overlong_memo() {
        let mut invoice = new_invoice(btc::Sats(100));
        invoice.memo = Some("x".repeat(257));
        assert!(matches!(invoice.validate(), Err(Error::InvalidMemo(_))));
        invoice.memo = Some("x".repeat(256));
        assert!(invoice.validate().is_ok());
    }

    #[test]
    fn rejects_non_positive_expiry() {
        let mut invoice = new_invoice(btc::Sats(100));
        invoice.expiry = Seconds(0);
        assert!(matches!(invoice.validate(), Err(Error::InvalidExpiry(_))));
    }

    fn payment(created: DateTime<Utc>, expiry: Seconds) -> Payment {
        Payment {
            id: Id(1),
            user_id: user::Id(1),
            payment_request: ln::RawInvoice::new("lnbcrt1example"),
            hashed_preimage: Hex::encode(&[7u8; 32]),
            preimage: None,
            memo: None,
            description: None,
            callback_url: None,
            customer_order_id: None,
            expiry,
            amount: btc::Sats(1000),
            direction: Direction::Inbound,
            status: Status::Open,
            settled_at: None,
            created,
            updated: created,
        }
    }

    #[test]
    fn short_expiry_lapses() {
        let created = Utc::now() - Duration::milliseconds(1500);
        assert!(payment(created, Seconds(1)).is_expired());
        assert!(!payment(created, Seconds(3600)).is_expired());
    }

    #[test]
    fn msat_amount_is_redundant_with_sats() {
        let payment = payment(Utc::now(), Seconds::one_hour());
        assert_eq!(payment.amount_msats(), btc::MilliSats(1_000_000));
    }

    #[test]
    fn empty_strings_normalize_to_null() {
        assert_eq!(normalize(Some(String::new())), None);
        assert_eq!(normalize(Some("memo".to_owned())), Some("memo".to_owned()));
        assert_eq!(normalize(None), None);
    }

    fn open_payment_spec() -> NewPayment {
        NewPayment {
            user_id: user::Id(1),
            payment_request: ln::RawInvoice::new("lnbcrt1example"),
            hashed_preimage: Hex::encode(&[7u8; 32]),
            preimage: None,
            memo: None,
            description: None,
            callback_url: None,
            customer_order_id: None,
            expiry: Seconds::one_hour(),
            amount: btc::Sats(1000),
            direction: Direction::Inbound,
            status: Status::Open,
            settled_at: None,
        }
    }

    #[test]
    #[should_panic(expected = "preimage")]
    fn open_payment_must_not_carry_a_preimage() {
        let mut new = open_payment_spec();
        new.preimage = Some(Hex::encode(&[1u8; 32]));
        new.assert_valid();
    }

    #[test]
    #[should_panic(expected = "hashed preimage")]
    fn payment_must_carry_a_hashed_preimage() {
        let mut new = open_payment_spec();
        new.hashed_preimage = Hex::encode(&[]);
        new.assert_valid();
    }
}
