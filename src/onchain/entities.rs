//! Handles users moving funds on-chain. The deposit flow goes as follows:
//! - the user is issued a deposit address, recorded as an inbound row with
//!   no outpoint yet
//! - the funding transaction shows up in the mempool and the tx listener
//!   binds its `(txid, vout)` to the row; the balance does not move yet
//! - after enough confirmations the block listener promotes the row and
//!   credits the user in one transaction.
//!
//! Withdrawals debit first, then broadcast from the node wallet, and record
//! the resulting outpoint.

use crate::{balance, bitcoind, btc, ln, user};
use chrono::{DateTime, Utc};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("amount must be positive")]
    InvalidAmount,
    #[error("user not found")]
    NotFound,
    #[error("output is already bound to a deposit")]
    AlreadyBound,
    #[error("{0}")]
    Lightning(#[from] ln::Error),
    #[error("{0}")]
    Bitcoin(#[from] bitcoind::Error),
    #[error("{0}")]
    Balance(#[from] balance::Error),
    #[error(transparent)]
    Database(#[from] sqlx::Error),
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Id(pub i32);

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

/// A confirmed location on the chain: output `v_out` of transaction `tx_id`.
/// Stored as a pair of nullable columns that are set together.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OutPoint {
    pub tx_id: btc::TxId,
    pub v_out: i32,
}

/// An on-chain deposit or withdrawal. A deposit's `amount` is unknown until
/// the funding output is observed; a withdrawal's is fixed at creation.
#[derive(Debug, Clone)]
pub struct Transaction {
    pub id: Id,
    pub user_id: user::Id,
    pub address: btc::Address,
    pub outpoint: Option<OutPoint>,
    pub direction: Direction,
    pub amount: Option<btc::Sats>,
    pub description: Option<String>,
    pub confirmed: Option<DateTime<Utc>>,
    pub created: DateTime<Utc>,
    pub updated: DateTime<Utc>,
}

impl Transaction {
    pub fn is_confirmed(&self) -> bool {
        self.confirmed.is_some()
    }

    /// Whether confirming this row moves the ledger. Deposits credit on
    /// confirmation; a withdrawal already debited when it was broadcast.
    pub(crate) fn credits_on_confirm(&self) -> bool {
        self.direction == Direction::Inbound
    }
}

/// Parameters for an on-chain withdrawal. With `send_all` set, any supplied
/// amount is ignored and the user's entire balance is resolved in its place.
#[derive(Debug, Clone)]
pub struct Withdraw {
    pub amount: Option<btc::Sats>,
    pub send_all: bool,
    pub address: btc::Address,
    pub target_conf: Option<i32>,
    pub sat_per_byte: Option<i64>,
    pub description: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    fn transaction(direction: Direction) -> Transaction {
        let key = bitcoin::PublicKey::from_str(
            "0279be667ef9dcbbac55a06295ce870b07029bfcdb2dce28d959f2815b16f81798",
        )
        .unwrap();
        Transaction {
            id: Id(1),
            user_id: user::Id(1),
            address: btc::Address::p2pkh(&key, btc::NETWORK),
            outpoint: None,
            direction,
            amount: Some(btc::Sats(20_000)),
            description: None,
            confirmed: None,
            created: Utc::now(),
            updated: Utc::now(),
        }
    }

    #[test]
    fn only_deposits_credit_on_confirmation() {
        assert!(transaction(Direction::Inbound).credits_on_confirm());
        assert!(!transaction(Direction::Outbound).credits_on_confirm());
    }

    #[test]
    fn confirmation_tracks_timestamp() {
        let mut tx = transaction(Direction::Inbound);
        assert!(!tx.is_confirmed());
        tx.confirmed = Some(Utc::now());
        assert!(tx.is_confirmed());
    }
}
