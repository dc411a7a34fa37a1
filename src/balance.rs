//! The ledger. These two functions are the only place in the system where
//! user balances change; everything else orders its work around them. Both
//! run inside a transaction supplied by the caller, so a balance mutation
//! commits or rolls back together with the payment-state transition that
//! caused it. The database enforces that balances never go negative, and the
//! row lock taken by `UPDATE ... RETURNING` serializes concurrent mutations
//! of the same user.

use crate::{btc, database, user};
use chrono::{DateTime, Utc};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("amount must be positive")]
    InvalidAmount,
    #[error("insufficient balance")]
    InsufficientBalance,
    #[error("user not found")]
    NotFound,
    #[error(transparent)]
    Database(#[from] sqlx::Error),
}

/// Credits `amount` to the user and returns the updated user row.
pub async fn increase(
    data_tx: &mut database::Transaction,
    user_id: user::Id,
    amount: btc::Sats,
) -> Result<user::User, Error> {
    if amount <= btc::Sats(0) {
        return Err(Error::InvalidAmount);
    }
    let row = sqlx::query_as::<_, UserRow>(
        "UPDATE users SET balance = balance + $1, updated = NOW() WHERE id = $2 \
            RETURNING id, email, balance, created, updated, deleted",
    )
    .bind(amount.0)
    .bind(user_id.0)
    .fetch_optional(data_tx)
    .await?;
    row.map(|row| row.into_entity()).ok_or(Error::NotFound)
}

/// Debits `amount` from the user and returns the updated user row. A debit
/// past zero trips the balance check constraint and surfaces as
/// [`Error::InsufficientBalance`] with the transaction left usable for
/// rollback.
pub async fn decrease(
    data_tx: &mut database::Transaction,
    user_id: user::Id,
    amount: btc::Sats,
) -> Result<user::User, Error> {
    if amount <= btc::Sats(0) {
        return Err(Error::InvalidAmount);
    }
    let result = sqlx::query_as::<_, UserRow>(
        "UPDATE users SET balance = balance - $1, updated = NOW() WHERE id = $2 \
            RETURNING id, email, balance, created, updated, deleted",
    )
    .bind(amount.0)
    .bind(user_id.0)
    .fetch_optional(data_tx)
    .await;
    match result {
        Ok(Some(row)) => Ok(row.into_entity()),
        Ok(None) => Err(Error::NotFound),
        Err(e) if is_balance_check_violation(&e) => Err(Error::InsufficientBalance),
        Err(e) => Err(e.into()),
    }
}

fn is_balance_check_violation(e: &sqlx::Error) -> bool {
    match e {
        // 23514 = check_violation; the only check on users is balance >= 0
        sqlx::Error::Database(e) => e.code().as_deref() == Some("23514"),
        _ => false,
    }
}

#[derive(sqlx::FromRow, Debug)]
struct UserRow {
    id: i32,
    email: String,
    balance: i64,
    created: DateTime<Utc>,
    updated: DateTime<Utc>,
    deleted: Option<DateTime<Utc>>,
}

impl UserRow {
    fn into_entity(self) -> user::User {
        user::User {
            id: user::Id(self.id),
            email: user::Email(self.email),
            balance: btc::Sats(self.balance),
            created: self.created,
            updated: self.updated,
            deleted: self.deleted,
        }
    }
}
