use chrono::{DateTime, Utc};

use crate::btc;

#[derive(Debug, Clone)]
pub struct Email(pub String);

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Id(pub i32);

/// A registered user and their custodial balance. Users are never hard
/// deleted; `deleted` is a tombstone the host service maintains.
#[derive(Debug, Clone)]
pub struct User {
    pub id: Id,
    pub email: Email,
    pub balance: btc::Sats,
    pub created: DateTime<Utc>,
    pub updated: DateTime<Utc>,
    pub deleted: Option<DateTime<Utc>>,
}
