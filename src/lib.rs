//! Core of a custodial Lightning payments service: the authoritative user
//! ledger, the off-chain and on-chain payment state machines, the gateways to
//! our Lightning and Bitcoin nodes, and the merchant callback notifier.
//!
//! The HTTP surface, authentication, and configuration loading live in the
//! host service; this crate only exposes the operations and background
//! workers they drive.

use futures::FutureExt;
use std::{future::Future, panic::AssertUnwindSafe};

pub mod apikey;
pub mod balance;
pub mod bitcoind;
pub mod btc;
pub mod callback;
pub mod database;
mod hex;
pub mod ln;
pub mod offchain;
pub mod onchain;
pub mod seconds;
pub mod user;
mod worker;

pub use hex::Hex;

#[derive(Debug, Clone, Copy)]
pub struct QueryRange {
    /// Maximum number of rows to return. Zero means unbounded.
    pub limit: i64,
    pub offset: i64,
}

async fn swallow_panic(f: impl Future<Output = ()>) {
    let _ = AssertUnwindSafe(f).catch_unwind().await;
}
