//! Gateway to our Bitcoin full node. The core only needs a narrow slice of
//! it: transaction lookups with confirmation counts, and notification
//! streams for mempool transactions and new blocks. [`BitcoinClient`] is the
//! capability set, [`BitcoindClient`] the bitcoind-backed implementation.

use crate::btc;
use async_trait::async_trait;
use futures::stream::BoxStream;
use serde::Deserialize;
use std::time::Duration;
use thiserror::Error;
use url::Url;

mod node;

pub use node::BitcoindClient;

#[derive(Debug, Error)]
pub enum Error {
    #[error("bitcoin node unavailable: {0}")]
    Unavailable(String),
    #[error("transaction not found")]
    TxNotFound,
}

/// A single output of an observed transaction.
#[derive(Debug, Clone)]
pub struct TxOutput {
    pub amount: btc::Sats,
    pub pk_script: bitcoin::Script,
}

impl TxOutput {
    /// The destination address under the configured network parameters, if
    /// the script has a standard address form.
    pub fn address(&self) -> Option<btc::Address> {
        btc::address_from_script(&self.pk_script)
    }
}

#[derive(Debug, Clone)]
pub struct TxInfo {
    pub confirmations: u32,
    pub outputs: Vec<TxOutput>,
}

/// A transaction observed entering the mempool.
#[derive(Debug, Clone)]
pub struct RawTx {
    pub tx_id: btc::TxId,
    pub outputs: Vec<TxOutput>,
}

/// A new-block notification. Listeners rescan their own state on every
/// block, so the contents are not carried.
#[derive(Debug, Clone, Copy)]
pub struct BlockNotification {
    pub height: u64,
}

/// Capabilities the core needs from the Bitcoin node. Shared process-wide;
/// must be safe for concurrent calls.
#[async_trait]
pub trait BitcoinClient: Send + Sync {
    async fn get_tx(&self, tx_id: &btc::TxId) -> Result<TxInfo, Error>;

    /// A lazy, infinite sequence of mempool transactions in arrival order.
    async fn subscribe_raw_txs(&self) -> Result<BoxStream<'static, RawTx>, Error>;

    /// A lazy, infinite sequence of new-block notifications.
    async fn subscribe_blocks(&self) -> Result<BoxStream<'static, BlockNotification>, Error>;
}

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub url: Url,
    pub rpc_user: String,
    pub rpc_password: String,
    /// How often the mempool and the chain tip are polled to synthesize the
    /// notification streams.
    pub poll_interval: Duration,
}
