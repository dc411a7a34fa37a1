use super::{BitcoinClient, BlockNotification, Config, Error, RawTx, TxInfo, TxOutput};
use crate::btc;
use async_trait::async_trait;
use bitcoincore_rpc::RpcApi;
use futures::stream::BoxStream;
use futures::StreamExt;
use std::collections::{HashSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;

/// Talks to bitcoind over its JSON-RPC interface. The RPC client is
/// blocking, so calls run on the blocking thread pool; the mempool and block
/// subscriptions are synthesized by polling, which keeps the notification
/// contract identical to a push-based node without extra infrastructure.
pub struct BitcoindClient {
    rpc: Arc<bitcoincore_rpc::Client>,
    poll_interval: Duration,
}

impl BitcoindClient {
    pub fn connect(config: Config) -> Result<Self, Error> {
        let rpc = bitcoincore_rpc::Client::new(
            &config.url.to_string(),
            bitcoincore_rpc::Auth::UserPass(config.rpc_user, config.rpc_password),
        )
        .map_err(|e| Error::Unavailable(e.to_string()))?;
        Ok(Self {
            rpc: Arc::new(rpc),
            poll_interval: config.poll_interval,
        })
    }
}

async fn blocking_rpc<T, F>(rpc: &Arc<bitcoincore_rpc::Client>, f: F) -> Result<T, Error>
where
    T: Send + 'static,
    F: FnOnce(&bitcoincore_rpc::Client) -> bitcoincore_rpc::Result<T> + Send + 'static,
{
    let rpc = rpc.clone();
    match tokio::task::spawn_blocking(move || f(&rpc)).await {
        Ok(result) => result.map_err(map_rpc_error),
        Err(e) => Err(Error::Unavailable(e.to_string())),
    }
}

fn map_rpc_error(e: bitcoincore_rpc::Error) -> Error {
    // -5 = RPC_INVALID_ADDRESS_OR_KEY, what bitcoind answers for an unknown
    // transaction
    match &e {
        bitcoincore_rpc::Error::JsonRpc(bitcoincore_rpc::jsonrpc::error::Error::Rpc(rpc))
            if rpc.code == -5 =>
        {
            Error::TxNotFound
        }
        _ => Error::Unavailable(e.to_string()),
    }
}

fn outputs_of(info: bitcoincore_rpc::json::GetRawTransactionResult) -> Vec<TxOutput> {
    info.vout
        .into_iter()
        .map(|out| TxOutput {
            amount: btc::Sats(out.value.as_sat() as i64),
            pk_script: bitcoin::Script::from(out.script_pub_key.hex),
        })
        .collect()
}

/// One poll of the mempool. Returns transactions not seen on the previous
/// poll and replaces the seen-set with the current snapshot, so it stays
/// bounded by the mempool size.
async fn poll_mempool(
    rpc: &Arc<bitcoincore_rpc::Client>,
    seen: &mut HashSet<btc::TxId>,
) -> Vec<RawTx> {
    let mempool = match blocking_rpc(rpc, |rpc| rpc.get_raw_mempool()).await {
        Ok(tx_ids) => tx_ids,
        Err(e) => {
            log::error!("mempool poll failed: {}", e);
            return Vec::new();
        }
    };
    let mut fresh = Vec::new();
    for tx_id in &mempool {
        if seen.contains(tx_id) {
            continue;
        }
        let tx_id = *tx_id;
        match blocking_rpc(rpc, move |rpc| rpc.get_raw_transaction_info(&tx_id, None)).await {
            Ok(info) => fresh.push(RawTx {
                tx_id,
                outputs: outputs_of(info),
            }),
            // The tx can be evicted or mined between the two calls.
            Err(e) => log::info!("mempool tx {} vanished before lookup: {}", tx_id, e),
        }
    }
    *seen = mempool.into_iter().collect();
    fresh
}

#[async_trait]
impl BitcoinClient for BitcoindClient {
    async fn get_tx(&self, tx_id: &btc::TxId) -> Result<TxInfo, Error> {
        let tx_id = *tx_id;
        let info = blocking_rpc(&self.rpc, move |rpc| {
            rpc.get_raw_transaction_info(&tx_id, None)
        })
        .await?;
        Ok(TxInfo {
            confirmations: info.confirmations.unwrap_or(0),
            outputs: outputs_of(info),
        })
    }

    async fn subscribe_raw_txs(&self) -> Result<BoxStream<'static, RawTx>, Error> {
        let state = (
            self.rpc.clone(),
            HashSet::new(),
            VecDeque::new(),
            self.poll_interval,
        );
        Ok(futures::stream::unfold(
            state,
            |(rpc, mut seen, mut queue, poll_interval)| async move {
                loop {
                    if let Some(raw_tx) = queue.pop_front() {
                        return Some((raw_tx, (rpc, seen, queue, poll_interval)));
                    }
                    queue.extend(poll_mempool(&rpc, &mut seen).await);
                    if queue.is_empty() {
                        tokio::time::sleep(poll_interval).await;
                    }
                }
            },
        )
        .boxed())
    }

    async fn subscribe_blocks(&self) -> Result<BoxStream<'static, BlockNotification>, Error> {
        let state = (self.rpc.clone(), None::<u64>, self.poll_interval);
        Ok(futures::stream::unfold(
            state,
            |(rpc, mut tip, poll_interval)| async move {
                loop {
                    match blocking_rpc(&rpc, |rpc| rpc.get_block_count()).await {
                        Ok(height) => match tip {
                            // The first poll only records where the chain is;
                            // nothing new has happened yet.
                            None => tip = Some(height),
                            Some(known) if height > known => {
                                return Some((
                                    BlockNotification { height },
                                    (rpc, Some(height), poll_interval),
                                ));
                            }
                            Some(_) => {}
                        },
                        Err(e) => log::error!("chain tip poll failed: {}", e),
                    }
                    tokio::time::sleep(poll_interval).await;
                }
            },
        )
        .boxed())
    }
}
