use crate::bitcoind::{self, BitcoinClient};
use crate::database::Database;
use crate::ln::LightningClient;
use crate::{balance, btc, swallow_panic, user, worker, QueryRange};
use async_trait::async_trait;
use futures::StreamExt;
use std::sync::Arc;

mod entities;

pub use entities::{Direction, Error, Id, OutPoint, Transaction, Withdraw};

/// A deposit row is promoted and credited once its funding transaction has
/// this many confirmations.
const REQUIRED_CONFIRMATIONS: u32 = 3;

/// Returns a deposit address for the user. An already issued address whose
/// deposit has not arrived yet is reused unless the caller forces a fresh
/// one; this keeps the address book dense without burning an address per
/// page load.
pub async fn new_deposit_address(
    db: &Database,
    ln: &dyn LightningClient,
    user_id: user::Id,
    force_new: bool,
    description: Option<String>,
) -> Result<Transaction, Error> {
    if !force_new {
        if let Some(open) = queries::find_open_inbound(db, user_id).await? {
            return Ok(open);
        }
    }
    let address = ln.new_address().await?;
    let mut data_tx = db.begin().await?;
    let transaction = queries::insert_deposit(
        &mut data_tx,
        user_id,
        &address,
        description.filter(|s| !s.is_empty()),
    )
    .await?;
    data_tx.commit().await?;
    Ok(transaction)
}

pub async fn get(db: &Database, id: Id, user_id: user::Id) -> Result<Option<Transaction>, Error> {
    queries::get(db, id, user_id).await
}

/// Transactions of the user in creation order. A zero limit means unbounded.
pub async fn list(
    db: &Database,
    user_id: user::Id,
    range: QueryRange,
) -> Result<Vec<Transaction>, Error> {
    queries::list(db, user_id, range).await
}

/// Withdraws on-chain funds out of the user's balance: debit, broadcast from
/// the node wallet, record the resulting outpoint. The debit rolls back if
/// the broadcast fails. With `send_all`, the amount is resolved from the
/// ledger here; the node is never asked to drain the wallet.
pub async fn withdraw(
    db: &Database,
    ln: &dyn LightningClient,
    btc_client: &dyn BitcoinClient,
    user_id: user::Id,
    withdraw: Withdraw,
) -> Result<Transaction, Error> {
    let user = user::get(db, user_id).await?.ok_or(Error::NotFound)?;
    let amount = if withdraw.send_all {
        user.balance
    } else {
        withdraw.amount.unwrap_or_default()
    };
    if amount <= btc::Sats(0) {
        return Err(Error::InvalidAmount);
    }

    let mut data_tx = db.begin().await?;
    balance::decrease(&mut data_tx, user_id, amount).await?;
    let tx_id = match ln
        .send_coins(
            &withdraw.address,
            amount,
            withdraw.target_conf,
            withdraw.sat_per_byte,
        )
        .await
    {
        Ok(tx_id) => tx_id,
        Err(e) => {
            data_tx.rollback().await?;
            return Err(e.into());
        }
    };
    // The coins are on the wire at this point; the debit must commit no
    // matter what. If the outpoint cannot be resolved right now the row is
    // recorded without one.
    let outpoint = match resolve_outpoint(btc_client, tx_id, &withdraw.address, amount).await {
        Ok(outpoint) => Some(outpoint),
        Err(e) => {
            log::error!(
                "could not locate our output in broadcast tx {}: {}",
                tx_id,
                e
            );
            None
        }
    };
    let transaction = queries::insert_withdrawal(
        &mut data_tx,
        user_id,
        &withdraw.address,
        outpoint,
        amount,
        withdraw.description.filter(|s| !s.is_empty()),
    )
    .await?;
    data_tx.commit().await?;
    log::info!(
        "withdrew {} sat for {:?} in tx {}",
        amount.0,
        user_id,
        tx_id
    );
    Ok(transaction)
}

/// Finds the output of the broadcast transaction that pays `address` exactly
/// `amount`.
async fn resolve_outpoint(
    btc_client: &dyn BitcoinClient,
    tx_id: btc::TxId,
    address: &btc::Address,
    amount: btc::Sats,
) -> Result<OutPoint, bitcoind::Error> {
    let info = btc_client.get_tx(&tx_id).await?;
    for (v_out, output) in info.outputs.iter().enumerate() {
        if output.amount == amount && output.address().as_ref() == Some(address) {
            return Ok(OutPoint {
                tx_id,
                v_out: v_out as i32,
            });
        }
    }
    Err(bitcoind::Error::TxNotFound)
}

/// Starts the mempool listener, which matches incoming transactions against
/// issued deposit addresses and binds their outpoints. No balance moves
/// here; that is the block listener's job.
pub fn start_tx_listener(db: Database, btc_client: Arc<dyn BitcoinClient>) {
    worker::start(TxListener { db, btc: btc_client });
}

struct TxListener {
    db: Database,
    btc: Arc<dyn BitcoinClient>,
}

#[async_trait]
impl worker::Worker for TxListener {
    fn name(&self) -> &'static str {
        "mempool tx listener"
    }

    async fn run(&mut self) {
        let mut stream = match self.btc.subscribe_raw_txs().await {
            Ok(stream) => stream,
            Err(e) => {
                log::error!("raw tx subscription failed: {}", e);
                return;
            }
        };
        while let Some(raw_tx) = stream.next().await {
            swallow_panic(async {
                if let Err(e) = process_raw_tx(&self.db, &raw_tx).await {
                    log::error!("failed to process mempool tx {}: {}", raw_tx.tx_id, e);
                }
            })
            .await;
        }
    }
}

async fn process_raw_tx(db: &Database, raw_tx: &bitcoind::RawTx) -> Result<(), Error> {
    for (v_out, output) in raw_tx.outputs.iter().enumerate() {
        let address = match output.address() {
            Some(address) => address,
            // Non-standard script; nothing we could have issued.
            None => continue,
        };
        let rows = queries::find_by_address(db, &address).await?;
        if rows.is_empty() {
            continue;
        }
        let outpoint = OutPoint {
            tx_id: raw_tx.tx_id,
            v_out: v_out as i32,
        };
        if rows.iter().any(|row| row.outpoint == Some(outpoint)) {
            // Redelivered mempool tx; this output is already recorded.
            continue;
        }
        bind_or_insert(db, &rows, outpoint, output.amount, &address).await?;
    }
    Ok(())
}

/// Binds the output to the first unbound row for its address, or records a
/// fresh deposit when the user sent to an address that was already used.
/// Every bind affects exactly one row; losing the race to another bind
/// surfaces as [`Error::AlreadyBound`] and the next candidate is tried.
async fn bind_or_insert(
    db: &Database,
    rows: &[Transaction],
    outpoint: OutPoint,
    amount: btc::Sats,
    address: &btc::Address,
) -> Result<(), Error> {
    for row in rows.iter().filter(|row| row.outpoint.is_none()) {
        match queries::bind(db, row.id, outpoint, amount).await {
            Ok(bound) => {
                log::info!(
                    "bound deposit {:?} for {:?} to {}:{}",
                    bound.id,
                    bound.user_id,
                    outpoint.tx_id,
                    outpoint.v_out
                );
                return Ok(());
            }
            Err(Error::AlreadyBound) => continue,
            Err(e) => return Err(e),
        }
    }
    let user_id = rows[0].user_id;
    match queries::insert_bound_deposit(db, user_id, address, outpoint, amount).await? {
        Some(deposit) => log::info!(
            "recorded repeat deposit {:?} for {:?} on reused address {}",
            deposit.id,
            user_id,
            address
        ),
        // A concurrent listener pass recorded the same outpoint first.
        None => log::info!("output {}:{} already recorded", outpoint.tx_id, outpoint.v_out),
    }
    Ok(())
}

/// Starts the confirmation listener. On every new block it rescans all
/// unconfirmed rows with a known outpoint and promotes those that have
/// matured; promotion and the ledger credit commit atomically.
pub fn start_block_listener(db: Database, btc_client: Arc<dyn BitcoinClient>) {
    worker::start(BlockListener { db, btc: btc_client });
}

struct BlockListener {
    db: Database,
    btc: Arc<dyn BitcoinClient>,
}

#[async_trait]
impl worker::Worker for BlockListener {
    fn name(&self) -> &'static str {
        "block listener"
    }

    async fn run(&mut self) {
        let mut stream = match self.btc.subscribe_blocks().await {
            Ok(stream) => stream,
            Err(e) => {
                log::error!("block subscription failed: {}", e);
                return;
            }
        };
        while let Some(block) = stream.next().await {
            log::info!("scanning unconfirmed deposits at height {}", block.height);
            swallow_panic(async {
                if let Err(e) = confirm_matured(&self.db, self.btc.as_ref()).await {
                    log::error!("confirmation pass failed: {}", e);
                }
            })
            .await;
        }
    }
}

async fn confirm_matured(db: &Database, btc_client: &dyn BitcoinClient) -> Result<(), Error> {
    let rows = queries::find_unconfirmed_with_outpoint(db).await?;
    for row in rows {
        let outpoint = match row.outpoint {
            Some(outpoint) => outpoint,
            None => continue,
        };
        // A node hiccup only delays this row until the next block.
        let info = match btc_client.get_tx(&outpoint.tx_id).await {
            Ok(info) => info,
            Err(e) => {
                log::error!("confirmation lookup for {} failed: {}", outpoint.tx_id, e);
                continue;
            }
        };
        if info.confirmations < REQUIRED_CONFIRMATIONS {
            continue;
        }
        let output = match info.outputs.get(outpoint.v_out as usize) {
            Some(output) => output,
            None => {
                log::error!(
                    "tx {} has no output {}, not confirming {:?}",
                    outpoint.tx_id,
                    outpoint.v_out,
                    row.id
                );
                continue;
            }
        };
        if let Some(amount) = row.amount {
            if amount != output.amount {
                log::error!(
                    "recorded amount {} does not match output value {} for {:?}, not confirming",
                    amount.0,
                    output.amount.0,
                    row.id
                );
                continue;
            }
        }
        promote(db, &row, output.amount).await?;
    }
    Ok(())
}

/// Promotes one matured row. The `confirmed = FALSE` condition makes a
/// second block notification observing the same row a no-op, so the credit
/// happens exactly once.
async fn promote(db: &Database, row: &Transaction, amount: btc::Sats) -> Result<(), Error> {
    let mut data_tx = db.begin().await?;
    let confirmed = match queries::confirm(&mut data_tx, row.id, amount).await? {
        Some(confirmed) => confirmed,
        None => {
            data_tx.rollback().await?;
            return Ok(());
        }
    };
    if confirmed.credits_on_confirm() {
        balance::increase(&mut data_tx, confirmed.user_id, amount).await?;
    }
    data_tx.commit().await?;
    log::info!(
        "confirmed {:?} transaction {:?} for {:?}",
        confirmed.direction,
        confirmed.id,
        confirmed.user_id
    );
    Ok(())
}

mod queries {
    use super::{Direction, Error, Id, OutPoint, Transaction};
    use crate::database::{self, Database};
    use crate::{btc, user, QueryRange};
    use chrono::{DateTime, Utc};
    use const_format::formatcp;
    use std::str::FromStr;

    const COLUMNS: &str = "id, user_id, address, txid, vout, direction, amount_sat, \
        description, confirmed, confirmed_at, created, updated";

    pub(super) async fn insert_deposit(
        data_tx: &mut database::Transaction,
        user_id: user::Id,
        address: &btc::Address,
        description: Option<String>,
    ) -> Result<Transaction, Error> {
        Ok(sqlx::query_as::<_, TransactionRow>(formatcp!(
            "INSERT INTO transactions (user_id, address, direction, description) \
                VALUES ($1, $2, 'INBOUND', $3) RETURNING {}",
            COLUMNS
        ))
        .bind(user_id.0)
        .bind(address.to_string())
        .bind(description)
        .fetch_one(&mut *data_tx)
        .await?
        .into_entity())
    }

    pub(super) async fn insert_withdrawal(
        data_tx: &mut database::Transaction,
        user_id: user::Id,
        address: &btc::Address,
        outpoint: Option<OutPoint>,
        amount: btc::Sats,
        description: Option<String>,
    ) -> Result<Transaction, Error> {
        Ok(sqlx::query_as::<_, TransactionRow>(formatcp!(
            "INSERT INTO transactions (user_id, address, txid, vout, direction, amount_sat, description) \
                VALUES ($1, $2, $3, $4, 'OUTBOUND', $5, $6) RETURNING {}",
            COLUMNS
        ))
        .bind(user_id.0)
        .bind(address.to_string())
        .bind(outpoint.map(|outpoint| outpoint.tx_id.to_string()))
        .bind(outpoint.map(|outpoint| outpoint.v_out))
        .bind(amount.0)
        .bind(description)
        .fetch_one(&mut *data_tx)
        .await?
        .into_entity())
    }

    /// Records a deposit for an output paying an address whose rows are all
    /// bound already. Returns None when the outpoint is already taken.
    pub(super) async fn insert_bound_deposit(
        db: &Database,
        user_id: user::Id,
        address: &btc::Address,
        outpoint: OutPoint,
        amount: btc::Sats,
    ) -> Result<Option<Transaction>, Error> {
        Ok(sqlx::query_as::<_, TransactionRow>(formatcp!(
            "INSERT INTO transactions (user_id, address, txid, vout, direction, amount_sat) \
                VALUES ($1, $2, $3, $4, 'INBOUND', $5) \
                ON CONFLICT (txid, vout) DO NOTHING RETURNING {}",
            COLUMNS
        ))
        .bind(user_id.0)
        .bind(address.to_string())
        .bind(outpoint.tx_id.to_string())
        .bind(outpoint.v_out)
        .bind(amount.0)
        .fetch_optional(db)
        .await?
        .map(|row| row.into_entity()))
    }

    /// Sets the outpoint on one unbound row. The `txid IS NULL` condition
    /// makes this affect exactly one row or none; none means another bind
    /// got there first.
    pub(super) async fn bind(
        db: &Database,
        id: Id,
        outpoint: OutPoint,
        amount: btc::Sats,
    ) -> Result<Transaction, Error> {
        sqlx::query_as::<_, TransactionRow>(formatcp!(
            "UPDATE transactions SET txid = $2, vout = $3, amount_sat = $4, updated = NOW() \
                WHERE id = $1 AND txid IS NULL RETURNING {}",
            COLUMNS
        ))
        .bind(id.0)
        .bind(outpoint.tx_id.to_string())
        .bind(outpoint.v_out)
        .bind(amount.0)
        .fetch_optional(db)
        .await?
        .map(|row| row.into_entity())
        .ok_or(Error::AlreadyBound)
    }

    /// Marks one row confirmed. Returns None when the row was confirmed by
    /// an earlier pass.
    pub(super) async fn confirm(
        data_tx: &mut database::Transaction,
        id: Id,
        amount: btc::Sats,
    ) -> Result<Option<Transaction>, Error> {
        Ok(sqlx::query_as::<_, TransactionRow>(formatcp!(
            "UPDATE transactions \
                SET confirmed = TRUE, confirmed_at = NOW(), amount_sat = $2, updated = NOW() \
                WHERE id = $1 AND confirmed = FALSE RETURNING {}",
            COLUMNS
        ))
        .bind(id.0)
        .bind(amount.0)
        .fetch_optional(&mut *data_tx)
        .await?
        .map(|row| row.into_entity()))
    }

    /// The most recent inbound row still waiting for its deposit, used by
    /// the address-reuse logic.
    pub(super) async fn find_open_inbound(
        db: &Database,
        user_id: user::Id,
    ) -> Result<Option<Transaction>, Error> {
        Ok(sqlx::query_as::<_, TransactionRow>(formatcp!(
            "SELECT {} FROM transactions \
                WHERE user_id = $1 AND direction = 'INBOUND' AND txid IS NULL \
                ORDER BY created DESC LIMIT 1",
            COLUMNS
        ))
        .bind(user_id.0)
        .fetch_optional(db)
        .await?
        .map(|row| row.into_entity()))
    }

    /// All inbound rows issued for an address, oldest first. An address can
    /// be hit multiple times; older rows already carry an outpoint.
    pub(super) async fn find_by_address(
        db: &Database,
        address: &btc::Address,
    ) -> Result<Vec<Transaction>, Error> {
        Ok(sqlx::query_as::<_, TransactionRow>(formatcp!(
            "SELECT {} FROM transactions \
                WHERE address = $1 AND direction = 'INBOUND' ORDER BY created ASC",
            COLUMNS
        ))
        .bind(address.to_string())
        .fetch_all(db)
        .await?
        .into_iter()
        .map(|row| row.into_entity())
        .collect())
    }

    /// The block listener's scan set: everything bound but not yet
    /// confirmed.
    pub(super) async fn find_unconfirmed_with_outpoint(
        db: &Database,
    ) -> Result<Vec<Transaction>, Error> {
        Ok(sqlx::query_as::<_, TransactionRow>(formatcp!(
            "SELECT {} FROM transactions WHERE confirmed = FALSE AND txid IS NOT NULL",
            COLUMNS
        ))
        .fetch_all(db)
        .await?
        .into_iter()
        .map(|row| row.into_entity())
        .collect())
    }

    pub(super) async fn get(
        db: &Database,
        id: Id,
        user_id: user::Id,
    ) -> Result<Option<Transaction>, Error> {
        Ok(sqlx::query_as::<_, TransactionRow>(formatcp!(
            "SELECT {} FROM transactions WHERE id = $1 AND user_id = $2",
            COLUMNS
        ))
        .bind(id.0)
        .bind(user_id.0)
        .fetch_optional(db)
        .await?
        .map(|row| row.into_entity()))
    }

    pub(super) async fn list(
        db: &Database,
        user_id: user::Id,
        range: QueryRange,
    ) -> Result<Vec<Transaction>, Error> {
        Ok(sqlx::query_as::<_, TransactionRow>(formatcp!(
            "SELECT {} FROM transactions WHERE user_id = $1 ORDER BY created ASC \
                LIMIT NULLIF($2, 0) OFFSET $3",
            COLUMNS
        ))
        .bind(user_id.0)
        .bind(range.limit)
        .bind(range.offset)
        .fetch_all(db)
        .await?
        .into_iter()
        .map(|row| row.into_entity())
        .collect())
    }

    #[derive(sqlx::FromRow, Debug)]
    struct TransactionRow {
        id: i32,
        user_id: i32,
        address: String,
        txid: Option<String>,
        vout: Option<i32>,
        direction: String,
        amount_sat: Option<i64>,
        description: Option<String>,
        confirmed: bool,
        confirmed_at: Option<DateTime<Utc>>,
        created: DateTime<Utc>,
        updated: DateTime<Utc>,
    }

    impl TransactionRow {
        fn into_entity(self) -> Transaction {
            debug_assert_eq!(self.confirmed, self.confirmed_at.is_some());
            Transaction {
                id: Id(self.id),
                user_id: user::Id(self.user_id),
                address: btc::Address::from_str(&self.address).unwrap(),
                outpoint: match (self.txid, self.vout) {
                    (Some(txid), Some(v_out)) => Some(OutPoint {
                        tx_id: btc::TxId::from_str(&txid).unwrap(),
                        v_out,
                    }),
                    (None, None) => None,
                    _ => unreachable!("txid and vout must be set together"),
                },
                direction: match self.direction.as_str() {
                    "INBOUND" => Direction::Inbound,
                    "OUTBOUND" => Direction::Outbound,
                    direction => unreachable!("invalid direction {:?}", direction),
                },
                amount: self.amount_sat.map(btc::Sats),
                description: self.description,
                confirmed: self.confirmed_at,
                created: self.created,
                updated: self.updated,
            }
        }
    }
}
