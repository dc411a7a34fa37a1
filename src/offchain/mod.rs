use crate::callback;
use crate::database::Database;
use crate::ln::{self, LightningClient};
use crate::seconds::Seconds;
use crate::{balance, btc, swallow_panic, user, worker, QueryRange};
use async_trait::async_trait;
use chrono::Utc;
use futures::StreamExt;
use std::sync::Arc;

mod entities;

pub use entities::{Direction, Error, Id, NewInvoice, Payment, Status, MAX_INVOICE_SATS};

use entities::{normalize, NewPayment};

/// Issues a new inbound invoice for the user and records it as an `Open`
/// payment. Settlement arrives later through the reconciler.
pub async fn new_invoice(
    db: &Database,
    ln: &dyn LightningClient,
    user_id: user::Id,
    new: NewInvoice,
) -> Result<Payment, Error> {
    new.validate()?;
    let added = ln
        .add_invoice(new.amount, new.memo.clone(), new.expiry)
        .await?;
    let mut data_tx = db.begin().await?;
    let payment = queries::insert(
        &mut data_tx,
        &NewPayment {
            user_id,
            payment_request: added.payment_request,
            hashed_preimage: added.hashed_preimage,
            preimage: None,
            memo: normalize(new.memo),
            description: normalize(new.description),
            callback_url: new.callback_url,
            customer_order_id: normalize(new.customer_order_id),
            expiry: new.expiry,
            amount: new.amount,
            direction: Direction::Inbound,
            status: Status::Open,
            settled_at: None,
        },
    )
    .await?;
    data_tx.commit().await?;
    Ok(payment)
}

/// Pays a Lightning invoice out of the user's balance. The debit and the
/// payment attempt succeed or fail together: the ledger transaction stays
/// open for the duration of the HTLC attempt and is rolled back on any
/// failure, so a rejected or unroutable payment never charges the user.
pub async fn pay(
    db: &Database,
    ln: &dyn LightningClient,
    user_id: user::Id,
    payment_request: ln::RawInvoice,
    description: Option<String>,
) -> Result<Payment, Error> {
    let decoded = ln.decode_pay_req(&payment_request).await?;
    if decoded.amount == btc::Sats(0) {
        return Err(Error::ZeroAmountInvoice);
    }
    if decoded.amount < btc::Sats(0) || decoded.amount > btc::Sats(MAX_INVOICE_SATS) {
        return Err(Error::InvalidAmount);
    }
    let parsed = payment_request.parse()?;
    let new = NewPayment {
        user_id,
        payment_request: payment_request.clone(),
        hashed_preimage: decoded.payment_hash,
        preimage: None,
        memo: normalize(Some(decoded.description)),
        description: normalize(description),
        callback_url: None,
        customer_order_id: None,
        expiry: Seconds(parsed.expiry_time().as_secs() as i64),
        amount: decoded.amount,
        direction: Direction::Outbound,
        status: Status::Open,
        settled_at: None,
    };

    let mut data_tx = db.begin().await?;
    balance::decrease(&mut data_tx, user_id, decoded.amount).await?;
    let payment = queries::insert(&mut data_tx, &new).await?;
    let sent = match ln.send_payment_sync(&payment_request).await {
        Ok(sent) => sent,
        Err(e) => {
            data_tx.rollback().await?;
            return Err(e.into());
        }
    };
    if !sent.payment_error.is_empty() {
        // The node rejected the payment. Undo the debit, but keep a FAILED
        // row so the attempt stays visible to the user.
        data_tx.rollback().await?;
        let mut data_tx = db.begin().await?;
        queries::insert(
            &mut data_tx,
            &NewPayment {
                status: Status::Failed,
                ..new
            },
        )
        .await?;
        data_tx.commit().await?;
        return Err(Error::Rejected {
            reason: sent.payment_error,
        });
    }
    let payment = queries::update_status(
        &mut data_tx,
        &payment.hashed_preimage,
        Direction::Outbound,
        Utc::now(),
        &sent.preimage,
    )
    .await?;
    data_tx.commit().await?;
    log::info!(
        "paid invoice {:?} for {:?}, debited {} sat",
        payment.id,
        payment.user_id,
        payment.amount.0
    );
    Ok(payment)
}

pub async fn get(db: &Database, id: Id, user_id: user::Id) -> Result<Option<Payment>, Error> {
    queries::get(db, id, user_id).await
}

/// Payments of the user in creation order. A zero limit means unbounded.
pub async fn list(
    db: &Database,
    user_id: user::Id,
    range: QueryRange,
) -> Result<Vec<Payment>, Error> {
    queries::list(db, user_id, range).await
}

/// Starts the settlement reconciler: the single long-running consumer of the
/// node's invoice-update stream. It transitions inbound payments
/// `Open -> Succeeded`, credits the user, and fires the merchant callback.
pub fn start_reconciler(
    db: Database,
    ln: Arc<dyn LightningClient>,
    notifier: callback::Notifier,
) {
    worker::start(Reconciler { db, ln, notifier });
}

struct Reconciler {
    db: Database,
    ln: Arc<dyn LightningClient>,
    notifier: callback::Notifier,
}

#[async_trait]
impl worker::Worker for Reconciler {
    fn name(&self) -> &'static str {
        "invoice reconciler"
    }

    async fn run(&mut self) {
        let mut stream = match self.ln.subscribe_invoices().await {
            Ok(stream) => stream,
            Err(e) => {
                log::error!("invoice subscription failed: {}", e);
                return;
            }
        };
        while let Some(update) = stream.next().await {
            swallow_panic(async {
                match settle(&self.db, &self.notifier, &update).await {
                    Ok(()) => {}
                    Err(Error::AlreadySettled) => log::info!(
                        "invoice {} already settled, skipping",
                        update.hashed_preimage
                    ),
                    Err(e) => log::error!(
                        "failed to settle invoice {}: {}",
                        update.hashed_preimage,
                        e
                    ),
                }
            })
            .await;
        }
    }
}

/// Applies one invoice update. The `status = OPEN` condition on the update
/// makes redelivered settlements credit at most once: a second arrival
/// matches zero rows and stops here.
async fn settle(
    db: &Database,
    notifier: &callback::Notifier,
    update: &ln::InvoiceUpdate,
) -> Result<(), Error> {
    if !update.settled {
        // Updates also fire when an invoice is created.
        return Ok(());
    }
    let payment = match queries::get_inbound_by_payment_request(db, &update.payment_request).await?
    {
        Some(payment) => payment,
        None => {
            // Possibly a race with the invoice insert, or an invoice created
            // on the node outside of this service. The node redelivers on
            // its side, so dropping the event is acceptable.
            log::info!(
                "settled invoice {} is not a user invoice, skipping",
                update.hashed_preimage
            );
            return Ok(());
        }
    };
    if payment.is_settled() {
        return Ok(());
    }
    let mut data_tx = db.begin().await?;
    let payment = queries::update_status(
        &mut data_tx,
        &update.hashed_preimage,
        Direction::Inbound,
        Utc::now(),
        &update.preimage,
    )
    .await?;
    balance::increase(&mut data_tx, payment.user_id, payment.amount).await?;
    data_tx.commit().await?;
    log::info!(
        "settled inbound payment {:?} for {:?}, credited {} sat",
        payment.id,
        payment.user_id,
        payment.amount.0
    );
    // Delivery failures are the notifier's problem; the settlement above is
    // already committed and must stay that way.
    if payment.callback_url.is_some() {
        notifier.spawn(payment);
    }
    Ok(())
}

mod queries {
    use super::entities::NewPayment;
    use super::{Direction, Error, Id, Payment, Status};
    use crate::database::{self, Database};
    use crate::hex::Hex;
    use crate::seconds::Seconds;
    use crate::{btc, ln, user, QueryRange};
    use chrono::{DateTime, Utc};
    use const_format::formatcp;
    use url::Url;

    const COLUMNS: &str = "id, user_id, payment_request, hashed_preimage, preimage, memo, \
        description, callback_url, customer_order_id, expiry_sec, amount_sat, amount_msat, \
        direction, status, settled_at, created, updated";

    pub(super) async fn insert(
        data_tx: &mut database::Transaction,
        new: &NewPayment,
    ) -> Result<Payment, Error> {
        new.assert_valid();
        Ok(sqlx::query_as::<_, PaymentRow>(formatcp!(
            r#"INSERT INTO offchaintx (user_id, payment_request, hashed_preimage, preimage,
                memo, description, callback_url, customer_order_id, expiry_sec, amount_sat,
                amount_msat, direction, status, settled_at)
                VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14)
                RETURNING {}"#,
            COLUMNS
        ))
        .bind(new.user_id.0)
        .bind(new.payment_request.as_str())
        .bind(new.hashed_preimage.as_str())
        .bind(new.preimage.as_ref().map(|preimage| preimage.as_str()))
        .bind(&new.memo)
        .bind(&new.description)
        .bind(new.callback_url.as_ref().map(|url| url.to_string()))
        .bind(&new.customer_order_id)
        .bind(new.expiry.0)
        .bind(new.amount.0)
        .bind(new.amount.msats().0)
        .bind(new.direction.as_str())
        .bind(new.status.as_str())
        .bind(new.settled_at)
        .fetch_one(&mut *data_tx)
        .await?
        .into_entity())
    }

    pub(super) async fn get(
        db: &Database,
        id: Id,
        user_id: user::Id,
    ) -> Result<Option<Payment>, Error> {
        Ok(sqlx::query_as::<_, PaymentRow>(formatcp!(
            "SELECT {} FROM offchaintx WHERE id = $1 AND user_id = $2",
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
    ) -> Result<Vec<Payment>, Error> {
        Ok(sqlx::query_as::<_, PaymentRow>(formatcp!(
            "SELECT {} FROM offchaintx WHERE user_id = $1 ORDER BY created ASC \
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

    /// The reconciler's lookup. Payment requests are stored upper-cased and
    /// [`ln::RawInvoice`] normalizes on construction, so the match is
    /// effectively case-insensitive. Only inbound rows qualify; outbound
    /// rows are settled synchronously by `pay`.
    pub(super) async fn get_inbound_by_payment_request(
        db: &Database,
        invoice: &ln::RawInvoice,
    ) -> Result<Option<Payment>, Error> {
        Ok(sqlx::query_as::<_, PaymentRow>(formatcp!(
            "SELECT {} FROM offchaintx WHERE payment_request = $1 AND direction = 'INBOUND'",
            COLUMNS
        ))
        .bind(invoice.as_str())
        .fetch_optional(db)
        .await?
        .map(|row| row.into_entity()))
    }

    /// The single settlement mutator. The conditions pin it to exactly one
    /// open row; zero affected rows means the payment was settled before
    /// (benign on redelivery), more than one means the store's uniqueness
    /// assumption broke.
    pub(super) async fn update_status(
        data_tx: &mut database::Transaction,
        hashed_preimage: &Hex,
        direction: Direction,
        settled_at: DateTime<Utc>,
        preimage: &Hex,
    ) -> Result<Payment, Error> {
        let mut rows = sqlx::query_as::<_, PaymentRow>(formatcp!(
            r#"UPDATE offchaintx
                SET status = 'SUCCEEDED', settled_at = $3, preimage = $4, updated = NOW()
                WHERE hashed_preimage = $1 AND direction = $2 AND status = 'OPEN'
                RETURNING {}"#,
            COLUMNS
        ))
        .bind(hashed_preimage.as_str())
        .bind(direction.as_str())
        .bind(settled_at)
        .bind(preimage.as_str())
        .fetch_all(&mut *data_tx)
        .await?;
        match rows.len() {
            1 => Ok(rows.remove(0).into_entity()),
            0 => Err(Error::AlreadySettled),
            _ => Err(Error::SettleConflict),
        }
    }

    #[derive(sqlx::FromRow, Debug)]
    struct PaymentRow {
        id: i32,
        user_id: i32,
        payment_request: String,
        hashed_preimage: String,
        preimage: Option<String>,
        memo: Option<String>,
        description: Option<String>,
        callback_url: Option<String>,
        customer_order_id: Option<String>,
        expiry_sec: i64,
        amount_sat: i64,
        amount_msat: i64,
        direction: String,
        status: String,
        settled_at: Option<DateTime<Utc>>,
        created: DateTime<Utc>,
        updated: DateTime<Utc>,
    }

    impl PaymentRow {
        fn into_entity(self) -> Payment {
            debug_assert_eq!(self.amount_msat, self.amount_sat * 1000);
            Payment {
                id: Id(self.id),
                user_id: user::Id(self.user_id),
                payment_request: ln::RawInvoice::new(&self.payment_request),
                hashed_preimage: Hex::parse(&self.hashed_preimage).unwrap(),
                preimage: self.preimage.map(|preimage| Hex::parse(&preimage).unwrap()),
                memo: self.memo,
                description: self.description,
                callback_url: self.callback_url.map(|url| Url::parse(&url).unwrap()),
                customer_order_id: self.customer_order_id,
                expiry: Seconds(self.expiry_sec),
                amount: btc::Sats(self.amount_sat),
                direction: match self.direction.as_str() {
                    "INBOUND" => Direction::Inbound,
                    "OUTBOUND" => Direction::Outbound,
                    direction => unreachable!("invalid direction {:?}", direction),
                },
                status: match self.status.as_str() {
                    "OPEN" => Status::Open,
                    "SUCCEEDED" => Status::Succeeded,
                    "FAILED" => Status::Failed,
                    status => unreachable!("invalid status {:?}", status),
                },
                settled_at: self.settled_at,
                created: self.created,
                updated: self.updated,
            }
        }
    }
}
