//! End-to-end scenarios for the off-chain flows: inbound settlement through
//! the reconciler, and outbound payments through `pay`. These need a
//! reachable postgres; run them with
//! `DATABASE_URL=... cargo test -- --ignored`.

mod support;

use payments_core::seconds::Seconds;
use payments_core::{btc, ln, offchain, Hex, QueryRange};
use std::sync::Arc;
use url::Url;

// The BOLT11 specification example invoice; pay() parses it for its expiry.
const PAYMENT_REQUEST: &str = "lnbc1pvjluezpp5qqqsyqcyq5rqwzqfqqqsyqcyq5rqwzqfqqqsyqcyq5rqwzqfqypqdpl2pkx2ctnv5sxxmmwwd5kgetjypeh2ursdae8g6twvus8g6rfwvs8qun0dfjkxaq8rkx3yf5tcsyz3d73gafnh3cax9rn449d9p5uxz9ezhhypd0elx87sjle52x86fux2ypatgddc6k63n7erqz25le42c4u4ecky03ylcqca784w";

fn added_invoice(amount: btc::Sats, hashed_preimage: &Hex) -> ln::AddedInvoice {
    ln::AddedInvoice {
        payment_request: ln::RawInvoice::new(PAYMENT_REQUEST),
        hashed_preimage: hashed_preimage.clone(),
        expiry: Seconds::one_hour(),
        amount,
    }
}

#[tokio::test]
#[ignore = "requires a postgres database"]
async fn settled_invoice_credits_exactly_once_and_fires_callback() {
    let db = support::test_db().await;
    let user = support::create_user(&db).await;
    payments_core::apikey::create(&db, user.id).await.unwrap();

    let hashed_preimage = Hex::encode(&[9u8; 32]);
    let ln_mock = Arc::new(support::MockLightning::default());
    *ln_mock.added_invoice.lock().unwrap() =
        Some(added_invoice(btc::Sats(50_000), &hashed_preimage));

    let payment = offchain::new_invoice(
        &db,
        ln_mock.as_ref(),
        user.id,
        offchain::NewInvoice {
            amount: btc::Sats(50_000),
            memo: Some("order 1".to_owned()),
            description: None,
            callback_url: Some(Url::parse("https://merchant.example/hook").unwrap()),
            customer_order_id: Some("order-1".to_owned()),
            expiry: Seconds::one_hour(),
        },
    )
    .await
    .unwrap();
    assert_eq!(payment.status, offchain::Status::Open);
    assert_eq!(support::balance_of(&db, user.id).await, btc::Sats(0));

    // The same settlement delivered twice; the second must be a no-op.
    let update = ln::InvoiceUpdate {
        payment_request: ln::RawInvoice::new(PAYMENT_REQUEST),
        hashed_preimage: hashed_preimage.clone(),
        preimage: Hex::encode(&[3u8; 32]),
        settled: true,
        amount: btc::Sats(50_000),
    };
    *ln_mock.updates.lock().unwrap() = vec![update.clone(), update];

    let sender = Arc::new(support::RecordingSender::default());
    offchain::start_reconciler(
        db.clone(),
        ln_mock.clone(),
        support::notifier(db.clone(), sender.clone()),
    );

    support::wait_for("settlement credit", || async {
        support::balance_of(&db, user.id).await == btc::Sats(50_000)
    })
    .await;
    support::wait_for("callback delivery", || async {
        !sender.requests.lock().unwrap().is_empty()
    })
    .await;
    // Give the redelivered event time to flow through before checking that
    // nothing was credited twice.
    tokio::time::sleep(std::time::Duration::from_millis(500)).await;

    assert_eq!(support::balance_of(&db, user.id).await, btc::Sats(50_000));
    let settled = offchain::get(&db, payment.id, user.id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(settled.status, offchain::Status::Succeeded);
    assert_eq!(settled.preimage, Some(Hex::encode(&[3u8; 32])));
    assert!(settled.settled_at.is_some());

    let requests = sender.requests.lock().unwrap();
    assert_eq!(requests.len(), 1);
    let (url, body) = &requests[0];
    assert_eq!(url.as_str(), "https://merchant.example/hook");
    assert_eq!(body["payment"]["id"], payment.id.0);
    assert_eq!(body["payment"]["amount_sat"], 50_000);
    assert!(body["hash"].is_string());
}

#[tokio::test]
#[ignore = "requires a postgres database"]
async fn paying_exactly_the_balance_succeeds_and_zeroes_it() {
    let db = support::test_db().await;
    let user = support::create_user(&db).await;
    support::fund_user(&db, user.id, btc::Sats(5_000)).await;

    let payment_hash = Hex::encode(&[4u8; 32]);
    let preimage = Hex::parse("0123456789abcdef0123456789abcdef0123456789abcdef0123456789abcdef")
        .unwrap();
    let ln_mock = support::MockLightning::default();
    *ln_mock.decoded_invoice.lock().unwrap() = Some(ln::DecodedInvoice {
        payment_hash: payment_hash.clone(),
        description: "coffee".to_owned(),
        amount: btc::Sats(5_000),
    });
    *ln_mock.sent_payment.lock().unwrap() = Some(ln::SentPayment {
        payment_error: String::new(),
        preimage: preimage.clone(),
        payment_hash,
    });

    let payment = offchain::pay(
        &db,
        &ln_mock,
        user.id,
        ln::RawInvoice::new(PAYMENT_REQUEST),
        None,
    )
    .await
    .unwrap();

    assert_eq!(support::balance_of(&db, user.id).await, btc::Sats(0));
    assert_eq!(payment.status, offchain::Status::Succeeded);
    assert_eq!(payment.direction, offchain::Direction::Outbound);
    assert_eq!(payment.preimage, Some(preimage));
}

#[tokio::test]
#[ignore = "requires a postgres database"]
async fn paying_over_the_balance_fails_without_charging() {
    let db = support::test_db().await;
    let user = support::create_user(&db).await;
    support::fund_user(&db, user.id, btc::Sats(5_000)).await;

    let ln_mock = support::MockLightning::default();
    *ln_mock.decoded_invoice.lock().unwrap() = Some(ln::DecodedInvoice {
        payment_hash: Hex::encode(&[4u8; 32]),
        description: String::new(),
        amount: btc::Sats(6_000),
    });

    let result = offchain::pay(
        &db,
        &ln_mock,
        user.id,
        ln::RawInvoice::new(PAYMENT_REQUEST),
        None,
    )
    .await;

    assert!(matches!(
        result,
        Err(offchain::Error::Balance(
            payments_core::balance::Error::InsufficientBalance
        ))
    ));
    assert_eq!(support::balance_of(&db, user.id).await, btc::Sats(5_000));
    let payments = offchain::list(&db, user.id, QueryRange { limit: 0, offset: 0 })
        .await
        .unwrap();
    assert!(payments
        .iter()
        .all(|payment| payment.status == offchain::Status::Failed));
}

#[tokio::test]
#[ignore = "requires a postgres database"]
async fn rejected_payment_keeps_the_balance_and_a_failed_row() {
    let db = support::test_db().await;
    let user = support::create_user(&db).await;
    support::fund_user(&db, user.id, btc::Sats(5_000)).await;

    let payment_hash = Hex::encode(&[5u8; 32]);
    let ln_mock = support::MockLightning::default();
    *ln_mock.decoded_invoice.lock().unwrap() = Some(ln::DecodedInvoice {
        payment_hash: payment_hash.clone(),
        description: String::new(),
        amount: btc::Sats(3_000),
    });
    *ln_mock.sent_payment.lock().unwrap() = Some(ln::SentPayment {
        payment_error: "no route".to_owned(),
        preimage: Hex::encode(&[]),
        payment_hash,
    });

    let result = offchain::pay(
        &db,
        &ln_mock,
        user.id,
        ln::RawInvoice::new(PAYMENT_REQUEST),
        None,
    )
    .await;

    match result {
        Err(offchain::Error::Rejected { reason }) => assert_eq!(reason, "no route"),
        other => panic!("expected a rejection, got {:?}", other.map(|p| p.id)),
    }
    assert_eq!(support::balance_of(&db, user.id).await, btc::Sats(5_000));
    let payments = offchain::list(&db, user.id, QueryRange { limit: 0, offset: 0 })
        .await
        .unwrap();
    assert_eq!(payments.len(), 1);
    assert_eq!(payments[0].status, offchain::Status::Failed);
    assert_eq!(payments[0].preimage, None);
}

#[tokio::test]
#[ignore = "requires a postgres database"]
async fn invoice_round_trips_with_empty_strings_normalized() {
    let db = support::test_db().await;
    let user = support::create_user(&db).await;

    let hashed_preimage = Hex::encode(&[8u8; 32]);
    let ln_mock = support::MockLightning::default();
    *ln_mock.added_invoice.lock().unwrap() =
        Some(added_invoice(btc::Sats(1_000), &hashed_preimage));

    let payment = offchain::new_invoice(
        &db,
        &ln_mock,
        user.id,
        offchain::NewInvoice {
            amount: btc::Sats(1_000),
            memo: Some(String::new()),
            description: Some("a description".to_owned()),
            callback_url: None,
            customer_order_id: Some(String::new()),
            expiry: Seconds(1200),
        },
    )
    .await
    .unwrap();

    let fetched = offchain::get(&db, payment.id, user.id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(fetched.payment_request, payment.payment_request);
    assert_eq!(fetched.hashed_preimage, hashed_preimage);
    assert_eq!(fetched.preimage, None);
    assert_eq!(fetched.memo, None);
    assert_eq!(fetched.description, Some("a description".to_owned()));
    assert_eq!(fetched.customer_order_id, None);
    assert_eq!(fetched.expiry, Seconds(1200));
    assert_eq!(fetched.amount, btc::Sats(1_000));
    assert_eq!(fetched.amount_msats(), btc::MilliSats(1_000_000));
    assert_eq!(fetched.direction, offchain::Direction::Inbound);
    assert_eq!(fetched.status, offchain::Status::Open);
    assert_eq!(fetched.settled_at, None);
    assert!(!fetched.is_expired());

    // Other users must not see the row.
    let other = support::create_user(&db).await;
    assert!(offchain::get(&db, payment.id, other.id)
        .await
        .unwrap()
        .is_none());
}

#[tokio::test]
#[ignore = "requires a postgres database"]
async fn listing_respects_order_offset_and_the_unbounded_zero_limit() {
    let db = support::test_db().await;
    let user = support::create_user(&db).await;

    let ln_mock = support::MockLightning::default();
    let mut ids = Vec::new();
    for n in 0..3u8 {
        *ln_mock.added_invoice.lock().unwrap() =
            Some(added_invoice(btc::Sats(1_000), &Hex::encode(&[n; 32])));
        let payment = offchain::new_invoice(
            &db,
            &ln_mock,
            user.id,
            offchain::NewInvoice {
                amount: btc::Sats(1_000),
                memo: None,
                description: None,
                callback_url: None,
                customer_order_id: None,
                expiry: Seconds::one_hour(),
            },
        )
        .await
        .unwrap();
        ids.push(payment.id);
    }

    let all = offchain::list(&db, user.id, QueryRange { limit: 0, offset: 0 })
        .await
        .unwrap();
    assert_eq!(
        all.iter().map(|payment| payment.id).collect::<Vec<_>>(),
        ids
    );

    let page = offchain::list(&db, user.id, QueryRange { limit: 2, offset: 1 })
        .await
        .unwrap();
    assert_eq!(
        page.iter().map(|payment| payment.id).collect::<Vec<_>>(),
        ids[1..].to_vec()
    );
}

#[tokio::test]
#[ignore = "requires a postgres database"]
async fn zero_amount_invoices_are_rejected() {
    let db = support::test_db().await;
    let user = support::create_user(&db).await;

    let ln_mock = support::MockLightning::default();
    *ln_mock.decoded_invoice.lock().unwrap() = Some(ln::DecodedInvoice {
        payment_hash: Hex::encode(&[6u8; 32]),
        description: String::new(),
        amount: btc::Sats(0),
    });

    let result = offchain::pay(
        &db,
        &ln_mock,
        user.id,
        ln::RawInvoice::new(PAYMENT_REQUEST),
        None,
    )
    .await;
    assert!(matches!(result, Err(offchain::Error::ZeroAmountInvoice)));
}
