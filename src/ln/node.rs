use super::{
    AddedInvoice, Config, DecodedInvoice, Error, InvoiceUpdate, LightningClient, RawInvoice,
    SentPayment,
};
use crate::btc;
use crate::hex::Hex;
use crate::seconds::Seconds;
use async_trait::async_trait;
use fedimint_tonic_lnd::lnrpc;
use fedimint_tonic_lnd::tonic::Request;
use futures::stream::BoxStream;
use futures::StreamExt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;

/// Provides an interface for communicating with our Lightning node. We
/// currently run an LND node, so this type is implemented against LND.
pub struct LndClient {
    client: Arc<Mutex<fedimint_tonic_lnd::Client>>,
}

impl LndClient {
    const DEFAULT_TIMEOUT: Duration = Duration::from_secs(20);

    pub async fn connect(config: Config) -> Result<Self, Error> {
        let client = fedimint_tonic_lnd::connect(
            config.endpoint.to_string(),
            config.cert_path,
            config.macaroon_path,
        )
        .await
        .map_err(|e| Error::Unavailable(e.to_string()))?;
        Ok(Self {
            client: Arc::new(Mutex::new(client)),
        })
    }

    fn req<T>(msg: T) -> Request<T> {
        let mut req = Request::new(msg);
        req.set_timeout(Self::DEFAULT_TIMEOUT);
        req
    }
}

#[async_trait]
impl LightningClient for LndClient {
    async fn add_invoice(
        &self,
        amount: btc::Sats,
        memo: Option<String>,
        expiry: Seconds,
    ) -> Result<AddedInvoice, Error> {
        let resp = self
            .client
            .lock()
            .await
            .lightning()
            .add_invoice(Self::req(lnrpc::Invoice {
                memo: memo.unwrap_or_default(),
                value: amount.0,
                expiry: expiry.0,
                private: true,
                ..Default::default()
            }))
            .await
            .map_err(|e| Error::Unavailable(e.to_string()))?
            .into_inner();
        Ok(AddedInvoice {
            payment_request: RawInvoice::new(&resp.payment_request),
            hashed_preimage: Hex::encode(&resp.r_hash),
            expiry,
            amount,
        })
    }

    async fn decode_pay_req(&self, invoice: &RawInvoice) -> Result<DecodedInvoice, Error> {
        let resp = self
            .client
            .lock()
            .await
            .lightning()
            .decode_pay_req(Self::req(lnrpc::PayReqString {
                pay_req: invoice.as_str().to_lowercase(),
            }))
            .await
            .map_err(|e| Error::Unavailable(e.to_string()))?
            .into_inner();
        let payment_hash = Hex::parse(&resp.payment_hash)
            .map_err(|e| Error::Unavailable(format!("malformed payment hash from node: {}", e)))?;
        Ok(DecodedInvoice {
            payment_hash,
            description: resp.description,
            amount: btc::Sats(resp.num_satoshis),
        })
    }

    async fn send_payment_sync(&self, invoice: &RawInvoice) -> Result<SentPayment, Error> {
        let resp = self
            .client
            .lock()
            .await
            .lightning()
            .send_payment_sync(Self::req(lnrpc::SendRequest {
                payment_request: invoice.as_str().to_lowercase(),
                ..Default::default()
            }))
            .await
            .map_err(|e| Error::Unavailable(e.to_string()))?
            .into_inner();
        Ok(SentPayment {
            payment_error: resp.payment_error,
            preimage: Hex::encode(&resp.payment_preimage),
            payment_hash: Hex::encode(&resp.payment_hash),
        })
    }

    async fn new_address(&self) -> Result<btc::Address, Error> {
        let resp = self
            .client
            .lock()
            .await
            .lightning()
            .new_address(Self::req(lnrpc::NewAddressRequest {
                r#type: lnrpc::AddressType::WitnessPubkeyHash.into(),
                ..Default::default()
            }))
            .await
            .map_err(|e| Error::Unavailable(e.to_string()))?
            .into_inner();
        btc::Address::from_str(&resp.address)
            .map_err(|e| Error::Unavailable(format!("unparseable address from node: {}", e)))
    }

    async fn send_coins(
        &self,
        address: &btc::Address,
        amount: btc::Sats,
        target_conf: Option<i32>,
        sat_per_byte: Option<i64>,
    ) -> Result<btc::TxId, Error> {
        let resp = self
            .client
            .lock()
            .await
            .lightning()
            .send_coins(Self::req(lnrpc::SendCoinsRequest {
                addr: address.to_string(),
                amount: amount.0,
                target_conf: target_conf.unwrap_or_default(),
                sat_per_byte: sat_per_byte.unwrap_or_default(),
                spend_unconfirmed: true,
                ..Default::default()
            }))
            .await
            .map_err(|e| Error::Unavailable(e.to_string()))?
            .into_inner();
        btc::TxId::from_str(&resp.txid)
            .map_err(|e| Error::Unavailable(format!("unparseable txid from node: {}", e)))
    }

    async fn subscribe_invoices(&self) -> Result<BoxStream<'static, InvoiceUpdate>, Error> {
        let stream = self
            .client
            .lock()
            .await
            .lightning()
            .subscribe_invoices(lnrpc::InvoiceSubscription::default())
            .await
            .map_err(|e| Error::Unavailable(e.to_string()))?
            .into_inner();
        Ok(futures::stream::unfold(stream, |mut stream| async move {
            match stream.message().await {
                Ok(Some(invoice)) => Some((invoice, stream)),
                Ok(None) => None,
                Err(e) => {
                    log::error!("invoice subscription closed: {}", e);
                    None
                }
            }
        })
        .map(|invoice| InvoiceUpdate {
            payment_request: RawInvoice::new(&invoice.payment_request),
            hashed_preimage: Hex::encode(&invoice.r_hash),
            preimage: Hex::encode(&invoice.r_preimage),
            settled: invoice.settle_date != 0,
            amount: btc::Sats(invoice.amt_paid_sat),
        })
        .boxed())
    }
}
