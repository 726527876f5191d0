use std::time::Duration;

use serde::{Deserialize, Serialize};
use tandem_pool_types::Currency;

use crate::{config::Config, error::Error};

/// Transactor's answer for a submitted transfer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferStatus {
    Pending,
    Confirmed,
    Failed,
}

/// Outbound wallet interface. The core never assumes synchronous success:
/// `send` hands the transfer over and returns the transaction id, and the
/// payment stays pending until `query_status` confirms it.
///
/// `Err(Error::PayoutRejected(_))` is a definitive refusal (bad address,
/// insufficient hot-wallet funds) and routes the payment to the failed
/// state; any other error is transient and the call is retried later.
pub trait WalletTransactor {
    async fn send(&self, currency: Currency, destination: &str, amount: i64)
        -> Result<String, Error>;

    async fn query_status(&self, currency: Currency, txid: &str)
        -> Result<TransferStatus, Error>;
}

/// Shape check applied before an address is ever debited against. Mainnet
/// Monero standard addresses start with '4'; for Tari we only require a
/// plausibly long base58 string.
pub fn valid_address(currency: Currency, address: &str) -> bool {
    match currency {
        Currency::Xmr => address.starts_with('4') && address.len() >= 90,
        Currency::Tari => address.len() >= 12 && address.chars().all(|c| c.is_ascii_alphanumeric()),
    }
}

/// JSON-RPC wallet client, one endpoint per currency
/// (monero-wallet-rpc and the Tari wallet's JSON-RPC bridge).
pub struct RpcWallet {
    http_client: reqwest::Client,
    xmr_url: String,
    tari_url: String,
}

#[derive(Debug, Serialize)]
struct RpcRequest<T: Serialize> {
    jsonrpc: &'static str,
    id: &'static str,
    method: &'static str,
    params: T,
}

#[derive(Debug, Deserialize)]
struct RpcResponse<T> {
    result: Option<T>,
    error: Option<RpcError>,
}

#[derive(Debug, Deserialize)]
struct RpcError {
    code: i64,
    message: String,
}

#[derive(Debug, Serialize)]
struct TransferDestination<'a> {
    amount: i64,
    address: &'a str,
}

#[derive(Debug, Serialize)]
struct TransferParams<'a> {
    destinations: Vec<TransferDestination<'a>>,
    priority: u8,
    ring_size: u8,
}

#[derive(Debug, Deserialize)]
struct TransferResult {
    tx_hash: String,
}

#[derive(Debug, Serialize)]
struct QueryParams<'a> {
    txid: &'a str,
}

#[derive(Debug, Deserialize)]
struct QueryResult {
    transfer: TransferDetail,
}

#[derive(Debug, Deserialize)]
struct TransferDetail {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    confirmations: u64,
}

impl RpcWallet {
    pub fn new(cfg: &Config) -> Result<Self, Error> {
        let http_client = reqwest::Client::builder()
            .timeout(Duration::from_secs(cfg.wallet_rpc_timeout_secs))
            .build()?;
        Ok(Self {
            http_client,
            xmr_url: cfg.wallet_rpc_url(Currency::Xmr).to_string(),
            tari_url: cfg.wallet_rpc_url(Currency::Tari).to_string(),
        })
    }

    fn url(&self, currency: Currency) -> &str {
        match currency {
            Currency::Xmr => self.xmr_url.as_str(),
            Currency::Tari => self.tari_url.as_str(),
        }
    }

    async fn call<P: Serialize, R: for<'de> Deserialize<'de>>(
        &self,
        currency: Currency,
        method: &'static str,
        params: P,
    ) -> Result<R, Error> {
        let request = RpcRequest {
            jsonrpc: "2.0",
            id: "0",
            method,
            params,
        };
        let bytes = self
            .http_client
            .post(self.url(currency))
            .json(&request)
            .send()
            .await?
            .error_for_status()?
            .bytes()
            .await?;
        let response: RpcResponse<R> = serde_json::from_slice(&bytes)?;
        if let Some(err) = response.error {
            return Err(classify_rpc_error(err));
        }
        response
            .result
            .ok_or_else(|| Error::Internal("wallet rpc response without result".to_string()))
    }
}

// monero-wallet-rpc codes where the wallet answered without transferring
// and a later attempt can succeed: -3 daemon is busy, -13 wallet not open
const TRANSIENT_RPC_CODES: [i64; 2] = [-3, -13];

/// An error in the JSON-RPC envelope means the wallet answered and no
/// transfer was made. Busy-style codes are retryable; everything else is a
/// definitive refusal.
fn classify_rpc_error(err: RpcError) -> Error {
    let detail = format!("wallet rpc error {}: {}", err.code, err.message);
    if TRANSIENT_RPC_CODES.contains(&err.code) {
        Error::WalletBusy(detail)
    } else {
        Error::PayoutRejected(detail)
    }
}

impl WalletTransactor for RpcWallet {
    async fn send(
        &self,
        currency: Currency,
        destination: &str,
        amount: i64,
    ) -> Result<String, Error> {
        let params = TransferParams {
            destinations: vec![TransferDestination {
                amount,
                address: destination,
            }],
            priority: 1,
            ring_size: 16,
        };
        let result: TransferResult = self.call(currency, "transfer", params).await?;
        Ok(result.tx_hash)
    }

    async fn query_status(&self, currency: Currency, txid: &str) -> Result<TransferStatus, Error> {
        let result: QueryResult = self
            .call(currency, "get_transfer_by_txid", QueryParams { txid })
            .await?;
        let status = match result.transfer.kind.as_str() {
            "failed" => TransferStatus::Failed,
            "out" if result.transfer.confirmations > 0 => TransferStatus::Confirmed,
            _ => TransferStatus::Pending,
        };
        Ok(status)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn xmr_addresses_must_be_mainnet_standard() {
        let good = format!("4{}", "A".repeat(94));
        assert!(valid_address(Currency::Xmr, &good));
        assert!(!valid_address(Currency::Xmr, "4tooshort"));
        let wrong_prefix = format!("9{}", "A".repeat(94));
        assert!(!valid_address(Currency::Xmr, &wrong_prefix));
        assert!(!valid_address(Currency::Xmr, ""));
    }

    #[test]
    fn busy_wallet_errors_are_transient() {
        let busy = RpcError {
            code: -3,
            message: "daemon is busy".to_string(),
        };
        assert!(matches!(classify_rpc_error(busy), Error::WalletBusy(_)));
        let refusal = RpcError {
            code: -2,
            message: "wrong address".to_string(),
        };
        assert!(matches!(
            classify_rpc_error(refusal),
            Error::PayoutRejected(_)
        ));
    }

    #[test]
    fn tari_addresses_must_be_plausible() {
        assert!(valid_address(Currency::Tari, "f2CWXg4KRQXrzfzvQKsdPkpc"));
        assert!(!valid_address(Currency::Tari, "short"));
        assert!(!valid_address(Currency::Tari, "has spaces in it!"));
    }
}
