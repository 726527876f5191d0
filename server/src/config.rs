use tandem_pool_types::Currency;

use crate::error::Error;

/// Runtime configuration, read once from the environment at startup.
#[derive(Debug, Clone)]
pub struct Config {
    /// Address the HTTP server binds to.
    pub server_bind: String,

    /// Fee applied to accounts created by the distributor, parts per million.
    pub default_fee_ppm: i32,

    /// Minimum balances before a payout is issued, atomic units.
    pub min_payout_xmr: i64,
    pub min_payout_tari: i64,

    /// Seconds between payout worker ticks.
    pub payout_interval_secs: u64,

    /// Seconds a payment may sit pending without a txid before it is
    /// surfaced for operator review.
    pub payment_pending_timeout_secs: i64,

    /// Wallet RPC endpoints, one per currency.
    pub xmr_wallet_rpc_url: String,
    pub tari_wallet_rpc_url: String,

    /// Bounded timeout for wallet RPC calls.
    pub wallet_rpc_timeout_secs: u64,
}

impl Config {
    pub fn from_env() -> Result<Self, Error> {
        Ok(Config {
            server_bind: var_or("SERVER_BIND", "0.0.0.0:3000"),
            default_fee_ppm: parse_var("POOL_FEE_PPM", 10_000)?,
            min_payout_xmr: parse_var("MIN_PAYOUT_XMR", 100_000_000_000)?,
            min_payout_tari: parse_var("MIN_PAYOUT_TARI", 5_000_000)?,
            payout_interval_secs: parse_var("PAYOUT_INTERVAL_SECS", 600)?,
            payment_pending_timeout_secs: parse_var("PAYMENT_PENDING_TIMEOUT_SECS", 900)?,
            xmr_wallet_rpc_url: var_or("XMR_WALLET_RPC_URL", "http://127.0.0.1:18082/json_rpc"),
            tari_wallet_rpc_url: var_or("TARI_WALLET_RPC_URL", "http://127.0.0.1:18142/json_rpc"),
            wallet_rpc_timeout_secs: parse_var("WALLET_RPC_TIMEOUT_SECS", 30)?,
        })
    }

    pub fn min_payout(&self, currency: Currency) -> i64 {
        match currency {
            Currency::Xmr => self.min_payout_xmr,
            Currency::Tari => self.min_payout_tari,
        }
    }

    pub fn wallet_rpc_url(&self, currency: Currency) -> &str {
        match currency {
            Currency::Xmr => self.xmr_wallet_rpc_url.as_str(),
            Currency::Tari => self.tari_wallet_rpc_url.as_str(),
        }
    }
}

pub fn db_url() -> Result<String, Error> {
    std::env::var("DB_URL").map_err(From::from)
}

fn var_or(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}

fn parse_var<T: std::str::FromStr<Err = std::num::ParseIntError>>(
    key: &str,
    default: T,
) -> Result<T, Error> {
    match std::env::var(key) {
        Ok(raw) => raw.parse::<T>().map_err(From::from),
        Err(_) => Ok(default),
    }
}
