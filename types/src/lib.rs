use std::collections::HashMap;
use std::fmt;

use postgres_types::{FromSql, ToSql};
use serde::{Deserialize, Serialize};

/// The two chains merged into the pool. Block heights are independent
/// per currency and every monetary column is tagged with one of these.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, ToSql, FromSql)]
#[serde(rename_all = "lowercase")]
#[postgres(name = "currency")]
pub enum Currency {
    #[postgres(name = "xmr")]
    Xmr,
    #[postgres(name = "tari")]
    Tari,
}

impl Currency {
    pub const ALL: [Currency; 2] = [Currency::Xmr, Currency::Tari];

    pub fn as_str(&self) -> &'static str {
        match self {
            Currency::Xmr => "xmr",
            Currency::Tari => "tari",
        }
    }

    /// Decimal places of the smallest unit: piconero for XMR,
    /// microTari for Tari.
    pub fn decimals(&self) -> u32 {
        match self {
            Currency::Xmr => 12,
            Currency::Tari => 6,
        }
    }
}

impl fmt::Display for Currency {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Lifecycle of a payout. Transitions are monotonic: `Pending` may move to
/// `Completed` or `Failed`, both of which are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSql, FromSql)]
#[serde(rename_all = "lowercase")]
#[postgres(name = "payment_status")]
pub enum PaymentStatus {
    #[postgres(name = "pending")]
    Pending,
    #[postgres(name = "completed")]
    Completed,
    #[postgres(name = "failed")]
    Failed,
}

/// Validity status attached to a block by the external chain validator.
/// Every block starts out `Pending`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSql, FromSql)]
#[serde(rename_all = "lowercase")]
#[postgres(name = "block_check_status")]
pub enum BlockCheckStatus {
    #[postgres(name = "pending")]
    Pending,
    #[postgres(name = "valid")]
    Valid,
    #[postgres(name = "invalid")]
    Invalid,
}

/// The payload posted by the share tracker when a new block is confirmed.
///
/// Amounts are atomic units of the block's currency. The share table maps
/// usernames to the share counts they contributed since the previous block
/// of the same currency.
#[derive(Debug, Serialize, Deserialize)]
pub struct BlockDiscoveryPayload {
    pub currency: Currency,

    /// Block height, unique within its currency.
    pub height: i64,

    /// Total block reward in atomic units.
    pub total_reward: i64,

    /// username -> share count for the reward period.
    pub shares: HashMap<String, i64>,

    /// Unix seconds at which the block was found.
    pub discovered_at: i64,
}

/// The response to a block-discovery post.
#[derive(Debug, Serialize, Deserialize)]
pub struct DistributeResponse {
    pub currency: Currency,
    pub height: i64,

    /// True if this (currency, height) had already been distributed and the
    /// call was a no-op.
    pub already_processed: bool,

    /// Number of reward entries written (zero on replay).
    pub accounts_credited: usize,
}

/// Payload for the external validator's block check-status callback.
#[derive(Debug, Serialize, Deserialize)]
pub struct BlockStatusPayload {
    pub status: BlockCheckStatus,
}

/// Payload for registering or replacing an account's payout address.
#[derive(Debug, Serialize, Deserialize)]
pub struct SetWalletPayload {
    pub currency: Currency,
    pub address: String,
}

/// Path segment for account routes.
#[derive(Debug, Deserialize)]
pub struct AccountPath {
    pub username: String,
}

/// Path segments for block routes.
#[derive(Debug, Deserialize)]
pub struct BlockPath {
    pub currency: Currency,
    pub height: i64,
}

/// Path segments for the balance verification route.
#[derive(Debug, Deserialize)]
pub struct VerifyPath {
    pub username: String,
    pub currency: Currency,
}

/// Pagination for history routes.
#[derive(Debug, Deserialize)]
pub struct HistoryQuery {
    pub limit: Option<i64>,
    pub offset: Option<i64>,
}

/// Pool-wide statistics for one currency.
#[derive(Debug, Serialize, Deserialize)]
pub struct CurrencyStats {
    pub currency: Currency,
    pub total_blocks: i64,
    pub blocks_24h: i64,

    /// Share sums over sliding windows; a hashrate proxy for the dashboard.
    pub shares_15m: i64,
    pub shares_1h: i64,
    pub shares_24h: i64,

    /// Distinct miners credited within the last 24 hours.
    pub active_miners_24h: i64,

    /// Cumulative rewards credited to miners, atomic units.
    pub total_rewards_credited: i64,

    /// Cumulative fees retained by the pool, atomic units.
    pub total_fees_retained: i64,

    /// Cumulative completed payouts, atomic units.
    pub total_paid_out: i64,
}

/// One row of the recent-blocks list on the pool snapshot.
#[derive(Debug, Serialize, Deserialize)]
pub struct BlockSummary {
    pub currency: Currency,
    pub height: i64,
    pub total_reward: i64,
    pub total_shares: i64,
    pub discovered_at: i64,
    pub check_status: BlockCheckStatus,
}

/// The pool-wide snapshot returned by `GET /pool`.
#[derive(Debug, Serialize, Deserialize)]
pub struct PoolSnapshot {
    pub currencies: Vec<CurrencyStats>,
    pub recent_blocks: Vec<BlockSummary>,
}

/// Per-account snapshot returned by `GET /account/{username}`.
#[derive(Debug, Serialize, Deserialize)]
pub struct AccountSnapshot {
    pub username: String,
    pub xmr_balance: i64,
    pub tari_balance: i64,
    pub xmr_wallet: Option<String>,
    pub tari_wallet: Option<String>,

    /// Pool fee in parts per million, fixed at account creation.
    pub fee_ppm: i32,

    pub created_at: i64,
    pub updated_at: i64,
}

/// One credited reward in an account's history.
#[derive(Debug, Serialize, Deserialize)]
pub struct RewardRecord {
    pub id: i64,
    pub currency: Currency,
    pub height: i64,

    /// Credited amount, post-fee, atomic units.
    pub amount: i64,

    /// Fee retained by the pool for this entry, atomic units.
    pub fee_amount: i64,

    /// Fee rate applied, denormalized at distribution time.
    pub fee_ppm: i32,

    pub shares: i64,
    pub created_at: i64,
}

/// One payout in an account's history.
#[derive(Debug, Serialize, Deserialize)]
pub struct PaymentRecord {
    pub id: i64,
    pub currency: Currency,
    pub amount: i64,
    pub destination: String,
    pub txid: Option<String>,
    pub status: PaymentStatus,
    pub note: Option<String>,
    pub created_at: i64,
    pub submitted_at: Option<i64>,
    pub resolved_at: Option<i64>,
}

/// Result of a balance reconciliation check. Only returned when the stored
/// balance matches the recomputed history sum; a mismatch is an error.
#[derive(Debug, Serialize, Deserialize)]
pub struct VerifyResponse {
    pub username: String,
    pub currency: Currency,
    pub balance: i64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn currency_serde_round_trip() {
        let json = serde_json::to_string(&Currency::Xmr).unwrap();
        assert_eq!(json, "\"xmr\"");
        let back: Currency = serde_json::from_str("\"tari\"").unwrap();
        assert_eq!(back, Currency::Tari);
    }

    #[test]
    fn block_discovery_payload_decodes() {
        let raw = r#"{
            "currency": "tari",
            "height": 1000,
            "total_reward": 10000000,
            "shares": {"alice": 3, "bob": 1},
            "discovered_at": 1700000000
        }"#;
        let payload: BlockDiscoveryPayload = serde_json::from_str(raw).unwrap();
        assert_eq!(payload.currency, Currency::Tari);
        assert_eq!(payload.height, 1000);
        assert_eq!(payload.shares.get("alice"), Some(&3));
    }
}
