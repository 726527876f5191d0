use deadpool_postgres::Object;
use tandem_pool_types::{
    AccountSnapshot, BlockSummary, Currency, CurrencyStats, PaymentRecord, PoolSnapshot,
    RewardRecord,
};

use crate::{database, error::Error, units};

// Sliding windows for the hashrate proxy.
const WINDOW_SHORT: i64 = 15 * 60;
const WINDOW_MEDIUM: i64 = 60 * 60;
const WINDOW_LONG: i64 = 24 * 60 * 60;

const RECENT_BLOCKS: i64 = 10;

const DEFAULT_PAGE: i64 = 50;
const MAX_PAGE: i64 = 500;

fn page(limit: Option<i64>, offset: Option<i64>) -> (i64, i64) {
    let limit = limit.unwrap_or(DEFAULT_PAGE).clamp(1, MAX_PAGE);
    let offset = offset.unwrap_or(0).max(0);
    (limit, offset)
}

/// Pool-wide totals for the dashboard. Plain reads, no locks held; each
/// statement is its own short snapshot.
pub async fn pool_snapshot(conn: &Object) -> Result<PoolSnapshot, Error> {
    let now = units::unix_now();
    let mut currencies = Vec::with_capacity(Currency::ALL.len());
    for currency in Currency::ALL {
        let row = conn
            .query_one(
                "SELECT COUNT(*),
                        COUNT(*) FILTER (WHERE discovered_at >= $2)
                 FROM blocks
                 WHERE currency = $1",
                &[&currency, &(now - WINDOW_LONG)],
            )
            .await?;
        let total_blocks: i64 = row.try_get(0)?;
        let blocks_24h: i64 = row.try_get(1)?;

        let row = conn
            .query_one(
                "SELECT COALESCE(SUM(shares) FILTER (WHERE created_at >= $2), 0)::BIGINT,
                        COALESCE(SUM(shares) FILTER (WHERE created_at >= $3), 0)::BIGINT,
                        COALESCE(SUM(shares) FILTER (WHERE created_at >= $4), 0)::BIGINT,
                        COUNT(DISTINCT username) FILTER (WHERE created_at >= $4),
                        COALESCE(SUM(amount), 0)::BIGINT,
                        COALESCE(SUM(fee_amount), 0)::BIGINT
                 FROM rewards
                 WHERE currency = $1",
                &[
                    &currency,
                    &(now - WINDOW_SHORT),
                    &(now - WINDOW_MEDIUM),
                    &(now - WINDOW_LONG),
                ],
            )
            .await?;
        let shares_15m: i64 = row.try_get(0)?;
        let shares_1h: i64 = row.try_get(1)?;
        let shares_24h: i64 = row.try_get(2)?;
        let active_miners_24h: i64 = row.try_get(3)?;
        let total_rewards_credited: i64 = row.try_get(4)?;
        let total_fees_retained: i64 = row.try_get(5)?;

        let row = conn
            .query_one(
                "SELECT COALESCE(SUM(amount), 0)::BIGINT
                 FROM payments
                 WHERE currency = $1 AND status = 'completed'",
                &[&currency],
            )
            .await?;
        let total_paid_out: i64 = row.try_get(0)?;

        currencies.push(CurrencyStats {
            currency,
            total_blocks,
            blocks_24h,
            shares_15m,
            shares_1h,
            shares_24h,
            active_miners_24h,
            total_rewards_credited,
            total_fees_retained,
            total_paid_out,
        });
    }

    let rows = conn
        .query(
            "SELECT currency, height, total_reward, total_shares, discovered_at, check_status
             FROM blocks
             ORDER BY discovered_at DESC
             LIMIT $1",
            &[&RECENT_BLOCKS],
        )
        .await?;
    let mut recent_blocks = Vec::with_capacity(rows.len());
    for row in rows {
        recent_blocks.push(BlockSummary {
            currency: row.try_get(0)?,
            height: row.try_get(1)?,
            total_reward: row.try_get(2)?,
            total_shares: row.try_get(3)?,
            discovered_at: row.try_get(4)?,
            check_status: row.try_get(5)?,
        });
    }

    Ok(PoolSnapshot {
        currencies,
        recent_blocks,
    })
}

pub async fn account_snapshot(conn: &Object, username: &str) -> Result<AccountSnapshot, Error> {
    let account = database::read_account(conn, username).await?;
    Ok(AccountSnapshot {
        username: account.username,
        xmr_balance: account.xmr_balance,
        tari_balance: account.tari_balance,
        xmr_wallet: account.xmr_wallet,
        tari_wallet: account.tari_wallet,
        fee_ppm: account.fee_ppm,
        created_at: account.created_at,
        updated_at: account.updated_at,
    })
}

/// Reward history, most recent first.
pub async fn account_rewards(
    conn: &Object,
    username: &str,
    limit: Option<i64>,
    offset: Option<i64>,
) -> Result<Vec<RewardRecord>, Error> {
    let (limit, offset) = page(limit, offset);
    let rows = conn
        .query(
            "SELECT id, currency, height, amount, fee_amount, fee_ppm, shares, created_at
             FROM rewards
             WHERE username = $1
             ORDER BY created_at DESC, id DESC
             LIMIT $2 OFFSET $3",
            &[&username, &limit, &offset],
        )
        .await?;
    let mut out = Vec::with_capacity(rows.len());
    for row in rows {
        out.push(RewardRecord {
            id: row.try_get(0)?,
            currency: row.try_get(1)?,
            height: row.try_get(2)?,
            amount: row.try_get(3)?,
            fee_amount: row.try_get(4)?,
            fee_ppm: row.try_get(5)?,
            shares: row.try_get(6)?,
            created_at: row.try_get(7)?,
        });
    }
    Ok(out)
}

/// Payment history, most recent first.
pub async fn account_payments(
    conn: &Object,
    username: &str,
    limit: Option<i64>,
    offset: Option<i64>,
) -> Result<Vec<PaymentRecord>, Error> {
    let (limit, offset) = page(limit, offset);
    let rows = conn
        .query(
            "SELECT id, currency, amount, destination, txid, status, note,
                    created_at, submitted_at, resolved_at
             FROM payments
             WHERE username = $1
             ORDER BY created_at DESC, id DESC
             LIMIT $2 OFFSET $3",
            &[&username, &limit, &offset],
        )
        .await?;
    let mut out = Vec::with_capacity(rows.len());
    for row in rows {
        out.push(PaymentRecord {
            id: row.try_get(0)?,
            currency: row.try_get(1)?,
            amount: row.try_get(2)?,
            destination: row.try_get(3)?,
            txid: row.try_get(4)?,
            status: row.try_get(5)?,
            note: row.try_get(6)?,
            created_at: row.try_get(7)?,
            submitted_at: row.try_get(8)?,
            resolved_at: row.try_get(9)?,
        });
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pagination_is_clamped() {
        assert_eq!(page(None, None), (DEFAULT_PAGE, 0));
        assert_eq!(page(Some(0), Some(-3)), (1, 0));
        assert_eq!(page(Some(10_000), Some(20)), (MAX_PAGE, 20));
        assert_eq!(page(Some(25), Some(75)), (25, 75));
    }
}
