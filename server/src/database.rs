use deadpool_postgres::{Object, Pool, Transaction};
use tandem_pool_types::{BlockCheckStatus, Currency, PaymentStatus};
use tokio_postgres::{IsolationLevel, NoTls};

use crate::{config, error::Error};

/// Full ledger schema. Monetary columns are BIGINT atomic units, timestamps
/// are BIGINT unix seconds.
const SCHEMA: &str = r#"
DO $$ BEGIN
    CREATE TYPE currency AS ENUM ('xmr', 'tari');
EXCEPTION WHEN duplicate_object THEN NULL;
END $$;

DO $$ BEGIN
    CREATE TYPE payment_status AS ENUM ('pending', 'completed', 'failed');
EXCEPTION WHEN duplicate_object THEN NULL;
END $$;

DO $$ BEGIN
    CREATE TYPE block_check_status AS ENUM ('pending', 'valid', 'invalid');
EXCEPTION WHEN duplicate_object THEN NULL;
END $$;

CREATE TABLE IF NOT EXISTS accounts (
    username TEXT PRIMARY KEY,
    xmr_balance BIGINT NOT NULL DEFAULT 0 CHECK (xmr_balance >= 0),
    tari_balance BIGINT NOT NULL DEFAULT 0 CHECK (tari_balance >= 0),
    xmr_wallet TEXT,
    tari_wallet TEXT,
    fee_ppm INT NOT NULL CHECK (fee_ppm >= 0 AND fee_ppm < 1000000),
    created_at BIGINT NOT NULL,
    updated_at BIGINT NOT NULL
);

CREATE TABLE IF NOT EXISTS blocks (
    currency currency NOT NULL,
    height BIGINT NOT NULL CHECK (height >= 0),
    total_reward BIGINT NOT NULL CHECK (total_reward > 0),
    total_shares BIGINT NOT NULL CHECK (total_shares > 0),
    per_share_value BIGINT NOT NULL,
    discovered_at BIGINT NOT NULL,
    check_status block_check_status NOT NULL DEFAULT 'pending',
    PRIMARY KEY (currency, height)
);

CREATE TABLE IF NOT EXISTS rewards (
    id BIGSERIAL PRIMARY KEY,
    currency currency NOT NULL,
    height BIGINT NOT NULL,
    username TEXT NOT NULL REFERENCES accounts (username),
    amount BIGINT NOT NULL CHECK (amount >= 0),
    fee_amount BIGINT NOT NULL CHECK (fee_amount >= 0),
    fee_ppm INT NOT NULL,
    shares BIGINT NOT NULL CHECK (shares >= 0),
    created_at BIGINT NOT NULL,
    UNIQUE (currency, height, username),
    FOREIGN KEY (currency, height) REFERENCES blocks (currency, height)
);

CREATE TABLE IF NOT EXISTS payments (
    id BIGSERIAL PRIMARY KEY,
    username TEXT NOT NULL REFERENCES accounts (username),
    currency currency NOT NULL,
    amount BIGINT NOT NULL CHECK (amount > 0),
    destination TEXT NOT NULL,
    txid TEXT,
    status payment_status NOT NULL DEFAULT 'pending',
    note TEXT,
    created_at BIGINT NOT NULL,
    submitted_at BIGINT,
    resolved_at BIGINT
);

CREATE INDEX IF NOT EXISTS idx_rewards_username ON rewards (username);
CREATE INDEX IF NOT EXISTS idx_rewards_created_at ON rewards (created_at);
CREATE INDEX IF NOT EXISTS idx_payments_username ON payments (username);
CREATE INDEX IF NOT EXISTS idx_payments_status ON payments (status);
CREATE INDEX IF NOT EXISTS idx_payments_created_at ON payments (created_at);
CREATE INDEX IF NOT EXISTS idx_blocks_discovered_at ON blocks (discovered_at);
"#;

pub fn create_pool() -> Result<Pool, Error> {
    let mut cfg = deadpool_postgres::Config::new();
    cfg.url = Some(config::db_url()?);
    cfg.create_pool(None, NoTls)
        .map_err(|err| Error::Internal(err.to_string()))
}

pub async fn migrate(conn: &Object) -> Result<(), Error> {
    conn.batch_execute(SCHEMA).await?;
    Ok(())
}

/// Start a serializable transaction. Every unit of work that touches
/// balances runs inside one of these; the database is the sole
/// coordination point between the distributor and the payout worker.
pub async fn serializable<'a>(conn: &'a mut Object) -> Result<Transaction<'a>, Error> {
    conn.build_transaction()
        .isolation_level(IsolationLevel::Serializable)
        .start()
        .await
        .map_err(From::from)
}

fn balance_column(currency: Currency) -> &'static str {
    match currency {
        Currency::Xmr => "xmr_balance",
        Currency::Tari => "tari_balance",
    }
}

fn wallet_column(currency: Currency) -> &'static str {
    match currency {
        Currency::Xmr => "xmr_wallet",
        Currency::Tari => "tari_wallet",
    }
}

#[derive(Debug, Clone)]
pub struct Account {
    pub username: String,
    pub xmr_balance: i64,
    pub tari_balance: i64,
    pub xmr_wallet: Option<String>,
    pub tari_wallet: Option<String>,
    pub fee_ppm: i32,
    pub created_at: i64,
    pub updated_at: i64,
}

impl Account {
    pub fn balance(&self, currency: Currency) -> i64 {
        match currency {
            Currency::Xmr => self.xmr_balance,
            Currency::Tari => self.tari_balance,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Payment {
    pub id: i64,
    pub username: String,
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

fn payment_from_row(row: &tokio_postgres::Row) -> Result<Payment, Error> {
    Ok(Payment {
        id: row.try_get(0)?,
        username: row.try_get(1)?,
        currency: row.try_get(2)?,
        amount: row.try_get(3)?,
        destination: row.try_get(4)?,
        txid: row.try_get(5)?,
        status: row.try_get(6)?,
        note: row.try_get(7)?,
        created_at: row.try_get(8)?,
        submitted_at: row.try_get(9)?,
        resolved_at: row.try_get(10)?,
    })
}

const PAYMENT_COLUMNS: &str = "id, username, currency, amount, destination, txid, status, note, \
                               created_at, submitted_at, resolved_at";

pub async fn read_account(conn: &Object, username: &str) -> Result<Account, Error> {
    let row = conn
        .query_opt(
            "SELECT username, xmr_balance, tari_balance, xmr_wallet, tari_wallet, fee_ppm,
                    created_at, updated_at
             FROM accounts
             WHERE username = $1",
            &[&username],
        )
        .await?
        .ok_or_else(|| Error::AccountDoesNotExist(username.to_string()))?;
    Ok(Account {
        username: row.try_get(0)?,
        xmr_balance: row.try_get(1)?,
        tari_balance: row.try_get(2)?,
        xmr_wallet: row.try_get(3)?,
        tari_wallet: row.try_get(4)?,
        fee_ppm: row.try_get(5)?,
        created_at: row.try_get(6)?,
        updated_at: row.try_get(7)?,
    })
}

/// Create the account on first sight and lock its row for the enclosing
/// transaction. Returns the fee rate in force for this account, read at
/// distribution time so later fee changes never touch history.
pub async fn ensure_account(
    tx: &Transaction<'_>,
    username: &str,
    default_fee_ppm: i32,
    now: i64,
) -> Result<i32, Error> {
    tx.execute(
            "INSERT INTO accounts (username, fee_ppm, created_at, updated_at)
             VALUES ($1, $2, $3, $3)
             ON CONFLICT (username) DO NOTHING",
            &[&username, &default_fee_ppm, &now],
        )
        .await?;
    let row = tx
        .query_one(
            "SELECT fee_ppm FROM accounts WHERE username = $1 FOR UPDATE",
            &[&username],
        )
        .await?;
    row.try_get(0).map_err(From::from)
}

/// Set or replace an account's payout address for one currency. Wallet
/// updates never touch balances.
pub async fn set_wallet(
    conn: &Object,
    username: &str,
    currency: Currency,
    wallet: &str,
    now: i64,
) -> Result<(), Error> {
    let updated = conn
        .execute(
            &format!(
                "UPDATE accounts SET {} = $2, updated_at = $3 WHERE username = $1",
                wallet_column(currency)
            ),
            &[&username, &wallet, &now],
        )
        .await?;
    if updated == 0 {
        return Err(Error::AccountDoesNotExist(username.to_string()));
    }
    Ok(())
}

pub async fn block_exists(
    tx: &Transaction<'_>,
    currency: Currency,
    height: i64,
) -> Result<bool, Error> {
    let row = tx
        .query_opt(
            "SELECT 1 FROM blocks WHERE currency = $1 AND height = $2",
            &[&currency, &height],
        )
        .await?;
    Ok(row.is_some())
}

#[allow(clippy::too_many_arguments)]
pub async fn insert_block(
    tx: &Transaction<'_>,
    currency: Currency,
    height: i64,
    total_reward: i64,
    total_shares: i64,
    per_share_value: i64,
    discovered_at: i64,
) -> Result<(), Error> {
    tx.execute(
            "INSERT INTO blocks
             (currency, height, total_reward, total_shares, per_share_value, discovered_at)
             VALUES ($1, $2, $3, $4, $5, $6)",
            &[
                &currency,
                &height,
                &total_reward,
                &total_shares,
                &per_share_value,
                &discovered_at,
            ],
        )
        .await?;
    Ok(())
}

#[allow(clippy::too_many_arguments)]
pub async fn insert_reward(
    tx: &Transaction<'_>,
    currency: Currency,
    height: i64,
    username: &str,
    amount: i64,
    fee_amount: i64,
    fee_ppm: i32,
    shares: i64,
    now: i64,
) -> Result<(), Error> {
    tx.execute(
            "INSERT INTO rewards
             (currency, height, username, amount, fee_amount, fee_ppm, shares, created_at)
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8)",
            &[
                &currency, &height, &username, &amount, &fee_amount, &fee_ppm, &shares, &now,
            ],
        )
        .await?;
    Ok(())
}

pub async fn credit_balance(
    tx: &Transaction<'_>,
    username: &str,
    currency: Currency,
    amount: i64,
    now: i64,
) -> Result<(), Error> {
    tx.execute(
            &format!(
                "UPDATE accounts SET {col} = {col} + $2, updated_at = $3 WHERE username = $1",
                col = balance_column(currency)
            ),
            &[&username, &amount, &now],
        )
        .await?;
    Ok(())
}

/// Attach the external validator's verdict. Only the initial `pending`
/// state may transition; repeating an identical verdict is a no-op.
pub async fn set_block_check_status(
    conn: &Object,
    currency: Currency,
    height: i64,
    status: BlockCheckStatus,
) -> Result<(), Error> {
    let updated = conn
        .execute(
            "UPDATE blocks SET check_status = $3
             WHERE currency = $1 AND height = $2 AND check_status = 'pending'",
            &[&currency, &height, &status],
        )
        .await?;
    if updated == 1 {
        return Ok(());
    }
    let row = conn
        .query_opt(
            "SELECT check_status FROM blocks WHERE currency = $1 AND height = $2",
            &[&currency, &height],
        )
        .await?
        .ok_or(Error::BlockDoesNotExist(currency, height))?;
    let current: BlockCheckStatus = row.try_get(0)?;
    if current == status {
        Ok(())
    } else {
        Err(Error::BlockStatusFinal(currency, height))
    }
}

/// Accounts whose balance has reached the payout threshold and which have a
/// wallet on file for the currency, richest first.
pub async fn eligible_payouts(
    conn: &Object,
    currency: Currency,
    min_payout: i64,
) -> Result<Vec<(String, i64, String)>, Error> {
    let rows = conn
        .query(
            &format!(
                "SELECT username, {bal}, {wal}
                 FROM accounts
                 WHERE {bal} >= $1 AND {wal} IS NOT NULL
                 ORDER BY {bal} DESC",
                bal = balance_column(currency),
                wal = wallet_column(currency)
            ),
            &[&min_payout],
        )
        .await?;
    let mut out = Vec::with_capacity(rows.len());
    for row in rows {
        out.push((row.try_get(0)?, row.try_get(1)?, row.try_get(2)?));
    }
    Ok(out)
}

/// Debit an account's full balance and create the pending payment row in
/// one serializable transaction. The pending row is the durable marker of
/// intent; submission to the wallet happens only after this commits.
///
/// Returns None when the balance dropped below the threshold between
/// selection and locking (a concurrent payout cycle got there first).
pub async fn issue_payment(
    conn: &mut Object,
    username: &str,
    currency: Currency,
    min_payout: i64,
    now: i64,
) -> Result<Option<(i64, i64)>, Error> {
    let tx = serializable(conn).await?;
    let row = tx
        .query_opt(
            &format!(
                "SELECT {bal}, {wal} FROM accounts WHERE username = $1 FOR UPDATE",
                bal = balance_column(currency),
                wal = wallet_column(currency)
            ),
            &[&username],
        )
        .await?
        .ok_or_else(|| Error::AccountDoesNotExist(username.to_string()))?;
    let balance: i64 = row.try_get(0)?;
    let wallet: Option<String> = row.try_get(1)?;
    let destination = match wallet {
        Some(destination) if balance >= min_payout => destination,
        _ => return Ok(None),
    };
    tx.execute(
        &format!(
            "UPDATE accounts SET {col} = {col} - $2, updated_at = $3 WHERE username = $1",
            col = balance_column(currency)
        ),
        &[&username, &balance, &now],
    )
    .await?;
    let row = tx
        .query_one(
            "INSERT INTO payments (username, currency, amount, destination, created_at)
             VALUES ($1, $2, $3, $4, $5)
             RETURNING id",
            &[&username, &currency, &balance, &destination, &now],
        )
        .await?;
    let id: i64 = row.try_get(0)?;
    tx.commit().await?;
    Ok(Some((id, balance)))
}

/// Pending payments that have never been handed to the wallet transactor.
/// Rows with an attempt marker but no txid are deliberately excluded: their
/// outcome is unknown and re-sending could pay twice.
pub async fn unsubmitted_payments(conn: &Object) -> Result<Vec<Payment>, Error> {
    let rows = conn
        .query(
            &format!(
                "SELECT {PAYMENT_COLUMNS} FROM payments
                 WHERE status = 'pending' AND txid IS NULL AND submitted_at IS NULL
                 ORDER BY id"
            ),
            &[],
        )
        .await?;
    rows.iter().map(payment_from_row).collect()
}

/// Claim a payment for submission by stamping the attempt time. Returns
/// false if another worker already claimed it.
pub async fn mark_submission_attempt(conn: &Object, id: i64, now: i64) -> Result<bool, Error> {
    let updated = conn
        .execute(
            "UPDATE payments SET submitted_at = $2
             WHERE id = $1 AND status = 'pending' AND submitted_at IS NULL",
            &[&id, &now],
        )
        .await?;
    Ok(updated == 1)
}

/// Release a submission claim whose send provably never started, making the
/// payment eligible for the next tick again. Only callers that know the
/// transfer did not happen may use this.
pub async fn clear_submission_attempt(conn: &Object, id: i64) -> Result<(), Error> {
    conn.execute(
        "UPDATE payments SET submitted_at = NULL
         WHERE id = $1 AND status = 'pending' AND txid IS NULL",
        &[&id],
    )
    .await?;
    Ok(())
}

/// Pending payments whose submission attempt never yielded a txid and has
/// outlived the timeout.
pub async fn stale_submission_attempts(
    conn: &Object,
    cutoff: i64,
) -> Result<Vec<Payment>, Error> {
    let rows = conn
        .query(
            &format!(
                "SELECT {PAYMENT_COLUMNS} FROM payments
                 WHERE status = 'pending' AND txid IS NULL
                   AND submitted_at IS NOT NULL AND submitted_at < $1
                 ORDER BY id"
            ),
            &[&cutoff],
        )
        .await?;
    rows.iter().map(payment_from_row).collect()
}

/// Pending payments already submitted, awaiting transactor confirmation.
pub async fn submitted_pending_payments(conn: &Object) -> Result<Vec<Payment>, Error> {
    let rows = conn
        .query(
            &format!(
                "SELECT {PAYMENT_COLUMNS} FROM payments
                 WHERE status = 'pending' AND txid IS NOT NULL
                 ORDER BY id"
            ),
            &[],
        )
        .await?;
    rows.iter().map(payment_from_row).collect()
}

pub async fn record_submission(conn: &Object, id: i64, txid: &str) -> Result<(), Error> {
    let updated = conn
        .execute(
            "UPDATE payments SET txid = $2
             WHERE id = $1 AND status = 'pending' AND txid IS NULL",
            &[&id, &txid],
        )
        .await?;
    if updated == 0 {
        return Err(Error::PaymentNotPending(id));
    }
    Ok(())
}

/// pending -> completed. The conditional update makes replays a no-op;
/// returns false when the payment was already resolved.
pub async fn complete_payment(conn: &Object, id: i64, now: i64) -> Result<bool, Error> {
    let updated = conn
        .execute(
            "UPDATE payments SET status = 'completed', resolved_at = $2
             WHERE id = $1 AND status = 'pending'",
            &[&id, &now],
        )
        .await?;
    Ok(updated == 1)
}

/// pending -> failed, restoring the debited amount to the account balance
/// in the same transaction. Failed payments must not destroy value.
pub async fn fail_payment(
    conn: &mut Object,
    id: i64,
    note: &str,
    now: i64,
) -> Result<bool, Error> {
    let tx = serializable(conn).await?;
    let row = tx
        .query_opt(
            "SELECT username, currency, amount FROM payments
             WHERE id = $1 AND status = 'pending'
             FOR UPDATE",
            &[&id],
        )
        .await?;
    let row = match row {
        Some(row) => row,
        None => return Ok(false),
    };
    let username: String = row.try_get(0)?;
    let currency: Currency = row.try_get(1)?;
    let amount: i64 = row.try_get(2)?;
    tx.execute(
        "UPDATE payments SET status = 'failed', note = $2, resolved_at = $3 WHERE id = $1",
        &[&id, &note, &now],
    )
    .await?;
    tx.execute(
        &format!(
            "UPDATE accounts SET {col} = {col} + $2, updated_at = $3 WHERE username = $1",
            col = balance_column(currency)
        ),
        &[&username, &amount, &now],
    )
    .await?;
    tx.commit().await?;
    Ok(true)
}

/// Leave a note on a pending payment for the operator. Used when the
/// transactor's answer cannot be obtained; the payment itself stays pending.
pub async fn note_payment(conn: &Object, id: i64, note: &str) -> Result<(), Error> {
    conn.execute(
        "UPDATE payments SET note = $2 WHERE id = $1 AND status = 'pending'",
        &[&id, &note],
    )
    .await?;
    Ok(())
}

/// Recompute the balance from the append-only history and compare it with
/// the stored column. A mismatch signals a bug or tampering and is returned
/// as an error, never repaired here.
pub async fn verify_account_balance(
    conn: &Object,
    username: &str,
    currency: Currency,
) -> Result<i64, Error> {
    let account = read_account(conn, username).await?;
    let stored = account.balance(currency);
    let credited: i64 = conn
        .query_one(
            "SELECT COALESCE(SUM(amount), 0)::BIGINT FROM rewards
             WHERE username = $1 AND currency = $2",
            &[&username, &currency],
        )
        .await?
        .try_get(0)?;
    let debited: i64 = conn
        .query_one(
            "SELECT COALESCE(SUM(amount), 0)::BIGINT FROM payments
             WHERE username = $1 AND currency = $2
               AND status IN ('pending', 'completed')",
            &[&username, &currency],
        )
        .await?
        .try_get(0)?;
    let recomputed = credited - debited;
    if recomputed != stored {
        return Err(Error::BalanceMismatch {
            username: username.to_string(),
            currency,
            stored,
            recomputed,
        });
    }
    Ok(stored)
}

#[cfg(test)]
mod tests {
    use super::*;

    // These run the payment lifecycle against a live database and are
    // skipped when TEST_DB_URL is not set.
    fn test_pool() -> Option<Pool> {
        let url = std::env::var("TEST_DB_URL").ok()?;
        let mut cfg = deadpool_postgres::Config::new();
        cfg.url = Some(url);
        cfg.create_pool(None, NoTls).ok()
    }

    async fn seeded_account(conn: &mut Object, tag: &str, balance: i64) -> (String, i64) {
        let now = crate::units::unix_now();
        let username = format!("{}_{}_{}", tag, std::process::id(), now);
        let tx = serializable(conn).await.unwrap();
        ensure_account(&tx, &username, 10_000, now).await.unwrap();
        credit_balance(&tx, &username, Currency::Tari, balance, now)
            .await
            .unwrap();
        tx.commit().await.unwrap();
        set_wallet(conn, &username, Currency::Tari, "f2CWXg4KRQXrzfzvQKsdPkpc", now)
            .await
            .unwrap();
        (username, now)
    }

    async fn tari_balance(conn: &Object, username: &str) -> i64 {
        read_account(conn, username)
            .await
            .unwrap()
            .balance(Currency::Tari)
    }

    #[tokio::test]
    async fn failed_payment_restores_the_balance_exactly() {
        let Some(pool) = test_pool() else { return };
        let mut conn = pool.get().await.unwrap();
        migrate(&conn).await.unwrap();
        let (username, now) = seeded_account(&mut conn, "refund", 9_000_000).await;

        let (id, amount) = issue_payment(&mut conn, &username, Currency::Tari, 5_000_000, now)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(amount, 9_000_000);
        assert_eq!(tari_balance(&conn, &username).await, 0);

        assert!(fail_payment(&mut conn, id, "transfer failure", now).await.unwrap());
        assert_eq!(tari_balance(&conn, &username).await, 9_000_000);

        // failed is terminal; a replay must not refund twice
        assert!(!fail_payment(&mut conn, id, "transfer failure", now).await.unwrap());
        assert_eq!(tari_balance(&conn, &username).await, 9_000_000);
    }

    #[tokio::test]
    async fn completing_a_payment_twice_is_a_no_op() {
        let Some(pool) = test_pool() else { return };
        let mut conn = pool.get().await.unwrap();
        migrate(&conn).await.unwrap();
        let (username, now) = seeded_account(&mut conn, "confirm", 7_000_000).await;

        let (id, _) = issue_payment(&mut conn, &username, Currency::Tari, 5_000_000, now)
            .await
            .unwrap()
            .unwrap();
        assert!(mark_submission_attempt(&conn, id, now).await.unwrap());
        record_submission(&conn, id, "txid_confirm").await.unwrap();

        assert!(complete_payment(&conn, id, now).await.unwrap());
        assert!(!complete_payment(&conn, id, now).await.unwrap());

        // completed is terminal for the failure path too; no refund
        assert!(!fail_payment(&mut conn, id, "late failure", now).await.unwrap());
        assert_eq!(tari_balance(&conn, &username).await, 0);
    }

    #[tokio::test]
    async fn released_claims_are_offered_again() {
        let Some(pool) = test_pool() else { return };
        let mut conn = pool.get().await.unwrap();
        migrate(&conn).await.unwrap();
        let (username, now) = seeded_account(&mut conn, "retry", 6_000_000).await;

        let (id, _) = issue_payment(&mut conn, &username, Currency::Tari, 5_000_000, now)
            .await
            .unwrap()
            .unwrap();
        assert!(mark_submission_attempt(&conn, id, now).await.unwrap());
        let offered = unsubmitted_payments(&conn).await.unwrap();
        assert!(!offered.iter().any(|p| p.id == id));

        clear_submission_attempt(&conn, id).await.unwrap();
        let offered = unsubmitted_payments(&conn).await.unwrap();
        assert!(offered.iter().any(|p| p.id == id));
    }
}
