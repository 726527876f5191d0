use std::time::Duration;

use deadpool_postgres::Pool;
use tandem_pool_types::Currency;

use crate::{
    config::Config,
    database,
    error::Error,
    units,
    wallet::{valid_address, RpcWallet, TransferStatus, WalletTransactor},
};

const QUERY_MAX_RETRIES: u32 = 3;
const QUERY_BACKOFF_START: Duration = Duration::from_secs(1);

/// Payout worker. Each tick issues due payments, submits freshly issued
/// ones to the wallet and reconciles the ones awaiting confirmation. The
/// database transaction is the sole coordination point, so concurrent
/// workers are safe, just wasteful.
pub async fn run(pool: Pool, cfg: Config, wallet: RpcWallet) {
    let mut interval = tokio::time::interval(Duration::from_secs(cfg.payout_interval_secs));
    loop {
        interval.tick().await;
        if let Err(err) = tick(&pool, &cfg, &wallet).await {
            log::error!("payout cycle failed: {:?}", err);
        }
    }
}

async fn tick<W: WalletTransactor>(pool: &Pool, cfg: &Config, wallet: &W) -> Result<(), Error> {
    issue_due_payments(pool, cfg).await?;
    submit_issued(pool, wallet).await?;
    reconcile_submitted(pool, wallet).await?;
    flag_stale_submissions(pool, cfg).await?;
    Ok(())
}

/// Phase 1: debit eligible balances and create pending payment rows. The
/// debit and the insert share one serializable transaction, so the same
/// funds can never be selected twice even when cycles overlap.
async fn issue_due_payments(pool: &Pool, cfg: &Config) -> Result<(), Error> {
    let mut conn = pool.get().await?;
    for currency in Currency::ALL {
        let min_payout = cfg.min_payout(currency);
        let due = database::eligible_payouts(&conn, currency, min_payout).await?;
        for (username, _balance, destination) in due {
            if !valid_address(currency, &destination) {
                log::warn!(
                    "skipping payout for {}: invalid {} address {:?}",
                    username,
                    currency,
                    destination
                );
                continue;
            }
            let now = units::unix_now();
            match database::issue_payment(&mut conn, &username, currency, min_payout, now).await? {
                Some((id, amount)) => {
                    log::info!(
                        "issued payment {}: {} {} to {}",
                        id,
                        units::format_amount(currency, amount),
                        currency,
                        username
                    );
                }
                None => {
                    // balance moved below the threshold between selection
                    // and locking; a concurrent cycle beat us to it
                    log::info!("payout no longer due for {} {}", username, currency);
                }
            }
        }
    }
    Ok(())
}

/// Phase 2: hand never-attempted pending payments to the wallet. The
/// attempt is marked durably before the network call; only sends that
/// provably never happened release the claim for a retry, everything with
/// an unknown outcome goes to operator review instead of being re-sent,
/// because the transfer may have gone through without us learning the txid.
async fn submit_issued<W: WalletTransactor>(pool: &Pool, wallet: &W) -> Result<(), Error> {
    let mut conn = pool.get().await?;
    let payments = database::unsubmitted_payments(&conn).await?;
    for payment in payments {
        let now = units::unix_now();
        if !database::mark_submission_attempt(&conn, payment.id, now).await? {
            // another worker claimed it
            continue;
        }
        match wallet
            .send(payment.currency, &payment.destination, payment.amount)
            .await
        {
            Ok(txid) => {
                database::record_submission(&conn, payment.id, &txid).await?;
                log::info!("submitted payment {}: txid {}", payment.id, txid);
            }
            Err(err) => match submit_disposition(&err) {
                Disposition::Reject => {
                    log::error!("payment {} rejected by wallet: {}", payment.id, err);
                    database::fail_payment(&mut conn, payment.id, &err.to_string(), now).await?;
                }
                Disposition::Retry => {
                    // no transfer was made; release the claim so the next
                    // tick tries again
                    log::warn!("payment {} not submitted, will retry: {:?}", payment.id, err);
                    database::clear_submission_attempt(&conn, payment.id).await?;
                }
                Disposition::Review => {
                    // outcome unknown; leave the attempt marker in place and
                    // let the stale-submission review path pick it up
                    log::error!("payment {} submission outcome unknown: {:?}", payment.id, err);
                }
            },
        }
    }
    Ok(())
}

/// What a failed `send` means for the pending payment.
#[derive(Debug, PartialEq, Eq)]
enum Disposition {
    /// Definitive wallet refusal; fail the payment and refund.
    Reject,
    /// The request never left the host or the wallet answered without
    /// transferring; safe to release the claim and retry next tick.
    Retry,
    /// Outcome unknown; the transfer may have happened. Operator review.
    Review,
}

fn submit_disposition(err: &Error) -> Disposition {
    match err {
        Error::PayoutRejected(_) => Disposition::Reject,
        Error::WalletBusy(_) => Disposition::Retry,
        Error::Reqwest(err) if err.is_connect() || err.is_builder() => Disposition::Retry,
        _ => Disposition::Review,
    }
}

/// What reconciliation does with a transactor answer.
#[derive(Debug, PartialEq, Eq)]
enum Reconcile {
    Complete,
    Fail(&'static str),
    Wait,
}

fn reconcile_action(status: TransferStatus) -> Reconcile {
    match status {
        TransferStatus::Confirmed => Reconcile::Complete,
        TransferStatus::Failed => Reconcile::Fail("transactor reported transfer failure"),
        TransferStatus::Pending => Reconcile::Wait,
    }
}

/// Phase 3: query submitted payments and apply the resulting transition.
/// The query is retried with backoff; the transfer itself is never
/// re-submitted here.
async fn reconcile_submitted<W: WalletTransactor>(pool: &Pool, wallet: &W) -> Result<(), Error> {
    let mut conn = pool.get().await?;
    let payments = database::submitted_pending_payments(&conn).await?;
    for payment in payments {
        let txid = match payment.txid.as_deref() {
            Some(txid) => txid,
            None => continue,
        };
        match query_with_backoff(wallet, payment.currency, txid).await {
            Ok(status) => match reconcile_action(status) {
                Reconcile::Complete => {
                    let completed =
                        database::complete_payment(&conn, payment.id, units::unix_now()).await?;
                    if completed {
                        log::info!("payment {} completed: txid {}", payment.id, txid);
                    }
                }
                Reconcile::Fail(note) => {
                    database::fail_payment(&mut conn, payment.id, note, units::unix_now()).await?;
                    log::error!(
                        "payment {} failed, {} {} restored to {}",
                        payment.id,
                        units::format_amount(payment.currency, payment.amount),
                        payment.currency,
                        payment.username
                    );
                }
                Reconcile::Wait => {}
            },
            Err(err) => {
                // retries exhausted or the wallet refused the query; leave
                // the payment pending and surface it to the operator
                let note = format!("status query failed: {}", err);
                database::note_payment(&conn, payment.id, &note).await?;
                log::error!(
                    "payment {} needs operator review: {}",
                    payment.id,
                    note
                );
            }
        }
    }
    Ok(())
}

/// Phase 4: payments whose submission attempt never produced a txid and
/// which have outlived the pending timeout are flagged for the operator.
/// They are never auto-failed: the funds may be in flight.
async fn flag_stale_submissions(pool: &Pool, cfg: &Config) -> Result<(), Error> {
    let conn = pool.get().await?;
    let cutoff = units::unix_now() - cfg.payment_pending_timeout_secs;
    let stale = database::stale_submission_attempts(&conn, cutoff).await?;
    for payment in stale {
        let note = "submission outcome unknown past timeout; operator review required";
        database::note_payment(&conn, payment.id, note).await?;
        log::error!(
            "payment {} ({} {} to {}) {}",
            payment.id,
            units::format_amount(payment.currency, payment.amount),
            payment.currency,
            payment.username,
            note
        );
    }
    Ok(())
}

/// Bounded retry on the status query only. A definitive wallet refusal is
/// returned immediately; transient transport errors back off and retry.
async fn query_with_backoff<W: WalletTransactor>(
    wallet: &W,
    currency: Currency,
    txid: &str,
) -> Result<TransferStatus, Error> {
    let mut delay = QUERY_BACKOFF_START;
    let mut attempt = 0;
    loop {
        match wallet.query_status(currency, txid).await {
            Ok(status) => return Ok(status),
            Err(err @ Error::PayoutRejected(_)) => return Err(err),
            Err(err) => {
                attempt += 1;
                if attempt >= QUERY_MAX_RETRIES {
                    return Err(err);
                }
                log::warn!("status query for {} failed, retrying: {:?}", txid, err);
                tokio::time::sleep(delay).await;
                delay *= 2;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use super::*;

    /// Scripted transactor: pops the next outcome per call.
    struct FakeWallet {
        statuses: Mutex<Vec<Result<TransferStatus, Error>>>,
    }

    impl FakeWallet {
        fn scripted(statuses: Vec<Result<TransferStatus, Error>>) -> Self {
            Self {
                statuses: Mutex::new(statuses),
            }
        }
    }

    impl WalletTransactor for FakeWallet {
        async fn send(
            &self,
            _currency: Currency,
            _destination: &str,
            _amount: i64,
        ) -> Result<String, Error> {
            Ok("txid".to_string())
        }

        async fn query_status(
            &self,
            _currency: Currency,
            _txid: &str,
        ) -> Result<TransferStatus, Error> {
            self.statuses.lock().unwrap().remove(0)
        }
    }

    #[test]
    fn confirmed_completes_and_failed_refunds() {
        assert_eq!(
            reconcile_action(TransferStatus::Confirmed),
            Reconcile::Complete
        );
        assert!(matches!(
            reconcile_action(TransferStatus::Failed),
            Reconcile::Fail(_)
        ));
        assert_eq!(reconcile_action(TransferStatus::Pending), Reconcile::Wait);
    }

    #[test]
    fn send_failures_route_by_disposition() {
        assert_eq!(
            submit_disposition(&Error::PayoutRejected("bad address".to_string())),
            Disposition::Reject
        );
        assert_eq!(
            submit_disposition(&Error::WalletBusy("daemon is busy".to_string())),
            Disposition::Retry
        );
        // anything else could have reached the wallet
        assert_eq!(
            submit_disposition(&Error::Internal("timed out".to_string())),
            Disposition::Review
        );
    }

    #[tokio::test]
    async fn refused_connections_are_retried_next_tick() {
        // nothing listens on the discard port, so the request never leaves
        // the host
        let client = reqwest::Client::new();
        let err = client
            .post("http://127.0.0.1:9/json_rpc")
            .send()
            .await
            .unwrap_err();
        assert_eq!(
            submit_disposition(&Error::Reqwest(err)),
            Disposition::Retry
        );
    }

    #[tokio::test(start_paused = true)]
    async fn query_retries_transient_errors_with_backoff() {
        let wallet = FakeWallet::scripted(vec![
            Err(Error::Internal("connection reset".to_string())),
            Err(Error::Internal("connection reset".to_string())),
            Ok(TransferStatus::Confirmed),
        ]);
        let status = query_with_backoff(&wallet, Currency::Xmr, "abc")
            .await
            .unwrap();
        assert_eq!(status, TransferStatus::Confirmed);
    }

    #[tokio::test(start_paused = true)]
    async fn query_gives_up_after_bounded_retries() {
        let wallet = FakeWallet::scripted(vec![
            Err(Error::Internal("timeout".to_string())),
            Err(Error::Internal("timeout".to_string())),
            Err(Error::Internal("timeout".to_string())),
        ]);
        let err = query_with_backoff(&wallet, Currency::Xmr, "abc")
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Internal(_)));
    }

    #[tokio::test]
    async fn definitive_refusal_is_not_retried() {
        let wallet = FakeWallet::scripted(vec![Err(Error::PayoutRejected(
            "unknown txid".to_string(),
        ))]);
        let err = query_with_backoff(&wallet, Currency::Tari, "abc")
            .await
            .unwrap_err();
        assert!(matches!(err, Error::PayoutRejected(_)));
        // a second scripted answer would have been consumed by a retry
        assert!(wallet.statuses.lock().unwrap().is_empty());
    }
}
