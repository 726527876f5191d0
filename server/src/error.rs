use actix_web::HttpResponse;
use tandem_pool_types::Currency;

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("tokio postgres")]
    TokioPostgres(#[from] tokio_postgres::Error),
    #[error("deadpool postgres")]
    DeadpoolPostgres(#[from] deadpool_postgres::PoolError),
    #[error("reqwest")]
    Reqwest(#[from] reqwest::Error),
    #[error("serde json")]
    SerdeJson(#[from] serde_json::Error),
    #[error("std io")]
    StdIO(#[from] std::io::Error),
    #[error("std env")]
    StdEnv(#[from] std::env::VarError),
    #[error("std parse int")]
    StdParseInt(#[from] std::num::ParseIntError),

    #[error("block {1} for {0} has an empty share table")]
    EmptyShareTable(Currency, i64),
    #[error("block {1} for {0} has a non-positive reward")]
    NonPositiveReward(Currency, i64),
    #[error("block {1} for {0} has a negative share count")]
    NegativeShareCount(Currency, i64),
    #[error("block {1} for {0} has a share total that overflows")]
    ShareTotalOverflow(Currency, i64),
    #[error("block {1} for {0} doesn't exist")]
    BlockDoesNotExist(Currency, i64),
    #[error("block {1} for {0} already has a final check status")]
    BlockStatusFinal(Currency, i64),
    #[error("account doesn't exist: {0}")]
    AccountDoesNotExist(String),
    #[error("invalid {0} wallet address for {1}")]
    InvalidAddress(Currency, String),
    #[error("payment {0} is not pending")]
    PaymentNotPending(i64),

    /// Stored balance disagrees with the append-only history. Surfaced to
    /// the operator, never auto-repaired.
    #[error("balance mismatch for {username} {currency}: stored {stored}, history {recomputed}")]
    BalanceMismatch {
        username: String,
        currency: Currency,
        stored: i64,
        recomputed: i64,
    },

    /// Definitive rejection from the wallet transactor.
    #[error("payout rejected: {0}")]
    PayoutRejected(String),

    /// Transient wallet-side refusal. The wallet answered without
    /// transferring, so a retry is safe.
    #[error("wallet busy: {0}")]
    WalletBusy(String),

    #[error("{0}")]
    Internal(String),
}

impl From<Error> for HttpResponse {
    fn from(value: Error) -> Self {
        match value {
            Error::AccountDoesNotExist(_) | Error::BlockDoesNotExist(_, _) => {
                HttpResponse::NotFound().finish()
            }
            Error::EmptyShareTable(_, _)
            | Error::NonPositiveReward(_, _)
            | Error::NegativeShareCount(_, _)
            | Error::ShareTotalOverflow(_, _)
            | Error::InvalidAddress(_, _)
            | Error::PaymentNotPending(_)
            | Error::BlockStatusFinal(_, _) => HttpResponse::BadRequest().body(value.to_string()),
            Error::BalanceMismatch { .. } => {
                HttpResponse::InternalServerError().body(value.to_string())
            }
            _ => HttpResponse::InternalServerError().finish(),
        }
    }
}
