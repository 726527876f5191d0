use actix_web::{web, HttpResponse, Responder};
use deadpool_postgres::Pool;
use tandem_pool_types::{
    AccountPath, BlockDiscoveryPayload, BlockPath, BlockStatusPayload, HistoryQuery,
    SetWalletPayload, VerifyPath, VerifyResponse,
};

use crate::{
    config::Config, database, distributor, error::Error, reports, units, wallet,
};

/// Block-discovery input from the external share tracker.
pub async fn discover_block(
    pool: web::Data<Pool>,
    cfg: web::Data<Config>,
    payload: web::Json<BlockDiscoveryPayload>,
) -> impl Responder {
    match distributor::distribute_block(pool.as_ref(), cfg.as_ref(), &payload).await {
        Ok(response) => HttpResponse::Ok().json(&response),
        Err(err) => {
            log::error!("{:?}", err);
            let http_response: HttpResponse = err.into();
            http_response
        }
    }
}

/// External validator callback attaching a block's validity verdict.
pub async fn set_block_status(
    pool: web::Data<Pool>,
    path: web::Path<BlockPath>,
    payload: web::Json<BlockStatusPayload>,
) -> impl Responder {
    let res = async {
        let conn = pool.get().await?;
        database::set_block_check_status(&conn, path.currency, path.height, payload.status).await
    }
    .await;
    match res {
        Ok(()) => HttpResponse::Ok().finish(),
        Err(err) => {
            log::error!("{:?}", err);
            let http_response: HttpResponse = err.into();
            http_response
        }
    }
}

pub async fn pool_snapshot(pool: web::Data<Pool>) -> impl Responder {
    let res = async {
        let conn = pool.get().await?;
        reports::pool_snapshot(&conn).await
    }
    .await;
    match res {
        Ok(snapshot) => HttpResponse::Ok().json(&snapshot),
        Err(err) => {
            log::error!("{:?}", err);
            HttpResponse::InternalServerError().finish()
        }
    }
}

pub async fn account(pool: web::Data<Pool>, path: web::Path<AccountPath>) -> impl Responder {
    let res = async {
        let conn = pool.get().await?;
        reports::account_snapshot(&conn, &path.username).await
    }
    .await;
    match res {
        Ok(snapshot) => HttpResponse::Ok().json(&snapshot),
        Err(err) => {
            log::error!("{:?}", err);
            let http_response: HttpResponse = err.into();
            http_response
        }
    }
}

pub async fn account_rewards(
    pool: web::Data<Pool>,
    path: web::Path<AccountPath>,
    query: web::Query<HistoryQuery>,
) -> impl Responder {
    let res = async {
        let conn = pool.get().await?;
        reports::account_rewards(&conn, &path.username, query.limit, query.offset).await
    }
    .await;
    match res {
        Ok(rewards) => HttpResponse::Ok().json(&rewards),
        Err(err) => {
            log::error!("{:?}", err);
            let http_response: HttpResponse = err.into();
            http_response
        }
    }
}

pub async fn account_payments(
    pool: web::Data<Pool>,
    path: web::Path<AccountPath>,
    query: web::Query<HistoryQuery>,
) -> impl Responder {
    let res = async {
        let conn = pool.get().await?;
        reports::account_payments(&conn, &path.username, query.limit, query.offset).await
    }
    .await;
    match res {
        Ok(payments) => HttpResponse::Ok().json(&payments),
        Err(err) => {
            log::error!("{:?}", err);
            let http_response: HttpResponse = err.into();
            http_response
        }
    }
}

/// Register or replace a payout address. The address shape is checked here
/// so the payout worker never debits against a malformed destination.
pub async fn set_wallet(
    pool: web::Data<Pool>,
    path: web::Path<AccountPath>,
    payload: web::Json<SetWalletPayload>,
) -> impl Responder {
    let res = async {
        if !wallet::valid_address(payload.currency, &payload.address) {
            return Err(Error::InvalidAddress(
                payload.currency,
                path.username.clone(),
            ));
        }
        let conn = pool.get().await?;
        database::set_wallet(
            &conn,
            &path.username,
            payload.currency,
            &payload.address,
            units::unix_now(),
        )
        .await
    }
    .await;
    match res {
        Ok(()) => HttpResponse::Ok().finish(),
        Err(err) => {
            log::error!("{:?}", err);
            let http_response: HttpResponse = err.into();
            http_response
        }
    }
}

/// Reconciliation check: recompute the balance from history and compare
/// with the stored column. A mismatch surfaces as a consistency fault.
pub async fn verify_balance(pool: web::Data<Pool>, path: web::Path<VerifyPath>) -> impl Responder {
    let res = async {
        let conn = pool.get().await?;
        database::verify_account_balance(&conn, &path.username, path.currency).await
    }
    .await;
    match res {
        Ok(balance) => HttpResponse::Ok().json(&VerifyResponse {
            username: path.username.clone(),
            currency: path.currency,
            balance,
        }),
        Err(err) => {
            log::error!("{:?}", err);
            let http_response: HttpResponse = err.into();
            http_response
        }
    }
}
