mod config;
mod database;
mod distributor;
mod error;
mod handlers;
mod payout;
mod reports;
mod units;
mod wallet;

use actix_cors::Cors;
use actix_web::{http::header, middleware, web, App, HttpServer};
use config::Config;

#[actix_web::main]
async fn main() -> std::io::Result<()> {
    env_logger::init();

    let cfg = Config::from_env().map_err(io_err)?;
    let pool = database::create_pool().map_err(io_err)?;

    // bootstrap the ledger schema before accepting traffic
    let conn = pool.get().await.map_err(|err| io_err(err.into()))?;
    database::migrate(&conn).await.map_err(io_err)?;
    drop(conn);

    let rpc_wallet = wallet::RpcWallet::new(&cfg).map_err(io_err)?;
    tokio::spawn(payout::run(pool.clone(), cfg.clone(), rpc_wallet));

    log::info!("listening on {}", cfg.server_bind);
    let bind = cfg.server_bind.clone();
    HttpServer::new(move || {
        App::new()
            .wrap(middleware::Logger::default())
            .wrap(create_cors())
            .app_data(web::Data::new(pool.clone()))
            .app_data(web::Data::new(cfg.clone()))
            .service(web::resource("/block").route(web::post().to(handlers::discover_block)))
            .service(
                web::resource("/block/{currency}/{height}/status")
                    .route(web::post().to(handlers::set_block_status)),
            )
            .service(web::resource("/pool").route(web::get().to(handlers::pool_snapshot)))
            .service(web::resource("/account/{username}").route(web::get().to(handlers::account)))
            .service(
                web::resource("/account/{username}/rewards")
                    .route(web::get().to(handlers::account_rewards)),
            )
            .service(
                web::resource("/account/{username}/payments")
                    .route(web::get().to(handlers::account_payments)),
            )
            .service(
                web::resource("/account/{username}/wallet")
                    .route(web::post().to(handlers::set_wallet)),
            )
            .service(
                web::resource("/account/{username}/verify/{currency}")
                    .route(web::get().to(handlers::verify_balance)),
            )
    })
    .bind(bind)?
    .run()
    .await
}

fn create_cors() -> Cors {
    Cors::default()
        .allowed_origin_fn(|_origin, _req_head| true)
        .allowed_methods(vec!["GET", "POST"])
        .allowed_headers(vec![header::AUTHORIZATION, header::ACCEPT])
        .allowed_header(header::CONTENT_TYPE)
        .max_age(3600)
}

fn io_err(err: error::Error) -> std::io::Error {
    std::io::Error::new(std::io::ErrorKind::Other, err.to_string())
}
