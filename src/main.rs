use actix_web::{web, App, HttpServer};
use std::env;

mod auth;
mod cache;
mod cart;
mod catalog;
mod coupons;
mod db;
mod error;
mod middleware;
mod models;
mod orders;
mod state;

use state::AppState;

#[actix_web::main]
async fn main() -> std::io::Result<()> {
    dotenv::dotenv().ok();
    env_logger::init();

    let db = db::connect().await;
    let redis_url = env::var("REDIS_URL").ok();
    let cache = cache::Cache::connect(redis_url.as_deref()).await;
    let app_state = web::Data::new(AppState::new(db, cache));

    let jwt_secret = env::var("JWT_SECRET").expect("JWT_SECRET must be set");
    let bind_addr = env::var("BIND_ADDR").unwrap_or_else(|_| "127.0.0.1:8080".to_string());

    log::info!("listening on {bind_addr}");
    HttpServer::new(move || {
        App::new()
            .app_data(app_state.clone())
            // Public routes
            .route("/signup", web::post().to(auth::sign_up))
            .route("/signin", web::post().to(auth::sign_in))
            .route("/products", web::get().to(catalog::list_products))
            .route("/products/{product_id}", web::get().to(catalog::get_product))
            // Payment gateway webhook, verified upstream of this service
            .route("/payments/webhook", web::post().to(orders::update_payment_status))
            .service(
                web::scope("")
                    .wrap(middleware::AuthMiddleware::new(jwt_secret.clone()))
                    .route("/profile", web::get().to(auth::get_profile))
                    .route("/profile", web::put().to(auth::update_profile))
                    .route("/profile", web::delete().to(auth::delete_profile))
                    .route("/products", web::post().to(catalog::add_product))
                    .route("/products/{product_id}", web::put().to(catalog::update_product))
                    .route("/products/{product_id}", web::delete().to(catalog::delete_product))
                    .route("/cart", web::post().to(cart::add_to_cart))
                    .route("/cart", web::get().to(cart::get_cart))
                    .route("/cart", web::delete().to(cart::clear_cart))
                    .route("/cart/{item_id}", web::put().to(cart::update_quantity))
                    .route("/cart/{item_id}", web::delete().to(cart::remove_from_cart))
                    .route("/orders", web::post().to(orders::create_order))
                    .route("/orders", web::get().to(orders::list_orders))
                    .route("/orders/{order_id}", web::get().to(orders::get_order))
                    .route("/orders/{order_id}/status", web::put().to(orders::update_order_status))
                    .route("/coupons", web::post().to(coupons::create_coupon))
                    .route("/coupons/{code}", web::get().to(coupons::validate_coupon))
                    .route("/cache/invalidate", web::post().to(catalog::invalidate_products)),
            )
    })
    .bind(bind_addr)?
    .run()
    .await
}
