//! Order lifecycle: cart-to-order commit, status transitions, payment
//! status updates.
//!
//! The commit is the one place stock actually moves. Each line's decrement
//! is a conditional update (`stock >= qty` folded into the filter), so two
//! orders racing for the last units can never both win. Commit and
//! cancellation both compensate on a mid-loop failure: a failed commit puts
//! back the lines already taken, a failed restock takes back the lines
//! already returned, so neither path can double-move stock on a retry.

use actix_web::{web, HttpRequest, HttpResponse};
use async_trait::async_trait;
use chrono::Utc;
use futures::stream::StreamExt;
use mongodb::bson::{doc, Document};
use mongodb::Collection;
use serde_json::json;
use uuid::Uuid;

use crate::cache::PRODUCTS_PATTERN;
use crate::cart::clear_for_user;
use crate::coupons;
use crate::error::ApiError;
use crate::middleware::caller_id;
use crate::models::{
    CreateOrderInput, Order, OrderItem, OrderStatus, PaymentStatus, PaymentWebhookInput, Product,
    UpdateStatusInput,
};
use crate::state::AppState;

/// What applying a status change entails.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransitionEffect {
    /// Write the new status.
    Apply,
    /// Write the new status and return every line's units to stock.
    ApplyAndRestock,
    /// Nothing to do (already in the requested state).
    Noop,
}

/// Fulfilment moves forward only (PENDING → PROCESSING → SHIPPED →
/// DELIVERED); CANCELED is reachable from any non-terminal state and
/// restores stock exactly once.
pub fn plan_transition(from: OrderStatus, to: OrderStatus) -> Result<TransitionEffect, ApiError> {
    use OrderStatus::*;
    if from == to {
        return Ok(TransitionEffect::Noop);
    }
    if from.is_terminal() {
        return Err(ApiError::InvalidStatus(format!(
            "cannot leave terminal status {}",
            from.as_str()
        )));
    }
    if to == Canceled {
        return Ok(TransitionEffect::ApplyAndRestock);
    }
    let rank = |s: OrderStatus| match s {
        Pending => 0,
        Processing => 1,
        Shipped => 2,
        Delivered => 3,
        Canceled => unreachable!("handled above"),
    };
    if rank(to) > rank(from) {
        Ok(TransitionEffect::Apply)
    } else {
        Err(ApiError::InvalidStatus(format!(
            "cannot move from {} back to {}",
            from.as_str(),
            to.as_str()
        )))
    }
}

/// Seam over the product stock counters, so the commit and cancellation
/// compensation paths can be exercised without a live database.
#[async_trait]
pub trait StockLedger {
    /// Conditionally take `qty` units of a product; `false` means stock on
    /// hand was short and nothing changed.
    async fn take(&self, product_id: i64, qty: i64) -> Result<bool, ApiError>;

    /// Return `qty` previously taken units.
    async fn put_back(&self, product_id: i64, qty: i64) -> Result<(), ApiError>;
}

#[async_trait]
impl StockLedger for Collection<Product> {
    async fn take(&self, product_id: i64, qty: i64) -> Result<bool, ApiError> {
        let result = self
            .update_one(
                doc! { "_id": product_id, "stock": { "$gte": qty } },
                doc! { "$inc": { "stock": -qty, "sold_count": qty } },
                None,
            )
            .await?;
        Ok(result.modified_count == 1)
    }

    async fn put_back(&self, product_id: i64, qty: i64) -> Result<(), ApiError> {
        self.update_one(
            doc! { "_id": product_id },
            doc! { "$inc": { "stock": qty, "sold_count": -qty } },
            None,
        )
        .await?;
        Ok(())
    }
}

/// Decrement every line or nothing. A line that finds less stock than it
/// needs (or errors) puts back the lines already taken, leaving the ledger
/// as it was before the commit started.
pub async fn commit_lines(ledger: &impl StockLedger, items: &[OrderItem]) -> Result<(), ApiError> {
    let mut taken: Vec<(i64, i64)> = Vec::new();
    for item in items {
        let committed = match ledger.take(item.product_id, item.quantity).await {
            Ok(committed) => committed,
            Err(e) => {
                release(ledger, &taken).await;
                return Err(e);
            }
        };
        if !committed {
            release(ledger, &taken).await;
            return Err(ApiError::InsufficientStock {
                product: item.name.clone(),
                available: 0,
            });
        }
        taken.push((item.product_id, item.quantity));
    }
    Ok(())
}

async fn release(ledger: &impl StockLedger, taken: &[(i64, i64)]) {
    for &(product_id, qty) in taken {
        if let Err(e) = ledger.put_back(product_id, qty).await {
            log::error!("failed to release {qty} units of product {product_id}: {e}");
        }
    }
}

/// Return every line's units or none. An error mid-loop takes back the
/// lines already restored, so the order keeps its active status and a
/// retried cancellation restores stock exactly once.
pub async fn restock_lines(ledger: &impl StockLedger, items: &[OrderItem]) -> Result<(), ApiError> {
    let mut restored: Vec<(i64, i64)> = Vec::new();
    for item in items {
        if let Err(e) = ledger.put_back(item.product_id, item.quantity).await {
            for &(product_id, qty) in &restored {
                // Conditional, so the undo cannot drive stock negative if
                // the restored units were bought in the meantime.
                match ledger.take(product_id, qty).await {
                    Ok(true) => {}
                    Ok(false) => log::error!(
                        "could not undo restock of {qty} units of product {product_id}: units already sold"
                    ),
                    Err(e2) => log::error!(
                        "failed to undo restock of {qty} units of product {product_id}: {e2}"
                    ),
                }
            }
            return Err(e);
        }
        restored.push((item.product_id, item.quantity));
    }
    Ok(())
}

/// Orders are visible to and mutable by their owner only; the predicate
/// carries the check, as everywhere else in the crate.
fn order_scope(order_id: &str, user_id: &str) -> Document {
    doc! { "_id": order_id, "user_id": user_id }
}

pub async fn create_order(
    state: web::Data<AppState>,
    data: web::Json<CreateOrderInput>,
    req: HttpRequest,
) -> Result<HttpResponse, ApiError> {
    let user_id = caller_id(&req)?;

    let mut cursor = state
        .cart_items()
        .find(doc! { "user_id": &user_id }, None)
        .await?;
    let mut cart_items = Vec::new();
    while let Some(item) = cursor.next().await {
        cart_items.push(item?);
    }
    if cart_items.is_empty() {
        return Err(ApiError::EmptyCart);
    }

    // Advisory pre-validation: fail fast with the offending product named
    // before anything is written. The conditional decrements below remain
    // the authoritative check.
    let mut items = Vec::with_capacity(cart_items.len());
    for cart_item in &cart_items {
        let product = state
            .products()
            .find_one(doc! { "_id": cart_item.product_id }, None)
            .await?
            .ok_or(ApiError::NotFound("product"))?;
        if product.stock < cart_item.quantity {
            return Err(ApiError::InsufficientStock {
                product: product.name,
                available: product.stock,
            });
        }
        items.push(OrderItem {
            product_id: product._id,
            name: product.name,
            category: product.category,
            price: product.price,
            discount_percent: product.discount_percent,
            size: cart_item.size.clone(),
            color: cart_item.color.clone(),
            quantity: cart_item.quantity,
        });
    }

    // A missing coupon is tolerated: the order proceeds without discount
    // attribution, the anomaly goes to the log.
    let coupon_code = match &data.coupon_code {
        Some(code) => {
            let found = state
                .coupons()
                .find_one(doc! { "code": code }, None)
                .await
                .unwrap_or_else(|e| {
                    log::warn!("coupon lookup failed for {code}: {e}");
                    None
                });
            if found.is_none() {
                log::warn!("coupon {code} not found, order proceeds without it");
            }
            found.map(|c| c.code)
        }
        None => None,
    };

    let order = Order {
        _id: Uuid::new_v4().to_string(),
        user_id: user_id.clone(),
        address_id: data.address_id.clone(),
        payment_method: data.payment_method.clone(),
        coupon_code: coupon_code.clone(),
        total: data.total,
        status: OrderStatus::Pending,
        payment_status: PaymentStatus::Pending,
        payment_id: data.payment_intent_id.clone(),
        created_at: Utc::now(),
        items,
    };
    state.orders().insert_one(&order, None).await?;

    // Authoritative decrement. A failed line unwinds the lines before it
    // (inside commit_lines) and then the order document, leaving no partial
    // writes.
    if let Err(e) = commit_lines(&state.products(), &order.items).await {
        if let Err(e2) = state
            .orders()
            .delete_one(doc! { "_id": &order._id }, None)
            .await
        {
            log::error!("failed to delete aborted order {}: {e2}", order._id);
        }
        return Err(e);
    }

    // Usage credit is best-effort: a failure here never unwinds the order.
    if let Some(code) = &coupon_code {
        coupons::redeem(&state.coupons(), code).await;
    }

    clear_for_user(&state.cart_items(), &user_id).await?;
    state.cache.invalidate(PRODUCTS_PATTERN).await;

    Ok(HttpResponse::Created().json(&order))
}

pub async fn list_orders(
    state: web::Data<AppState>,
    req: HttpRequest,
) -> Result<HttpResponse, ApiError> {
    let user_id = caller_id(&req)?;
    let mut cursor = state
        .orders()
        .find(doc! { "user_id": &user_id }, None)
        .await?;
    let mut orders = Vec::new();
    while let Some(order) = cursor.next().await {
        orders.push(order?);
    }
    Ok(HttpResponse::Ok().json(orders))
}

pub async fn get_order(
    state: web::Data<AppState>,
    order_id: web::Path<String>,
    req: HttpRequest,
) -> Result<HttpResponse, ApiError> {
    let user_id = caller_id(&req)?;
    let order = state
        .orders()
        .find_one(order_scope(&order_id, &user_id), None)
        .await?
        .ok_or(ApiError::NotFound("order"))?;
    Ok(HttpResponse::Ok().json(order))
}

pub async fn update_order_status(
    state: web::Data<AppState>,
    order_id: web::Path<String>,
    data: web::Json<UpdateStatusInput>,
    req: HttpRequest,
) -> Result<HttpResponse, ApiError> {
    let user_id = caller_id(&req)?;
    let new_status = OrderStatus::parse(&data.status)
        .ok_or_else(|| ApiError::InvalidStatus(data.status.clone()))?;
    let order_id = order_id.into_inner();

    let order = state
        .orders()
        .find_one(order_scope(&order_id, &user_id), None)
        .await?
        .ok_or(ApiError::NotFound("order"))?;

    match plan_transition(order.status, new_status)? {
        TransitionEffect::Noop => {
            // Second CANCELED (or any repeat) restores nothing.
            return Ok(HttpResponse::Ok().json(json!({
                "message": "Status unchanged",
                "status": order.status.as_str(),
            })));
        }
        TransitionEffect::Apply => {}
        TransitionEffect::ApplyAndRestock => {
            // On failure the lines already restored were taken back and the
            // status below is never written, so a retry starts clean.
            restock_lines(&state.products(), &order.items).await?;
        }
    }

    state
        .orders()
        .update_one(
            order_scope(&order_id, &user_id),
            doc! { "$set": { "status": new_status.as_str() } },
            None,
        )
        .await?;

    if new_status == OrderStatus::Canceled {
        // Stock changed, catalog reads must not serve the old counts.
        state.cache.invalidate(PRODUCTS_PATTERN).await;
    }

    Ok(HttpResponse::Ok().json(json!({
        "message": "Status updated",
        "status": new_status.as_str(),
    })))
}

/// Webhook-fed payment outcome. SUCCESS changes nothing about stock (it was
/// decremented at creation); FAILED is recorded but stock comes back only
/// through an explicit cancellation.
pub async fn update_payment_status(
    state: web::Data<AppState>,
    data: web::Json<PaymentWebhookInput>,
) -> Result<HttpResponse, ApiError> {
    let new_status = if data.succeeded {
        PaymentStatus::Success
    } else {
        PaymentStatus::Failed
    };

    let result = state
        .orders()
        .update_one(
            doc! { "payment_id": &data.payment_id },
            doc! { "$set": { "payment_status": new_status.as_str() } },
            None,
        )
        .await?;
    if result.matched_count == 0 {
        return Err(ApiError::NotFound("order"));
    }

    state.cache.invalidate(PRODUCTS_PATTERN).await;

    Ok(HttpResponse::Ok().json(json!({
        "message": "Payment status updated",
        "payment_status": new_status.as_str(),
    })))
}
