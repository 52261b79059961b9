//! Cart mutations and the per-product stock ceiling.
//!
//! Cart quantities are soft reservations: they never touch `Product.stock`,
//! but every add/update re-reads live stock and the caller's existing
//! reservations for that product so the summed total across all size/color
//! variants stays within stock. Staleness here is overselling, so nothing in
//! this check is cached.

use actix_web::{web, HttpRequest, HttpResponse};
use futures::stream::StreamExt;
use mongodb::bson::doc;
use mongodb::Collection;
use serde_json::json;
use std::collections::HashMap;
use uuid::Uuid;

use crate::error::ApiError;
use crate::middleware::caller_id;
use crate::models::{AddToCartInput, CartItem, Product, UpdateQuantityInput};
use crate::state::AppState;

/// Units of one variant still addable given live stock, the reservations
/// held by the product's other variants, and the variant's own quantity.
pub fn addable(stock: i64, other_variants: i64, existing_match: i64) -> i64 {
    (stock - other_variants - existing_match).max(0)
}

/// The ceiling check run on every cart mutation: would `requested` more
/// units push the product's summed reservations past current stock?
pub fn check_ceiling(
    stock: i64,
    other_variants: i64,
    existing_match: i64,
    requested: i64,
) -> Result<(), ApiError> {
    if stock <= 0 {
        return Err(ApiError::OutOfStock);
    }
    if other_variants + existing_match + requested > stock {
        return Err(ApiError::StockExceeded {
            available: addable(stock, other_variants, existing_match),
        });
    }
    Ok(())
}

/// Partition the caller's reservations for one product into the variant
/// matching (size, color) and the summed quantity of every other variant.
pub fn split_variants<'a>(
    reservations: &'a [CartItem],
    size: &Option<String>,
    color: &Option<String>,
) -> (Option<&'a CartItem>, i64) {
    let mut matching = None;
    let mut other_variants = 0;
    for item in reservations {
        if item.size == *size && item.color == *color {
            matching = Some(item);
        } else {
            other_variants += item.quantity;
        }
    }
    (matching, other_variants)
}

fn validate_variant(product: &Product, size: &Option<String>, color: &Option<String>) -> Result<(), ApiError> {
    if let Some(size) = size {
        if !product.sizes.contains(size) {
            return Err(ApiError::InvalidVariant(format!(
                "size {size} is not offered for {}",
                product.name
            )));
        }
    }
    if let Some(color) = color {
        if !product.colors.contains(color) {
            return Err(ApiError::InvalidVariant(format!(
                "color {color} is not offered for {}",
                product.name
            )));
        }
    }
    Ok(())
}

/// All of the caller's reservations for one product, across variants.
async fn product_reservations(
    cart_items: &Collection<CartItem>,
    user_id: &str,
    product_id: i64,
) -> Result<Vec<CartItem>, ApiError> {
    let filter = doc! { "user_id": user_id, "product_id": product_id };
    let mut cursor = cart_items.find(filter, None).await?;
    let mut items = Vec::new();
    while let Some(item) = cursor.next().await {
        items.push(item?);
    }
    Ok(items)
}

pub async fn add_to_cart(
    state: web::Data<AppState>,
    data: web::Json<AddToCartInput>,
    req: HttpRequest,
) -> Result<HttpResponse, ApiError> {
    let user_id = caller_id(&req)?;
    if data.quantity <= 0 {
        return Err(ApiError::InvalidQuantity);
    }

    let product = state
        .products()
        .find_one(doc! { "_id": data.product_id }, None)
        .await?
        .ok_or(ApiError::NotFound("product"))?;
    validate_variant(&product, &data.size, &data.color)?;

    let reservations =
        product_reservations(&state.cart_items(), &user_id, data.product_id).await?;
    let (matching, other_variants) = split_variants(&reservations, &data.size, &data.color);
    let existing_match = matching.map_or(0, |item| item.quantity);

    check_ceiling(product.stock, other_variants, existing_match, data.quantity)?;

    let new_quantity = existing_match + data.quantity;
    let item_id = match matching {
        Some(item) => {
            state
                .cart_items()
                .update_one(
                    doc! { "_id": &item._id, "user_id": &user_id },
                    doc! { "$inc": { "quantity": data.quantity } },
                    None,
                )
                .await?;
            item._id.clone()
        }
        None => {
            let item = CartItem {
                _id: Uuid::new_v4().to_string(),
                user_id: user_id.clone(),
                product_id: data.product_id,
                size: data.size.clone(),
                color: data.color.clone(),
                quantity: data.quantity,
            };
            state.cart_items().insert_one(&item, None).await?;
            item._id
        }
    };

    Ok(HttpResponse::Created().json(json!({
        "message": "Product added to cart",
        "item_id": item_id,
        "quantity": new_quantity,
        "available_stock": product.stock - other_variants - new_quantity,
    })))
}

pub async fn update_quantity(
    state: web::Data<AppState>,
    item_id: web::Path<String>,
    data: web::Json<UpdateQuantityInput>,
    req: HttpRequest,
) -> Result<HttpResponse, ApiError> {
    let user_id = caller_id(&req)?;
    // Zero is not a shortcut for removal here.
    if data.quantity <= 0 {
        return Err(ApiError::InvalidQuantity);
    }
    let item_id = item_id.into_inner();

    let item = state
        .cart_items()
        .find_one(doc! { "_id": &item_id, "user_id": &user_id }, None)
        .await?
        .ok_or(ApiError::NotFound("cart item"))?;

    let product = state
        .products()
        .find_one(doc! { "_id": item.product_id }, None)
        .await?
        .ok_or(ApiError::NotFound("product"))?;

    // The ceiling is checked against the product's other variants only; this
    // item's old quantity is being replaced, not added to.
    let reservations =
        product_reservations(&state.cart_items(), &user_id, item.product_id).await?;
    let other_variants: i64 = reservations
        .iter()
        .filter(|other| other._id != item._id)
        .map(|other| other.quantity)
        .sum();

    check_ceiling(product.stock, other_variants, 0, data.quantity)?;

    state
        .cart_items()
        .update_one(
            doc! { "_id": &item_id, "user_id": &user_id },
            doc! { "$set": { "quantity": data.quantity } },
            None,
        )
        .await?;

    Ok(HttpResponse::Ok().json(json!({
        "message": "Quantity updated",
        "item_id": item_id,
        "quantity": data.quantity,
        "available_stock": product.stock - other_variants - data.quantity,
    })))
}

pub async fn remove_from_cart(
    state: web::Data<AppState>,
    item_id: web::Path<String>,
    req: HttpRequest,
) -> Result<HttpResponse, ApiError> {
    let user_id = caller_id(&req)?;
    // Ownership is enforced by the predicate, not a separate check.
    let filter = doc! { "_id": item_id.into_inner(), "user_id": &user_id };
    let result = state.cart_items().delete_one(filter, None).await?;
    if result.deleted_count == 1 {
        Ok(HttpResponse::Ok().json(json!({ "message": "Item removed from cart" })))
    } else {
        Err(ApiError::NotFound("cart item"))
    }
}

pub async fn get_cart(
    state: web::Data<AppState>,
    req: HttpRequest,
) -> Result<HttpResponse, ApiError> {
    let user_id = caller_id(&req)?;

    let mut cursor = state
        .cart_items()
        .find(doc! { "user_id": &user_id }, None)
        .await?;
    let mut items = Vec::new();
    while let Some(item) = cursor.next().await {
        items.push(item?);
    }

    // One product fetch per distinct id, and per-product reservation totals
    // so each line can report how many more units are still addable.
    let mut products: HashMap<i64, Product> = HashMap::new();
    let mut reserved: HashMap<i64, i64> = HashMap::new();
    for item in &items {
        *reserved.entry(item.product_id).or_insert(0) += item.quantity;
        if !products.contains_key(&item.product_id) {
            if let Some(product) = state
                .products()
                .find_one(doc! { "_id": item.product_id }, None)
                .await?
            {
                products.insert(item.product_id, product);
            }
        }
    }

    let mut lines = Vec::new();
    let mut cart_total = 0.0;
    for item in &items {
        let Some(product) = products.get(&item.product_id) else {
            // Product deleted since it was added; the line is unservable.
            log::warn!(
                "cart item {} references missing product {}",
                item._id,
                item.product_id
            );
            continue;
        };
        let other_variants = reserved[&item.product_id] - item.quantity;
        let unit_price = product.price * (1.0 - product.discount_percent / 100.0);
        cart_total += unit_price * item.quantity as f64;
        lines.push(json!({
            "item_id": item._id,
            "product_id": product._id,
            "name": product.name,
            "price": product.price,
            "discount_percent": product.discount_percent,
            "image": product.images.first(),
            "size": item.size,
            "color": item.color,
            "quantity": item.quantity,
            "stock": product.stock,
            "available_stock": addable(product.stock, other_variants, item.quantity),
        }));
    }

    Ok(HttpResponse::Ok().json(json!({ "items": lines, "total": cart_total })))
}

pub async fn clear_cart(
    state: web::Data<AppState>,
    req: HttpRequest,
) -> Result<HttpResponse, ApiError> {
    let user_id = caller_id(&req)?;
    let deleted = clear_for_user(&state.cart_items(), &user_id).await?;
    Ok(HttpResponse::Ok().json(json!({ "message": "Cart cleared", "removed": deleted })))
}

/// Shared with order commit, which empties the cart after the decrements.
pub async fn clear_for_user(
    cart_items: &Collection<CartItem>,
    user_id: &str,
) -> Result<u64, ApiError> {
    let result = cart_items
        .delete_many(doc! { "user_id": user_id }, None)
        .await?;
    Ok(result.deleted_count)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn add_up_to_stock_succeeds() {
        assert!(check_ceiling(5, 0, 0, 5).is_ok());
    }

    #[test]
    fn add_one_past_stock_reports_zero_addable() {
        match check_ceiling(5, 3, 2, 1) {
            Err(ApiError::StockExceeded { available }) => assert_eq!(available, 0),
            other => panic!("expected StockExceeded, got {other:?}"),
        }
    }

    #[test]
    fn zero_stock_is_out_of_stock_not_exceeded() {
        assert!(matches!(check_ceiling(0, 0, 0, 1), Err(ApiError::OutOfStock)));
        assert!(matches!(check_ceiling(-1, 0, 0, 1), Err(ApiError::OutOfStock)));
    }

    #[test]
    fn variants_share_one_ceiling() {
        // stock=5: first variant takes 3.
        assert!(check_ceiling(5, 0, 0, 3).is_ok());
        // Second variant asking for 3 must be rejected with 2 still addable.
        match check_ceiling(5, 3, 0, 3) {
            Err(ApiError::StockExceeded { available }) => assert_eq!(available, 2),
            other => panic!("expected StockExceeded, got {other:?}"),
        }
        // Asking for exactly the remainder fits.
        assert!(check_ceiling(5, 3, 0, 2).is_ok());
    }

    #[test]
    fn incrementing_an_existing_variant_counts_its_current_quantity() {
        // variant already holds 4 of 5; only 1 more fits.
        assert!(check_ceiling(5, 0, 4, 1).is_ok());
        match check_ceiling(5, 0, 4, 2) {
            Err(ApiError::StockExceeded { available }) => assert_eq!(available, 1),
            other => panic!("expected StockExceeded, got {other:?}"),
        }
    }

    #[test]
    fn addable_never_goes_negative() {
        // Stock shrank below existing reservations (another user bought).
        assert_eq!(addable(2, 3, 1), 0);
        assert_eq!(addable(10, 3, 1), 6);
    }

    #[test]
    fn no_mutation_sequence_breaks_the_invariant() {
        // Replay of adds/updates against a model cart; the ceiling check is
        // the only gate, so the summed reservations must never pass stock.
        let stock = 7;
        let mut variants: Vec<i64> = Vec::new();
        let attempts = [3, 5, 2, 2, 1, 4];
        for qty in attempts {
            let total: i64 = variants.iter().sum();
            if check_ceiling(stock, total, 0, qty).is_ok() {
                variants.push(qty);
            }
            assert!(variants.iter().sum::<i64>() <= stock);
        }
        // 3 ok (3), 5 rejected, 2 ok (5), 2 ok (7), 1 rejected, 4 rejected.
        assert_eq!(variants, vec![3, 2, 2]);
    }

    /// Minimal in-memory cart replaying the same upsert decision the
    /// handler makes: merge into the matching variant or insert a new row,
    /// gated by the ceiling check.
    fn model_add(
        cart: &mut Vec<CartItem>,
        stock: i64,
        size: Option<&str>,
        color: Option<&str>,
        qty: i64,
    ) -> Result<(), ApiError> {
        let size = size.map(String::from);
        let color = color.map(String::from);
        let (matching, other_variants) = split_variants(cart, &size, &color);
        let existing_match = matching.map_or(0, |item| item.quantity);
        check_ceiling(stock, other_variants, existing_match, qty)?;
        match matching.map(|item| item._id.clone()) {
            Some(id) => {
                cart.iter_mut().find(|item| item._id == id).unwrap().quantity += qty;
            }
            None => cart.push(CartItem {
                _id: format!("i{}", cart.len()),
                user_id: "u".into(),
                product_id: 1,
                size,
                color,
                quantity: qty,
            }),
        }
        Ok(())
    }

    #[test]
    fn cart_round_trip_reflects_adds_and_removals() {
        let stock = 5;
        let mut cart: Vec<CartItem> = Vec::new();

        // An add is reflected exactly on the next read.
        model_add(&mut cart, stock, Some("M"), Some("red"), 3).unwrap();
        assert_eq!(cart.len(), 1);
        assert_eq!(cart[0].quantity, 3);

        // Adding the same variant merges instead of duplicating the row.
        model_add(&mut cart, stock, Some("M"), Some("red"), 1).unwrap();
        assert_eq!(cart.len(), 1);
        assert_eq!(cart[0].quantity, 4);

        // A different variant is its own row under the shared ceiling.
        model_add(&mut cart, stock, Some("L"), Some("blue"), 1).unwrap();
        assert_eq!(cart.len(), 2);
        assert_eq!(cart.iter().map(|i| i.quantity).sum::<i64>(), 5);

        // Removal omits the item from the next read.
        let removed = cart[0]._id.clone();
        cart.retain(|item| item._id != removed);
        assert_eq!(cart.len(), 1);
        assert!(cart.iter().all(|item| item._id != removed));
    }

    #[test]
    fn split_variants_separates_match_from_the_rest() {
        let mut cart: Vec<CartItem> = Vec::new();
        model_add(&mut cart, 10, Some("M"), Some("red"), 3).unwrap();
        model_add(&mut cart, 10, Some("L"), Some("red"), 2).unwrap();
        model_add(&mut cart, 10, Some("L"), Some("blue"), 4).unwrap();

        let (matching, others) =
            split_variants(&cart, &Some("L".into()), &Some("red".into()));
        assert_eq!(matching.unwrap().quantity, 2);
        assert_eq!(others, 7);

        // No matching variant: everything counts as other.
        let (matching, others) = split_variants(&cart, &None, &None);
        assert!(matching.is_none());
        assert_eq!(others, 9);
    }

    #[test]
    fn variant_validation_checks_offered_sets() {
        let product = Product {
            _id: 1,
            user_id: "u".into(),
            name: "Tee".into(),
            description: None,
            category: "tops".into(),
            price: 10.0,
            discount_percent: 0.0,
            stock: 5,
            sold_count: 0,
            rating: 0.0,
            sizes: vec!["M".into(), "L".into()],
            colors: vec!["red".into()],
            images: vec![],
        };
        assert!(validate_variant(&product, &Some("M".into()), &Some("red".into())).is_ok());
        assert!(matches!(
            validate_variant(&product, &Some("XXL".into()), &None),
            Err(ApiError::InvalidVariant(_))
        ));
        assert!(matches!(
            validate_variant(&product, &None, &Some("blue".into())),
            Err(ApiError::InvalidVariant(_))
        ));
        // Variant-less products skip both checks.
        assert!(validate_variant(&product, &None, &None).is_ok());
    }
}
