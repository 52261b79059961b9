//! Catalog reads (cached) and owner-scoped product writes (invalidating).

use actix_web::{web, HttpRequest, HttpResponse};
use futures::stream::StreamExt;
use mongodb::bson::{doc, Document};
use mongodb::options::FindOptions;
use serde_json::json;
use std::collections::BTreeMap;

use crate::cache::{self, PRODUCTS_PATTERN};
use crate::db;
use crate::error::ApiError;
use crate::middleware::caller_id;
use crate::models::{ListQuery, Product, ProductInput};
use crate::state::AppState;

const DEFAULT_LIMIT: i64 = 20;
const MAX_LIMIT: i64 = 100;

const SORTS: &[&str] = &["newest", "price_asc", "price_desc", "rating"];

/// Clamp and default the raw query so that equivalent requests produce the
/// same cache key and the same database query.
pub fn normalize(query: &ListQuery) -> BTreeMap<&'static str, String> {
    let mut params = BTreeMap::new();
    if let Some(category) = &query.category {
        if !category.is_empty() {
            params.insert("category", category.clone());
        }
    }
    let sort = match query.sort.as_deref() {
        Some(s) if SORTS.contains(&s) => s,
        _ => "newest",
    };
    params.insert("sort", sort.to_string());
    params.insert("page", query.page.unwrap_or(1).max(1).to_string());
    params.insert(
        "limit",
        query
            .limit
            .unwrap_or(DEFAULT_LIMIT)
            .clamp(1, MAX_LIMIT)
            .to_string(),
    );
    params
}

fn sort_doc(sort: &str) -> Document {
    match sort {
        "price_asc" => doc! { "price": 1 },
        "price_desc" => doc! { "price": -1 },
        "rating" => doc! { "rating": -1 },
        _ => doc! { "_id": -1 },
    }
}

/// Serialization of a fetched product cannot be allowed to degrade into a
/// cacheable null payload; a failure here is a 500, not a 200.
fn product_payload(product: &Product) -> Result<serde_json::Value, ApiError> {
    serde_json::to_value(product).map_err(|e| {
        log::error!("failed to serialize product {}: {e}", product._id);
        ApiError::Internal
    })
}

fn annotated(outcome: cache::CacheOutcome) -> HttpResponse {
    let source = if outcome.hit { "HIT" } else { "MISS" };
    HttpResponse::Ok()
        .insert_header(("X-Cache", source))
        .json(outcome.payload)
}

pub async fn list_products(
    state: web::Data<AppState>,
    query: web::Query<ListQuery>,
) -> Result<HttpResponse, ApiError> {
    let params = normalize(&query);
    let key = cache::list_key(&params);

    let outcome = cache::with_cache(&state.cache, &key, cache::LIST_TTL, || async {
        let mut filter = doc! {};
        if let Some(category) = params.get("category") {
            filter.insert("category", category.as_str());
        }
        let page: u64 = params["page"].parse().unwrap_or(1);
        let limit: i64 = params["limit"].parse().unwrap_or(DEFAULT_LIMIT);

        let options = FindOptions::builder()
            .sort(sort_doc(&params["sort"]))
            .skip((page - 1) * limit as u64)
            .limit(limit)
            .build();

        let total = state.products().count_documents(filter.clone(), None).await?;
        let mut cursor = state.products().find(filter, options).await?;
        let mut products: Vec<Product> = Vec::new();
        while let Some(product) = cursor.next().await {
            products.push(product?);
        }

        Ok(json!({
            "products": products,
            "total": total,
            "page": page,
            "limit": limit,
        }))
    })
    .await?;

    Ok(annotated(outcome))
}

pub async fn get_product(
    state: web::Data<AppState>,
    product_id: web::Path<i64>,
) -> Result<HttpResponse, ApiError> {
    let product_id = product_id.into_inner();
    let key = cache::detail_key(product_id);

    let outcome = cache::with_cache(&state.cache, &key, cache::DETAIL_TTL, || async {
        let product = state
            .products()
            .find_one(doc! { "_id": product_id }, None)
            .await?
            .ok_or(ApiError::NotFound("product"))?;
        product_payload(&product)
    })
    .await?;

    Ok(annotated(outcome))
}

pub async fn add_product(
    state: web::Data<AppState>,
    data: web::Json<ProductInput>,
    req: HttpRequest,
) -> Result<HttpResponse, ApiError> {
    let user_id = caller_id(&req)?;
    if data.stock < 0 {
        return Err(ApiError::InvalidQuantity);
    }

    let next_id = db::next_id(&state.counters(), "Product").await?;
    let product = Product {
        _id: next_id,
        user_id,
        name: data.name.clone(),
        description: data.description.clone(),
        category: data.category.clone(),
        price: data.price,
        discount_percent: data.discount_percent,
        stock: data.stock,
        sold_count: 0,
        rating: 0.0,
        sizes: data.sizes.clone(),
        colors: data.colors.clone(),
        images: data.images.clone(),
    };
    state.products().insert_one(&product, None).await?;

    state.cache.invalidate(PRODUCTS_PATTERN).await;
    Ok(HttpResponse::Created().json(product))
}

pub async fn update_product(
    state: web::Data<AppState>,
    product_id: web::Path<i64>,
    data: web::Json<ProductInput>,
    req: HttpRequest,
) -> Result<HttpResponse, ApiError> {
    let user_id = caller_id(&req)?;
    if data.stock < 0 {
        return Err(ApiError::InvalidQuantity);
    }

    let filter = doc! { "_id": product_id.into_inner(), "user_id": &user_id };
    let update = doc! { "$set": {
        "name": &data.name,
        "description": data.description.clone(),
        "category": &data.category,
        "price": data.price,
        "discount_percent": data.discount_percent,
        "stock": data.stock,
        "sizes": data.sizes.clone(),
        "colors": data.colors.clone(),
        "images": data.images.clone(),
    }};
    let result = state.products().update_one(filter, update, None).await?;
    if result.matched_count == 0 {
        return Err(ApiError::NotFound("product"));
    }

    state.cache.invalidate(PRODUCTS_PATTERN).await;
    Ok(HttpResponse::Ok().json(json!({ "message": "Product updated" })))
}

pub async fn delete_product(
    state: web::Data<AppState>,
    product_id: web::Path<i64>,
    req: HttpRequest,
) -> Result<HttpResponse, ApiError> {
    let user_id = caller_id(&req)?;
    let filter = doc! { "_id": product_id.into_inner(), "user_id": &user_id };
    let result = state.products().delete_one(filter, None).await?;
    if result.deleted_count == 0 {
        return Err(ApiError::NotFound("product"));
    }

    state.cache.invalidate(PRODUCTS_PATTERN).await;
    Ok(HttpResponse::Ok().json(json!({ "message": "Product deleted" })))
}

#[derive(serde::Deserialize)]
pub struct InvalidateQuery {
    #[serde(default)]
    pub all: bool,
}

/// The exposed coarse invalidation operation (admin / ops escape hatch).
/// `?all=true` flushes the whole cache instead of just the catalog keys.
pub async fn invalidate_products(
    state: web::Data<AppState>,
    query: web::Query<InvalidateQuery>,
    req: HttpRequest,
) -> Result<HttpResponse, ApiError> {
    caller_id(&req)?;
    if query.all {
        state.cache.clear().await;
    } else {
        state.cache.invalidate(PRODUCTS_PATTERN).await;
    }
    Ok(HttpResponse::Ok().json(json!({ "message": "Catalog cache invalidated" })))
}
