//! Coupon creation, validity, and atomic usage accounting.

use actix_web::{web, HttpRequest, HttpResponse};
use chrono::{DateTime, Utc};
use mongodb::bson::doc;
use mongodb::Collection;
use serde_json::json;
use uuid::Uuid;

use crate::error::ApiError;
use crate::middleware::caller_id;
use crate::models::{Coupon, CouponInput};
use crate::state::AppState;

/// A coupon applies iff `now` falls in its window and it has uses left
/// (limit 0 means unlimited).
pub fn is_valid(coupon: &Coupon, now: DateTime<Utc>) -> bool {
    now >= coupon.start_date
        && now <= coupon.end_date
        && (coupon.usage_limit == 0 || coupon.usage_count < coupon.usage_limit)
}

/// Credit one use against the coupon. The remaining-uses condition lives in
/// the update filter, so two orders racing for the last use cannot both be
/// credited (same treatment as the stock decrement). Failures are logged,
/// never propagated: usage credit must not block an order.
pub async fn redeem(coupons: &Collection<Coupon>, code: &str) {
    let filter = doc! {
        "code": code,
        "$or": [
            { "usage_limit": 0 },
            { "$expr": { "$lt": ["$usage_count", "$usage_limit"] } },
        ],
    };
    match coupons
        .update_one(filter, doc! { "$inc": { "usage_count": 1 } }, None)
        .await
    {
        Ok(result) if result.modified_count == 1 => {}
        Ok(_) => log::warn!("coupon {code} missing or exhausted, usage not credited"),
        Err(e) => log::warn!("coupon usage update failed for {code}: {e}"),
    }
}

fn validate_input(data: &CouponInput) -> Result<(), ApiError> {
    if !(0.0..=100.0).contains(&data.discount_percent) {
        return Err(ApiError::InvalidInput(
            "discount must be between 0 and 100".into(),
        ));
    }
    if data.end_date <= data.start_date {
        return Err(ApiError::InvalidInput(
            "end date must be after start date".into(),
        ));
    }
    if data.usage_limit < 0 {
        return Err(ApiError::InvalidInput(
            "usage limit must be zero or positive".into(),
        ));
    }
    Ok(())
}

pub async fn create_coupon(
    state: web::Data<AppState>,
    data: web::Json<CouponInput>,
    req: HttpRequest,
) -> Result<HttpResponse, ApiError> {
    caller_id(&req)?;
    validate_input(&data)?;

    let existing = state
        .coupons()
        .find_one(doc! { "code": &data.code }, None)
        .await?;
    if existing.is_some() {
        return Err(ApiError::Conflict(format!(
            "coupon code {} already exists",
            data.code
        )));
    }

    let coupon = Coupon {
        _id: Uuid::new_v4().to_string(),
        code: data.code.clone(),
        discount_percent: data.discount_percent,
        start_date: data.start_date,
        end_date: data.end_date,
        usage_limit: data.usage_limit,
        usage_count: 0,
    };
    state.coupons().insert_one(&coupon, None).await?;
    Ok(HttpResponse::Created().json(coupon))
}

/// Lookup used by the client at checkout to price the discount before the
/// order is committed.
pub async fn validate_coupon(
    state: web::Data<AppState>,
    code: web::Path<String>,
    req: HttpRequest,
) -> Result<HttpResponse, ApiError> {
    caller_id(&req)?;
    let coupon = state
        .coupons()
        .find_one(doc! { "code": code.into_inner() }, None)
        .await?
        .ok_or(ApiError::NotFound("coupon"))?;

    Ok(HttpResponse::Ok().json(json!({
        "code": coupon.code,
        "discount_percent": coupon.discount_percent,
        "valid": is_valid(&coupon, Utc::now()),
    })))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn coupon(usage_limit: i64, usage_count: i64) -> Coupon {
        let now = Utc::now();
        Coupon {
            _id: "c1".into(),
            code: "SAVE10".into(),
            discount_percent: 10.0,
            start_date: now - Duration::days(1),
            end_date: now + Duration::days(1),
            usage_limit,
            usage_count,
        }
    }

    #[test]
    fn valid_inside_window_with_uses_left() {
        assert!(is_valid(&coupon(5, 4), Utc::now()));
    }

    #[test]
    fn zero_limit_means_unlimited() {
        assert!(is_valid(&coupon(0, 1_000_000), Utc::now()));
    }

    #[test]
    fn exhausted_limit_invalidates() {
        assert!(!is_valid(&coupon(5, 5), Utc::now()));
    }

    #[test]
    fn field_validation_reports_input_errors() {
        let mut input = CouponInput {
            code: "SAVE10".into(),
            discount_percent: 10.0,
            start_date: Utc::now(),
            end_date: Utc::now() + Duration::days(1),
            usage_limit: 0,
        };
        assert!(validate_input(&input).is_ok());

        input.discount_percent = 101.0;
        assert!(matches!(validate_input(&input), Err(ApiError::InvalidInput(_))));

        input.discount_percent = 10.0;
        input.end_date = input.start_date - Duration::days(1);
        assert!(matches!(validate_input(&input), Err(ApiError::InvalidInput(_))));

        input.end_date = input.start_date + Duration::days(1);
        input.usage_limit = -1;
        assert!(matches!(validate_input(&input), Err(ApiError::InvalidInput(_))));
    }

    #[test]
    fn outside_window_invalidates() {
        let c = coupon(0, 0);
        assert!(!is_valid(&c, c.start_date - Duration::seconds(1)));
        assert!(!is_valid(&c, c.end_date + Duration::seconds(1)));
        // Window bounds are inclusive.
        assert!(is_valid(&c, c.start_date));
        assert!(is_valid(&c, c.end_date));
    }
}
