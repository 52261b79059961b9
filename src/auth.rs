//! Account handlers: signup, signin, profile management. The rest of the
//! API trusts the user id the JWT middleware puts into request extensions.

use actix_web::{web, HttpRequest, HttpResponse};
use argon2::{self, Config as ArgonConfig};
use jsonwebtoken::{encode, EncodingKey, Header};
use mongodb::bson::doc;
use rand::Rng;
use serde_json::json;
use std::env;
use uuid::Uuid;

use crate::error::ApiError;
use crate::middleware::caller_id;
use crate::models::{AuthResponse, Claims, SignInInput, SignUpInput, User};
use crate::state::AppState;

fn hash_password(password: &str) -> Result<String, ApiError> {
    let salt: [u8; 16] = rand::thread_rng().gen();
    argon2::hash_encoded(password.as_bytes(), &salt, &ArgonConfig::default()).map_err(|e| {
        log::error!("password hashing failed: {e}");
        ApiError::Internal
    })
}

pub async fn sign_up(
    state: web::Data<AppState>,
    data: web::Json<SignUpInput>,
) -> Result<HttpResponse, ApiError> {
    let existing = state
        .users()
        .find_one(doc! { "email": &data.email }, None)
        .await?;
    if existing.is_some() {
        return Err(ApiError::Conflict("email already registered".into()));
    }

    let user = User {
        id: Uuid::new_v4().to_string(),
        name: data.name.clone(),
        email: data.email.clone(),
        password: hash_password(&data.password)?,
    };
    state.users().insert_one(&user, None).await?;

    Ok(HttpResponse::Created().json(json!({
        "id": user.id,
        "name": user.name,
        "email": user.email,
    })))
}

pub async fn sign_in(
    state: web::Data<AppState>,
    data: web::Json<SignInInput>,
) -> Result<HttpResponse, ApiError> {
    let user = state
        .users()
        .find_one(doc! { "email": &data.email }, None)
        .await?
        .ok_or(ApiError::Unauthorized)?;

    if !argon2::verify_encoded(&user.password, data.password.as_bytes()).unwrap_or(false) {
        return Err(ApiError::Unauthorized);
    }

    let expiration = chrono::Utc::now()
        .checked_add_signed(chrono::Duration::hours(1))
        .map(|t| t.timestamp() as usize)
        .ok_or(ApiError::Internal)?;
    let claims = Claims {
        sub: user.id.clone(),
        exp: expiration,
    };

    let secret = env::var("JWT_SECRET").map_err(|_| {
        log::error!("JWT_SECRET is not set");
        ApiError::Internal
    })?;
    let token = encode(
        &Header::default(),
        &claims,
        &EncodingKey::from_secret(secret.as_ref()),
    )
    .map_err(|e| {
        log::error!("failed to encode token: {e}");
        ApiError::Internal
    })?;

    Ok(HttpResponse::Ok().json(AuthResponse { token }))
}

pub async fn get_profile(
    state: web::Data<AppState>,
    req: HttpRequest,
) -> Result<HttpResponse, ApiError> {
    let user_id = caller_id(&req)?;
    let user = state
        .users()
        .find_one(doc! { "id": &user_id }, None)
        .await?
        .ok_or(ApiError::NotFound("user"))?;

    Ok(HttpResponse::Ok().json(json!({
        "id": user.id,
        "name": user.name,
        "email": user.email,
    })))
}

pub async fn update_profile(
    state: web::Data<AppState>,
    data: web::Json<SignUpInput>,
    req: HttpRequest,
) -> Result<HttpResponse, ApiError> {
    let user_id = caller_id(&req)?;
    let update = doc! { "$set": {
        "name": &data.name,
        "password": hash_password(&data.password)?,
    }};
    let result = state
        .users()
        .find_one_and_update(doc! { "id": &user_id }, update, None)
        .await?;
    match result {
        Some(_) => Ok(HttpResponse::Ok().json(json!({ "message": "Profile updated" }))),
        None => Err(ApiError::NotFound("user")),
    }
}

pub async fn delete_profile(
    state: web::Data<AppState>,
    req: HttpRequest,
) -> Result<HttpResponse, ApiError> {
    let user_id = caller_id(&req)?;
    let result = state.users().delete_one(doc! { "id": &user_id }, None).await?;
    if result.deleted_count == 1 {
        // Their reservations go with them.
        let _ = state
            .cart_items()
            .delete_many(doc! { "user_id": &user_id }, None)
            .await;
        Ok(HttpResponse::Ok().json(json!({ "message": "Profile deleted" })))
    } else {
        Err(ApiError::NotFound("user"))
    }
}
