use actix_web::{http::StatusCode, HttpResponse, ResponseError};
use serde_json::json;
use thiserror::Error;

/// Expected, recoverable failures surfaced to API callers as typed
/// responses. Database errors are the only opaque variant; their details go
/// to the log, never to the client.
#[derive(Debug, Error)]
pub enum ApiError {
    #[error("{0} not found")]
    NotFound(&'static str),

    /// Requested size/color is not offered by the product.
    #[error("{0}")]
    InvalidVariant(String),

    /// A request field failed validation (bad range, inverted dates, ...).
    #[error("{0}")]
    InvalidInput(String),

    /// The requested quantity, combined with the caller's existing cart
    /// reservations for the product, exceeds current stock. Carries how many
    /// units could still be added so the client can re-prompt precisely.
    #[error("requested quantity exceeds available stock")]
    StockExceeded { available: i64 },

    /// Stock decrement at order commit found fewer units than the order
    /// needs. Names the product so a multi-line order failure is actionable.
    #[error("insufficient stock for {product}")]
    InsufficientStock { product: String, available: i64 },

    #[error("product is out of stock")]
    OutOfStock,

    #[error("cart is empty")]
    EmptyCart,

    #[error("quantity must be greater than zero")]
    InvalidQuantity,

    #[error("invalid status: {0}")]
    InvalidStatus(String),

    #[error("{0}")]
    Conflict(String),

    #[error("login required")]
    Unauthorized,

    #[error("internal server error")]
    Internal,

    #[error("internal server error")]
    Database(#[from] mongodb::error::Error),
}

impl ResponseError for ApiError {
    fn status_code(&self) -> StatusCode {
        match self {
            Self::NotFound(_) => StatusCode::NOT_FOUND,
            Self::InvalidVariant(_)
            | Self::InvalidInput(_)
            | Self::EmptyCart
            | Self::InvalidQuantity
            | Self::InvalidStatus(_) => StatusCode::BAD_REQUEST,
            Self::StockExceeded { .. }
            | Self::InsufficientStock { .. }
            | Self::OutOfStock
            | Self::Conflict(_) => StatusCode::CONFLICT,
            Self::Unauthorized => StatusCode::UNAUTHORIZED,
            Self::Internal | Self::Database(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn error_response(&self) -> HttpResponse {
        let body = match self {
            Self::StockExceeded { available } => {
                json!({ "error": self.to_string(), "available": available })
            }
            Self::InsufficientStock { available, .. } => {
                json!({ "error": self.to_string(), "available": available })
            }
            Self::OutOfStock => json!({ "error": self.to_string(), "available": 0 }),
            Self::Database(e) => {
                log::error!("database error: {e}");
                json!({ "error": self.to_string() })
            }
            _ => json!({ "error": self.to_string() }),
        };
        HttpResponse::build(self.status_code()).json(body)
    }
}
