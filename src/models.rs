use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Serialize, Deserialize)]
pub struct User {
    pub id: String,
    pub name: String,
    pub email: String,
    pub password: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct SignUpInput {
    pub name: String,
    pub email: String,
    pub password: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct SignInInput {
    pub email: String,
    pub password: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct Claims {
    pub sub: String, // Subject (user ID)
    pub exp: usize,  // Expiration time as UTC timestamp
}

#[derive(Serialize)]
pub struct AuthResponse {
    pub token: String,
}

/// Sequence document backing monotonically increasing product ids.
#[derive(Serialize, Deserialize, Debug)]
pub struct Counter {
    pub _id: String,
    pub seq: i64,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct Product {
    pub _id: i64,
    pub user_id: String,
    pub name: String,
    pub description: Option<String>,
    pub category: String,
    pub price: f64,
    #[serde(default)]
    pub discount_percent: f64,
    /// Authoritative available units. Never goes negative: every decrement
    /// is a conditional update that checks remaining stock in the same
    /// statement.
    #[serde(default)]
    pub stock: i64,
    #[serde(default)]
    pub sold_count: i64,
    #[serde(default)]
    pub rating: f64,
    #[serde(default)]
    pub sizes: Vec<String>,
    #[serde(default)]
    pub colors: Vec<String>,
    #[serde(default)]
    pub images: Vec<String>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ProductInput {
    pub name: String,
    pub description: Option<String>,
    pub category: String,
    pub price: f64,
    #[serde(default)]
    pub discount_percent: f64,
    #[serde(default)]
    pub stock: i64,
    #[serde(default)]
    pub sizes: Vec<String>,
    #[serde(default)]
    pub colors: Vec<String>,
    #[serde(default)]
    pub images: Vec<String>,
}

/// One variant reservation: the same product may appear several times in a
/// cart under different size/color combinations. The quantity is a soft
/// reservation, checked against stock on every mutation but only committed
/// (decremented) at order time.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct CartItem {
    pub _id: String,
    pub user_id: String,
    pub product_id: i64,
    pub size: Option<String>,
    pub color: Option<String>,
    pub quantity: i64,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct AddToCartInput {
    pub product_id: i64,
    pub size: Option<String>,
    pub color: Option<String>,
    pub quantity: i64,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct UpdateQuantityInput {
    pub quantity: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OrderStatus {
    Pending,
    Processing,
    Shipped,
    Delivered,
    Canceled,
}

impl OrderStatus {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "PENDING" => Some(Self::Pending),
            "PROCESSING" => Some(Self::Processing),
            "SHIPPED" => Some(Self::Shipped),
            "DELIVERED" => Some(Self::Delivered),
            "CANCELED" => Some(Self::Canceled),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "PENDING",
            Self::Processing => "PROCESSING",
            Self::Shipped => "SHIPPED",
            Self::Delivered => "DELIVERED",
            Self::Canceled => "CANCELED",
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Delivered | Self::Canceled)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PaymentStatus {
    Pending,
    Success,
    Failed,
}

impl PaymentStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "PENDING",
            Self::Success => "SUCCESS",
            Self::Failed => "FAILED",
        }
    }
}

/// Line item frozen at order time. Product fields are copied, not
/// referenced, so later catalog edits never rewrite past orders.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct OrderItem {
    pub product_id: i64,
    pub name: String,
    pub category: String,
    pub price: f64,
    pub discount_percent: f64,
    pub size: Option<String>,
    pub color: Option<String>,
    pub quantity: i64,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct Order {
    pub _id: String,
    pub user_id: String,
    pub address_id: String,
    pub payment_method: String,
    pub coupon_code: Option<String>,
    pub total: f64,
    pub status: OrderStatus,
    pub payment_status: PaymentStatus,
    pub payment_id: Option<String>,
    pub created_at: DateTime<Utc>,
    pub items: Vec<OrderItem>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct CreateOrderInput {
    pub address_id: String,
    pub payment_method: String,
    pub coupon_code: Option<String>,
    pub payment_intent_id: Option<String>,
    pub total: f64,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct UpdateStatusInput {
    pub status: String,
}

/// Payment gateway webhook payload, already verified upstream.
#[derive(Debug, Serialize, Deserialize)]
pub struct PaymentWebhookInput {
    pub payment_id: String,
    pub succeeded: bool,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct Coupon {
    pub _id: String,
    pub code: String,
    pub discount_percent: f64,
    pub start_date: DateTime<Utc>,
    pub end_date: DateTime<Utc>,
    /// 0 means unlimited.
    pub usage_limit: i64,
    pub usage_count: i64,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct CouponInput {
    pub code: String,
    pub discount_percent: f64,
    pub start_date: DateTime<Utc>,
    pub end_date: DateTime<Utc>,
    #[serde(default)]
    pub usage_limit: i64,
}

#[derive(Debug, Deserialize)]
pub struct ListQuery {
    pub category: Option<String>,
    pub sort: Option<String>,
    pub page: Option<u64>,
    pub limit: Option<i64>,
}
