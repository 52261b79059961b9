use mongodb::{Collection, Database};

use crate::cache::Cache;
use crate::models::{CartItem, Counter, Coupon, Order, Product, User};

/// Shared application state: the database handle plus the (possibly
/// disabled) response cache. Cloned into every worker by actix.
pub struct AppState {
    db: Database,
    pub cache: Cache,
}

impl AppState {
    pub fn new(db: Database, cache: Cache) -> Self {
        Self { db, cache }
    }

    pub fn users(&self) -> Collection<User> {
        self.db.collection("users")
    }

    pub fn products(&self) -> Collection<Product> {
        self.db.collection("products")
    }

    pub fn cart_items(&self) -> Collection<CartItem> {
        self.db.collection("cart_items")
    }

    pub fn orders(&self) -> Collection<Order> {
        self.db.collection("orders")
    }

    pub fn coupons(&self) -> Collection<Coupon> {
        self.db.collection("coupons")
    }

    pub fn counters(&self) -> Collection<Counter> {
        self.db.collection("counters")
    }
}
