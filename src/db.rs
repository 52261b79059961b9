use mongodb::bson::doc;
use mongodb::options::{ClientOptions, FindOneAndUpdateOptions, ReturnDocument};
use mongodb::{Client, Collection, Database};
use std::env;

use crate::models::Counter;

pub async fn connect() -> Database {
    let database_url = env::var("DATABASE_URL").expect("DATABASE_URL must be set");

    let client_options = ClientOptions::parse(&database_url)
        .await
        .expect("Failed to parse MongoDB connection string");

    let client = Client::with_options(client_options).expect("Failed to initialize MongoDB client");

    client.database("storefront")
}

/// Atomically bump and return the next value of a named sequence, creating
/// the counter document on first use.
pub async fn next_id(
    counters: &Collection<Counter>,
    seq_name: &str,
) -> Result<i64, mongodb::error::Error> {
    let filter = doc! { "_id": seq_name };
    let update = doc! { "$inc": { "seq": 1 } };

    let options = FindOneAndUpdateOptions::builder()
        .upsert(true)
        .return_document(ReturnDocument::After)
        .build();

    let result = counters.find_one_and_update(filter, update, options).await?;

    if let Some(counter) = result {
        Ok(counter.seq)
    } else {
        Err(mongodb::error::Error::custom(
            "Failed to generate sequence value",
        ))
    }
}
