//! Historical market prices.

pub mod fetcher;
pub mod models;

pub use fetcher::{fetch_prices, PgPriceSource};
pub use models::Price;
