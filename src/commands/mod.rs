pub mod feed_stats;
pub mod health;
pub mod market_info;
