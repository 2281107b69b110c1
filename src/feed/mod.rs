pub mod cache;
pub mod client;
pub mod connection;
pub mod exchange;
pub mod handle;
pub mod info;
pub mod pipeline;
pub mod rate_budget;
pub mod registry;
pub mod relay;
pub mod router;
pub mod topic;
pub mod types;
