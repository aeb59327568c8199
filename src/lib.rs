pub mod adapters;
pub mod app;
pub mod config;
pub mod cors;
pub mod error;
pub mod handlers;
pub mod headers;
pub mod proxy;
pub mod rate_limit;
pub mod router;
pub mod shutdown;
