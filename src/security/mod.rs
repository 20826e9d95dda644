pub mod audit_log;
pub mod auth;
pub mod circuit_breaker;
pub mod rate_limit;
pub mod token_manager;
pub mod token_refresh;
