pub mod account;
pub mod auth;
pub mod rate_limit;
pub mod session;
pub mod token;
