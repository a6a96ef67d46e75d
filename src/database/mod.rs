pub mod account;
pub mod postgres_repository;
pub mod rate_limit;
pub mod session;
