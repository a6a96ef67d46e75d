pub mod approval;
pub mod auth;
pub mod email;
pub mod service_util;
pub mod token;
