pub mod admin;
pub mod auth;
mod health;
mod util;

pub use health::{health_check, readiness_check};
