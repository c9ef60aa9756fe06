pub mod jwt_auth;
pub mod request_log;

pub use jwt_auth::{jwt_auth_middleware, AdminUser, AuthUser};
pub use request_log::request_log_middleware;
