pub mod auth;
pub mod error;
pub mod handlers;
pub mod middleware;
pub mod response;
pub mod routes;

pub use auth::{ApiKeyValidator, TokenClaims, TokenService};
pub use error::{ApiError, ApiResult};
pub use routes::{create_app, AppState};
