//! HTTP API: routes, handlers, shared state, and error responses.

mod auth;
mod error;
mod handlers;
mod routes;
mod state;

pub use auth::{CurrentUser, bearer_from_headers};
pub use error::{ApiError, ApiResult};
pub use handlers::ProvisionedSession;
pub use routes::create_router;
pub use state::{AppState, RelayConfig};
