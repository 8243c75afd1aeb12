//! HTTP API layer.

mod error;
mod handlers;
mod routes;
mod session_id;
mod state;

pub use error::{ApiError, ApiResult, ErrorResponse};
pub use routes::create_router;
pub use session_id::SessionId;
pub use state::AppState;
