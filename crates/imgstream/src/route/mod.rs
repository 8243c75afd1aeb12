//! Route registry.
//!
//! Binds a session id to the upstream frame source it streams from. The
//! registry hides the upstream address from clients and hands it only to the
//! streaming loop.

mod error;
mod models;
mod registry;
mod store;

pub use error::{RouteError, RouteResult};
pub use models::{CreateRouteRequest, PublicRoute, Route};
pub use registry::{FEED_PATH, RouteRegistry};
pub use store::{MemoryRouteStore, RouteStore, SqliteRouteStore};
