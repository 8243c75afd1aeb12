//! imgstream - session-scoped JPEG relay.
//!
//! Clients bind a session to an upstream frame source, then read the frames
//! back as a `multipart/x-mixed-replace` stream. Unchanged frames are dropped
//! and sessions whose upstream disappears are deregistered.

pub mod api;
pub mod config;
pub mod db;
pub mod frame;
pub mod route;
pub mod stream;
