//! Frame handling: fetching from upstreams, change detection, and multipart framing.

mod cache;
pub mod multipart;
mod source;

pub use cache::{FrameCache, Fingerprint};
pub use source::{FetchError, FrameSource, HttpFrameSource};
