//! Streaming sessions.
//!
//! [`StreamRelay`] owns what every feed connection shares (registry, frame
//! cache, upstream source) and spawns one [`SessionLoop`] per connection.

mod session;

pub use session::{
    LoopState, PartResult, SessionLoop, SkipReason, Step, StreamSettings, StreamSummary,
    TerminateReason,
};

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, info_span};

use crate::frame::{FrameCache, FrameSource};
use crate::route::RouteRegistry;

/// Spawns and tracks streaming sessions.
pub struct StreamRelay {
    registry: RouteRegistry,
    cache: Arc<FrameCache>,
    source: Arc<dyn FrameSource>,
    settings: StreamSettings,
    shutdown: CancellationToken,
    active: Arc<AtomicUsize>,
}

impl StreamRelay {
    pub fn new(
        registry: RouteRegistry,
        source: Arc<dyn FrameSource>,
        settings: StreamSettings,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            registry,
            cache: Arc::new(FrameCache::new()),
            source,
            settings,
            shutdown,
            active: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Start a session loop for `session_id` and return the stream of encoded parts.
    ///
    /// The loop ends when the returned stream is dropped, the route goes away,
    /// the upstream becomes unreachable, or the relay shuts down.
    pub fn open(&self, session_id: &str) -> ReceiverStream<PartResult> {
        let (tx, rx) = mpsc::channel(self.settings.channel_capacity);
        let session = SessionLoop::new(
            session_id,
            self.registry.clone(),
            Arc::clone(&self.cache),
            Arc::clone(&self.source),
        );

        let settings = self.settings;
        let shutdown = self.shutdown.clone();
        let active = Arc::clone(&self.active);
        let span = info_span!("stream", session_id = %session_id);

        active.fetch_add(1, Ordering::SeqCst);
        tokio::spawn(
            async move {
                debug!("Stream opened");
                session.run(tx, settings, shutdown).await;
                active.fetch_sub(1, Ordering::SeqCst);
            }
            .instrument(span),
        );

        ReceiverStream::new(rx)
    }

    /// Number of session loops currently running.
    pub fn active_streams(&self) -> usize {
        self.active.load(Ordering::SeqCst)
    }

    pub fn cache(&self) -> &FrameCache {
        &self.cache
    }

    pub fn registry(&self) -> &RouteRegistry {
        &self.registry
    }
}
