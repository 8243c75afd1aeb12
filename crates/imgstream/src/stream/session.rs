//! Per-connection streaming loop.
//!
//! One [`SessionLoop`] runs for each open feed connection. Every tick it
//! checks the route, pulls a frame, drops it if unchanged, and otherwise
//! hands it to the client. Each tick's decision is returned as a [`Step`].

use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tokio::sync::mpsc;
use tokio::time::{MissedTickBehavior, timeout};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::StreamConfig;
use crate::frame::{FetchError, Fingerprint, FrameCache, FrameSource, multipart};
use crate::route::{RouteError, RouteRegistry};

/// Loop state between ticks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopState {
    /// Route exists; frames are fetched and evaluated.
    Active,
    /// Last fetch produced no usable frame. Retried next tick.
    SuspendedSkip,
    /// No further frames will be emitted.
    Terminating,
}

/// Why a tick emitted nothing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    /// Frame matches the last one emitted.
    Unchanged,
    /// Fetch timed out or the upstream answered with something unusable.
    TransientFailure,
}

/// Why a loop ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TerminateReason {
    /// The session had no route when the loop started.
    NoRoute,
    /// The route was deleted while streaming.
    RouteRemoved,
    /// The upstream could not be reached; the route was deregistered.
    UpstreamUnreachable,
    /// The client went away or stopped reading.
    ClientDisconnected,
    /// The process is shutting down.
    Shutdown,
}

impl TerminateReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::NoRoute => "no_route",
            Self::RouteRemoved => "route_removed",
            Self::UpstreamUnreachable => "upstream_unreachable",
            Self::ClientDisconnected => "client_disconnected",
            Self::Shutdown => "shutdown",
        }
    }
}

/// Outcome of one tick.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Step {
    /// A new frame to send to the client.
    Emit(Bytes),
    Skip(SkipReason),
    Terminate(TerminateReason),
}

/// Summary logged when a loop ends.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StreamSummary {
    pub reason: TerminateReason,
    pub ticks: u64,
    pub frames_emitted: u64,
}

/// Timing for a loop and its client channel.
#[derive(Debug, Clone, Copy)]
pub struct StreamSettings {
    pub tick_interval: Duration,
    pub write_timeout: Duration,
    pub channel_capacity: usize,
}

impl StreamSettings {
    pub fn from_config(config: &StreamConfig) -> Self {
        Self {
            tick_interval: config.tick_interval(),
            write_timeout: config.write_timeout(),
            channel_capacity: config.channel_capacity.max(1),
        }
    }
}

impl Default for StreamSettings {
    fn default() -> Self {
        Self::from_config(&StreamConfig::default())
    }
}

/// Item type of a feed body.
pub type PartResult = Result<Bytes, Infallible>;

/// Streaming state machine for one session and one client.
pub struct SessionLoop {
    session_id: String,
    registry: RouteRegistry,
    cache: Arc<FrameCache>,
    source: Arc<dyn FrameSource>,
    state: LoopState,
    ended: Option<TerminateReason>,
    ticks: u64,
    frames_emitted: u64,
}

impl SessionLoop {
    /// Create a loop for `session_id`.
    ///
    /// The session's cached fingerprint is reset so a newly connected client
    /// always receives the current frame first.
    ///
    /// The entry is keyed by session, not connection. If another loop for the
    /// same session emits a frame between this reset and this loop's first
    /// fetch, an identical first frame here is suppressed until the scene
    /// changes.
    pub fn new(
        session_id: impl Into<String>,
        registry: RouteRegistry,
        cache: Arc<FrameCache>,
        source: Arc<dyn FrameSource>,
    ) -> Self {
        let session_id = session_id.into();
        cache.remove(&session_id);

        Self {
            session_id,
            registry,
            cache,
            source,
            state: LoopState::Active,
            ended: None,
            ticks: 0,
            frames_emitted: 0,
        }
    }

    pub fn state(&self) -> LoopState {
        self.state
    }

    /// Run one tick of the state machine.
    ///
    /// Once terminated, every further call returns the same `Terminate` step
    /// without touching the registry or the upstream.
    pub async fn step(&mut self) -> Step {
        if let Some(reason) = self.ended {
            return Step::Terminate(reason);
        }

        let first_tick = self.ticks == 0;
        self.ticks += 1;

        let upstream = match self.registry.lookup_target(&self.session_id).await {
            Ok(uri) => uri,
            Err(RouteError::NotFound(_)) => {
                let reason = if first_tick {
                    TerminateReason::NoRoute
                } else {
                    TerminateReason::RouteRemoved
                };
                self.cache.remove(&self.session_id);
                return self.terminate(reason);
            }
            Err(err) => {
                warn!(session_id = %self.session_id, "Route lookup failed: {}", err);
                self.state = LoopState::SuspendedSkip;
                return Step::Skip(SkipReason::TransientFailure);
            }
        };

        match self.source.fetch(&upstream).await {
            Ok(frame) => self.consider(frame),
            Err(FetchError::Transient(msg)) => {
                debug!(session_id = %self.session_id, "Skipping frame: {}", msg);
                self.state = LoopState::SuspendedSkip;
                Step::Skip(SkipReason::TransientFailure)
            }
            Err(FetchError::Unreachable(msg)) => {
                warn!(
                    session_id = %self.session_id,
                    upstream = %upstream,
                    "Upstream unreachable, closing stream: {}",
                    msg
                );
                if let Err(err) = self
                    .registry
                    .delete_if_target(&self.session_id, &upstream)
                    .await
                {
                    warn!(session_id = %self.session_id, "Failed to deregister route: {}", err);
                }
                self.cache.remove(&self.session_id);
                self.terminate(TerminateReason::UpstreamUnreachable)
            }
        }
    }

    /// Drive the loop at the configured pace, sending parts into `tx`.
    ///
    /// Returns once the loop terminates. Client disconnection and `shutdown`
    /// are observed at every tick boundary, before any fetch is issued.
    pub async fn run(
        mut self,
        tx: mpsc::Sender<PartResult>,
        settings: StreamSettings,
        shutdown: CancellationToken,
    ) -> StreamSummary {
        let mut interval = tokio::time::interval(settings.tick_interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let reason = loop {
            tokio::select! {
                biased;
                _ = shutdown.cancelled() => break TerminateReason::Shutdown,
                _ = tx.closed() => break TerminateReason::ClientDisconnected,
                _ = interval.tick() => {}
            }

            match self.step().await {
                Step::Emit(frame) => {
                    let part = multipart::encode_part(&frame);
                    match timeout(settings.write_timeout, tx.send(Ok(part))).await {
                        Ok(Ok(())) => self.frames_emitted += 1,
                        Ok(Err(_)) => break TerminateReason::ClientDisconnected,
                        Err(_) => {
                            warn!(
                                session_id = %self.session_id,
                                "Client did not accept a frame within {:?}",
                                settings.write_timeout
                            );
                            break TerminateReason::ClientDisconnected;
                        }
                    }
                }
                Step::Skip(_) => {}
                Step::Terminate(reason) => break reason,
            }
        };

        self.terminate(reason);
        let summary = self.summary(reason);
        info!(
            session_id = %self.session_id,
            reason = reason.as_str(),
            ticks = summary.ticks,
            frames = summary.frames_emitted,
            "Stream ended"
        );
        summary
    }

    fn consider(&mut self, frame: Bytes) -> Step {
        self.state = LoopState::Active;
        let fingerprint = Fingerprint::of(&frame);

        if self.cache.get(&self.session_id) == Some(fingerprint) {
            return Step::Skip(SkipReason::Unchanged);
        }

        self.cache.set(&self.session_id, fingerprint);
        Step::Emit(frame)
    }

    fn terminate(&mut self, reason: TerminateReason) -> Step {
        self.state = LoopState::Terminating;
        self.ended.get_or_insert(reason);
        Step::Terminate(reason)
    }

    fn summary(&self, reason: TerminateReason) -> StreamSummary {
        StreamSummary {
            reason,
            ticks: self.ticks,
            frames_emitted: self.frames_emitted,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use async_trait::async_trait;

    const BASE: &str = "http://localhost:8385/image-streaming-service/v1";

    /// Frame source replaying a fixed script, then repeating its fallback.
    struct ScriptedSource {
        script: Mutex<VecDeque<Result<Bytes, FetchError>>>,
        fallback: Result<Bytes, FetchError>,
        fetches: AtomicUsize,
    }

    impl ScriptedSource {
        fn new(script: Vec<Result<Bytes, FetchError>>) -> Self {
            Self {
                script: Mutex::new(script.into()),
                fallback: Err(FetchError::Transient("script exhausted".to_string())),
                fetches: AtomicUsize::new(0),
            }
        }

        fn repeating(frame: &'static [u8]) -> Self {
            Self {
                script: Mutex::new(VecDeque::new()),
                fallback: Ok(Bytes::from_static(frame)),
                fetches: AtomicUsize::new(0),
            }
        }

        fn fetches(&self) -> usize {
            self.fetches.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl FrameSource for ScriptedSource {
        async fn fetch(&self, _uri: &str) -> Result<Bytes, FetchError> {
            self.fetches.fetch_add(1, Ordering::SeqCst);
            let next = self.script.lock().unwrap().pop_front();
            next.unwrap_or_else(|| self.fallback.clone())
        }
    }

    fn frame(data: &'static [u8]) -> Result<Bytes, FetchError> {
        Ok(Bytes::from_static(data))
    }

    async fn registry_with(session: &str) -> RouteRegistry {
        let registry = RouteRegistry::in_memory(BASE);
        registry
            .register(session, "http://up.example/feed")
            .await
            .unwrap();
        registry
    }

    fn fast_settings() -> StreamSettings {
        StreamSettings {
            tick_interval: Duration::from_millis(2),
            write_timeout: Duration::from_millis(200),
            channel_capacity: 8,
        }
    }

    #[tokio::test]
    async fn test_repeats_are_suppressed() {
        let registry = registry_with("s1").await;
        let source = Arc::new(ScriptedSource::new(vec![
            frame(b"A"),
            frame(b"A"),
            frame(b"B"),
            frame(b"B"),
            frame(b"B"),
            frame(b"C"),
        ]));
        let mut session =
            SessionLoop::new("s1", registry, Arc::new(FrameCache::new()), source.clone());

        let mut emitted = Vec::new();
        for _ in 0..6 {
            if let Step::Emit(frame) = session.step().await {
                emitted.push(frame);
            }
        }

        assert_eq!(
            emitted,
            vec![
                Bytes::from_static(b"A"),
                Bytes::from_static(b"B"),
                Bytes::from_static(b"C"),
            ]
        );
        assert_eq!(session.state(), LoopState::Active);
    }

    #[tokio::test]
    async fn test_frame_returning_after_change_is_emitted_again() {
        let registry = registry_with("s1").await;
        let source = Arc::new(ScriptedSource::new(vec![
            frame(b"A"),
            frame(b"B"),
            frame(b"A"),
        ]));
        let mut session = SessionLoop::new("s1", registry, Arc::new(FrameCache::new()), source);

        assert_eq!(session.step().await, Step::Emit(Bytes::from_static(b"A")));
        assert_eq!(session.step().await, Step::Emit(Bytes::from_static(b"B")));
        assert_eq!(session.step().await, Step::Emit(Bytes::from_static(b"A")));
    }

    #[tokio::test]
    async fn test_transient_failure_skips_and_recovers() {
        let registry = registry_with("s1").await;
        let source = Arc::new(ScriptedSource::new(vec![
            frame(b"A"),
            Err(FetchError::Transient("timeout".to_string())),
            frame(b"A"),
            frame(b"B"),
        ]));
        let mut session = SessionLoop::new("s1", registry, Arc::new(FrameCache::new()), source);

        assert!(matches!(session.step().await, Step::Emit(_)));
        assert_eq!(
            session.step().await,
            Step::Skip(SkipReason::TransientFailure)
        );
        assert_eq!(session.state(), LoopState::SuspendedSkip);
        // Comparison is against the last emitted frame, not the failed fetch.
        assert_eq!(session.step().await, Step::Skip(SkipReason::Unchanged));
        assert_eq!(session.state(), LoopState::Active);
        assert_eq!(session.step().await, Step::Emit(Bytes::from_static(b"B")));
    }

    #[tokio::test]
    async fn test_no_route_on_first_tick() {
        let registry = RouteRegistry::in_memory(BASE);
        let source = Arc::new(ScriptedSource::repeating(b"A"));
        let mut session =
            SessionLoop::new("ghost", registry, Arc::new(FrameCache::new()), source.clone());

        assert_eq!(
            session.step().await,
            Step::Terminate(TerminateReason::NoRoute)
        );
        assert_eq!(session.state(), LoopState::Terminating);
        assert_eq!(source.fetches(), 0);
    }

    #[tokio::test]
    async fn test_route_removed_mid_stream() {
        let registry = registry_with("s1").await;
        let cache = Arc::new(FrameCache::new());
        let source = Arc::new(ScriptedSource::repeating(b"A"));
        let mut session = SessionLoop::new("s1", registry.clone(), cache.clone(), source.clone());

        assert!(matches!(session.step().await, Step::Emit(_)));
        registry.delete("s1").await.unwrap();

        assert_eq!(
            session.step().await,
            Step::Terminate(TerminateReason::RouteRemoved)
        );
        assert_eq!(source.fetches(), 1);
        assert!(cache.get("s1").is_none());
    }

    #[tokio::test]
    async fn test_unreachable_upstream_deregisters_route() {
        let registry = registry_with("s1").await;
        let source = Arc::new(ScriptedSource::new(vec![
            frame(b"A"),
            Err(FetchError::Unreachable("connection refused".to_string())),
            frame(b"B"),
        ]));
        let mut session = SessionLoop::new(
            "s1",
            registry.clone(),
            Arc::new(FrameCache::new()),
            source.clone(),
        );

        assert!(matches!(session.step().await, Step::Emit(_)));
        assert_eq!(
            session.step().await,
            Step::Terminate(TerminateReason::UpstreamUnreachable)
        );
        assert!(!registry.contains("s1").await.unwrap());

        // Further ticks never fetch again, even if the route reappears.
        registry.register("s1", "http://up.example/feed").await.unwrap();
        assert_eq!(
            session.step().await,
            Step::Terminate(TerminateReason::UpstreamUnreachable)
        );
        assert_eq!(source.fetches(), 2);
    }

    #[tokio::test]
    async fn test_unreachable_before_first_frame_still_deregisters() {
        let registry = registry_with("s1").await;
        let source = Arc::new(ScriptedSource::new(vec![Err(FetchError::Unreachable(
            "dns failure".to_string(),
        ))]));
        let mut session = SessionLoop::new("s1", registry.clone(), Arc::new(FrameCache::new()), source);

        assert_eq!(
            session.step().await,
            Step::Terminate(TerminateReason::UpstreamUnreachable)
        );
        assert!(registry.lookup_target("s1").await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn test_new_loop_resets_cached_fingerprint() {
        let registry = registry_with("s1").await;
        let cache = Arc::new(FrameCache::new());
        cache.set("s1", Fingerprint::of(b"A"));

        let source = Arc::new(ScriptedSource::repeating(b"A"));
        let mut session = SessionLoop::new("s1", registry, cache, source);
        assert_eq!(session.step().await, Step::Emit(Bytes::from_static(b"A")));
    }

    #[tokio::test]
    async fn test_viewers_of_one_session_share_the_fingerprint() {
        let registry = registry_with("s1").await;
        let cache = Arc::new(FrameCache::new());
        let source = Arc::new(ScriptedSource::repeating(b"A"));

        let mut first = SessionLoop::new("s1", registry.clone(), cache.clone(), source.clone());
        assert_eq!(first.step().await, Step::Emit(Bytes::from_static(b"A")));

        // The second viewer's reset lets the first viewer emit again, which
        // then hides the same frame from the second viewer.
        let mut second = SessionLoop::new("s1", registry, cache.clone(), source);
        assert_eq!(first.step().await, Step::Emit(Bytes::from_static(b"A")));
        assert_eq!(second.step().await, Step::Skip(SkipReason::Unchanged));
        assert_eq!(cache.len(), 1);
    }

    #[tokio::test]
    async fn test_run_emits_multipart_parts_until_unreachable() {
        let registry = registry_with("s1").await;
        let source = Arc::new(ScriptedSource::new(vec![
            frame(b"h1"),
            frame(b"h1"),
            frame(b"h2"),
            Err(FetchError::Unreachable("reset".to_string())),
        ]));
        let session = SessionLoop::new("s1", registry.clone(), Arc::new(FrameCache::new()), source);

        let (tx, mut rx) = mpsc::channel(8);
        let summary = session
            .run(tx, fast_settings(), CancellationToken::new())
            .await;

        assert_eq!(summary.reason, TerminateReason::UpstreamUnreachable);
        assert_eq!(summary.frames_emitted, 2);
        assert_eq!(summary.ticks, 4);

        let first = rx.recv().await.unwrap().unwrap();
        let second = rx.recv().await.unwrap().unwrap();
        assert_eq!(&first[..], b"--frame\r\nContent-Type: image/jpeg\r\n\r\nh1\r\n");
        assert_eq!(&second[..], b"--frame\r\nContent-Type: image/jpeg\r\n\r\nh2\r\n");
        assert!(rx.recv().await.is_none());
        assert!(!registry.contains("s1").await.unwrap());
    }

    #[tokio::test]
    async fn test_run_stops_fetching_after_client_disconnect() {
        let registry = registry_with("s1").await;
        let source = Arc::new(ScriptedSource::repeating(b"A"));
        let session = SessionLoop::new(
            "s1",
            registry.clone(),
            Arc::new(FrameCache::new()),
            source.clone(),
        );

        let (tx, rx) = mpsc::channel(8);
        drop(rx);
        let summary = session
            .run(tx, fast_settings(), CancellationToken::new())
            .await;

        assert_eq!(summary.reason, TerminateReason::ClientDisconnected);
        assert_eq!(source.fetches(), 0);
        // A client leaving does not deregister the route.
        assert!(registry.contains("s1").await.unwrap());
    }

    #[tokio::test]
    async fn test_run_stops_on_shutdown_without_deregistering() {
        let registry = registry_with("s1").await;
        let source = Arc::new(ScriptedSource::repeating(b"A"));
        let session = SessionLoop::new("s1", registry.clone(), Arc::new(FrameCache::new()), source);

        let shutdown = CancellationToken::new();
        let (tx, mut rx) = mpsc::channel(8);
        let handle = tokio::spawn(session.run(tx, fast_settings(), shutdown.clone()));

        // First frame arrives, then the process shuts down.
        assert!(rx.recv().await.is_some());
        shutdown.cancel();

        let summary = handle.await.unwrap();
        assert_eq!(summary.reason, TerminateReason::Shutdown);
        assert_eq!(summary.frames_emitted, 1);
        assert!(registry.contains("s1").await.unwrap());
    }

    #[tokio::test]
    async fn test_run_treats_stalled_client_as_disconnected() {
        let registry = registry_with("s1").await;
        let source = Arc::new(ScriptedSource::new(vec![
            frame(b"A"),
            frame(b"B"),
        ]));
        let session = SessionLoop::new("s1", registry, Arc::new(FrameCache::new()), source);

        // Capacity one and nobody reading: the second frame cannot be delivered.
        let (tx, _rx) = mpsc::channel(1);
        let settings = StreamSettings {
            tick_interval: Duration::from_millis(2),
            write_timeout: Duration::from_millis(20),
            channel_capacity: 1,
        };
        let summary = session.run(tx, settings, CancellationToken::new()).await;

        assert_eq!(summary.reason, TerminateReason::ClientDisconnected);
        assert_eq!(summary.frames_emitted, 1);
    }
}
