//! One client's duplex channel.
//!
//! A session reads messages in order and dispatches them: control text
//! replaces the published configuration, binary frames go to the blocking
//! pool and their results are written back as they complete. All writes go
//! through a single writer task, so frames from concurrent jobs never
//! interleave on the wire.

use crate::offload::Offload;
use crate::pipeline::FramePipeline;
use crate::prompt::{control_prompt, Configuration, PromptStore};
use crate::registry::{CloseReason, Registration, SessionId};
use crate::telemetry::{FrameOutcome, Metrics};
use axum::extract::ws::Message;
use bytes::Bytes;
use futures::{Sink, SinkExt, Stream, StreamExt};
use std::fmt::Display;
use std::sync::Arc;
use std::time::Instant;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::instrument;

const OUTBOUND_QUEUE: usize = 16;

#[derive(Error, Debug)]
pub enum TransportError {
    #[error("Failed to read from channel: {0}")]
    Read(String),
    #[error("Failed to write to channel: {0}")]
    Write(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Connecting,
    Open,
    Closing,
    Closed,
}

/// Services shared by every session.
#[derive(Clone)]
pub struct SessionContext {
    pub prompts: PromptStore,
    pub pipeline: Arc<FramePipeline>,
    pub offload: Offload,
    pub metrics: Arc<Metrics>,
}

enum Outbound {
    Frame(Vec<u8>),
    Close(Option<CloseReason>),
}

pub struct Session {
    registration: Registration,
    context: SessionContext,
    state: SessionState,
}

impl Session {
    pub fn new(registration: Registration, context: SessionContext) -> Self {
        Self {
            registration,
            context,
            state: SessionState::Connecting,
        }
    }

    pub fn id(&self) -> SessionId {
        self.registration.id()
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Drives the session until the client leaves, the transport fails or the
    /// server asks it to close. Returns the final state.
    pub async fn run<W, R, E>(mut self, sink: W, mut stream: R) -> SessionState
    where
        W: Sink<Message> + Send + Unpin + 'static,
        W::Error: Display + Send,
        R: Stream<Item = Result<Message, E>> + Unpin,
        E: Display,
    {
        let (outbound, outbound_rx) = mpsc::channel(OUTBOUND_QUEUE);
        let writer = tokio::spawn(write_loop(sink, outbound_rx));
        let mut shutdown = self.registration.take_shutdown();

        self.state = SessionState::Open;
        self.context.metrics.session_opened();
        tracing::info!(session = %self.id(), "Session opened");

        let close_reason = loop {
            let message = tokio::select! {
                reason = shutdown_requested(&mut shutdown) => break Some(reason),
                message = stream.next() => message,
            };

            match message {
                Some(Ok(Message::Text(text))) => {
                    // A shutdown request abandons a prompt that is still building.
                    tokio::select! {
                        reason = shutdown_requested(&mut shutdown) => break Some(reason),
                        _ = self.handle_control(text.as_str()) => {}
                    }
                }
                Some(Ok(Message::Binary(data))) => self.submit_frame(data, &outbound),
                Some(Ok(Message::Close(_))) | None => break None,
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    let err = TransportError::Read(e.to_string());
                    tracing::warn!(session = %self.id(), "{}", err);
                    break None;
                }
            }
        };

        self.close(close_reason, outbound, writer).await;
        self.state
    }

    async fn handle_control(&self, text: &str) {
        let Some(prompt) = control_prompt(text) else {
            tracing::debug!(session = %self.id(), "Ignoring text message without prompt header");
            return;
        };
        tracing::info!(session = %self.id(), "Received prompt: {}", prompt);

        let predictor = Arc::clone(self.context.pipeline.predictor());
        let owned_prompt = prompt.to_string();
        let built = self
            .context
            .offload
            .run(move || Configuration::build(predictor.as_ref(), &owned_prompt))
            .await;

        match built {
            Ok(Ok(configuration)) => {
                let snapshot = self.context.prompts.set(configuration);
                self.context.metrics.record_prompt_update(true);
                tracing::info!(
                    session = %self.id(),
                    "Set prompt: {} ({} labels)",
                    snapshot.prompt(),
                    snapshot.tree().label_count()
                );
            }
            Ok(Err(e)) => {
                self.context.metrics.record_prompt_update(false);
                tracing::warn!(session = %self.id(), "Discarding prompt {:?}: {}", prompt, e);
            }
            Err(e) => {
                self.context.metrics.record_prompt_update(false);
                tracing::error!(session = %self.id(), "Prompt build job failed: {}", e);
            }
        }
    }

    #[instrument(skip(self, data, outbound), fields(session = %self.id(), bytes = data.len()))]
    fn submit_frame(&self, data: Bytes, outbound: &mpsc::Sender<Outbound>) {
        let snapshot = self.context.prompts.get();
        let outcome = if snapshot.is_some() {
            FrameOutcome::Annotated
        } else {
            FrameOutcome::Passthrough
        };

        let pipeline = Arc::clone(&self.context.pipeline);
        let started = Instant::now();
        let job = match self
            .context
            .offload
            .try_submit(move || pipeline.process(&data, snapshot.as_deref()))
        {
            Ok(job) => job,
            Err(e) => {
                self.context.metrics.record_frame(FrameOutcome::Rejected);
                tracing::warn!("Dropping frame: {}", e);
                return;
            }
        };

        let outbound = outbound.clone();
        let metrics = Arc::clone(&self.context.metrics);
        let session = self.id();
        tokio::spawn(async move {
            match job.await {
                Ok(Ok(encoded)) => {
                    metrics.record_frame_duration(started.elapsed().as_millis() as u64);
                    tracing::debug!(session = %session, "Processed frame of length {}", encoded.len());
                    if outbound.send(Outbound::Frame(encoded)).await.is_err() {
                        metrics.record_frame(FrameOutcome::Dropped);
                        tracing::debug!(session = %session, "Session closed, discarding frame");
                    } else {
                        metrics.record_frame(outcome);
                    }
                }
                Ok(Err(e)) => {
                    metrics.record_frame(FrameOutcome::Dropped);
                    tracing::warn!(session = %session, "Dropping frame: {}", e);
                }
                Err(e) => {
                    metrics.record_frame(FrameOutcome::Dropped);
                    tracing::error!(session = %session, "Frame job failed: {}", e);
                }
            }
        });
    }

    /// Flushes queued frames, sends the close frame if the server initiated
    /// the close, and leaves the registry. Safe to call more than once.
    async fn close(
        &mut self,
        reason: Option<CloseReason>,
        outbound: mpsc::Sender<Outbound>,
        writer: JoinHandle<Result<(), TransportError>>,
    ) {
        if matches!(self.state, SessionState::Closing | SessionState::Closed) {
            return;
        }
        self.state = SessionState::Closing;

        // Fails only if the writer already stopped on a transport error.
        let _ = outbound.send(Outbound::Close(reason)).await;
        drop(outbound);

        match writer.await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => tracing::debug!(session = %self.id(), "{}", e),
            Err(e) => tracing::error!(session = %self.id(), "Writer task failed: {}", e),
        }

        self.registration.deregister();
        self.state = SessionState::Closed;
        self.context.metrics.session_closed();
        tracing::info!(session = %self.id(), "Session closed");
    }
}

async fn shutdown_requested(shutdown: &mut Option<oneshot::Receiver<CloseReason>>) -> CloseReason {
    if let Some(rx) = shutdown.as_mut() {
        if let Ok(reason) = rx.await {
            return reason;
        }
        // Sender dropped without a request; never fire.
        *shutdown = None;
    }
    std::future::pending().await
}

async fn write_loop<W>(
    mut sink: W,
    mut outbound: mpsc::Receiver<Outbound>,
) -> Result<(), TransportError>
where
    W: Sink<Message> + Unpin,
    W::Error: Display,
{
    while let Some(message) = outbound.recv().await {
        match message {
            Outbound::Frame(data) => sink
                .send(Message::Binary(data.into()))
                .await
                .map_err(|e| TransportError::Write(e.to_string()))?,
            Outbound::Close(reason) => {
                if let Some(reason) = reason {
                    sink.send(Message::Close(Some(reason.frame())))
                        .await
                        .map_err(|e| TransportError::Write(e.to_string()))?;
                }
                break;
            }
        }
    }

    sink.close()
        .await
        .map_err(|e| TransportError::Write(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::OverlayConfig;
    use crate::overlay::OverlayRenderer;
    use crate::pipeline::{decode_frame, encode_jpeg};
    use crate::predictor::{
        DetectionResult, EncoderKind, FullFramePredictor, PredictorError, TextEncodings,
        TreePredictor,
    };
    use crate::registry::{SessionRegistry, SERVER_SHUTDOWN};
    use crate::tree::Tree;
    use futures::channel::mpsc as channel;
    use image::{Rgb, RgbImage};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::mpsc as gate;
    use std::time::Duration;

    const TIMEOUT: Duration = Duration::from_secs(5);

    type ClientTx = channel::UnboundedSender<Result<Message, std::io::Error>>;
    type ClientRx = channel::UnboundedReceiver<Message>;

    fn context(capacity: usize) -> SessionContext {
        context_with(Arc::new(FullFramePredictor::new(16)), capacity)
    }

    fn context_with(predictor: Arc<dyn TreePredictor>, capacity: usize) -> SessionContext {
        let pipeline = FramePipeline::new(
            predictor,
            OverlayRenderer::new(&OverlayConfig::default()).unwrap(),
            90,
        );
        SessionContext {
            prompts: PromptStore::new(),
            pipeline: Arc::new(pipeline),
            offload: Offload::new(capacity),
            metrics: Arc::new(Metrics::new().unwrap()),
        }
    }

    fn start(
        registry: &Arc<SessionRegistry>,
        context: SessionContext,
    ) -> (ClientTx, ClientRx, JoinHandle<SessionState>) {
        let (client_tx, server_rx) = channel::unbounded();
        let (server_tx, client_rx) = channel::unbounded();
        let session = Session::new(registry.register().unwrap(), context);
        assert_eq!(session.state(), SessionState::Connecting);
        let handle = tokio::spawn(session.run(server_tx, server_rx));
        (client_tx, client_rx, handle)
    }

    /// Blocks either text encoding or detection until the test releases it.
    struct GatedPredictor {
        inner: FullFramePredictor,
        gate_detect: bool,
        gate: parking_lot::Mutex<gate::Receiver<()>>,
        entered: AtomicUsize,
    }

    impl GatedPredictor {
        fn new(gate_detect: bool) -> (Arc<Self>, gate::Sender<()>) {
            let (release, gate) = gate::channel();
            let predictor = Arc::new(Self {
                inner: FullFramePredictor::new(16),
                gate_detect,
                gate: parking_lot::Mutex::new(gate),
                entered: AtomicUsize::new(0),
            });
            (predictor, release)
        }

        fn wait(&self) {
            self.entered.fetch_add(1, Ordering::SeqCst);
            // A dropped sender releases every waiter.
            let _ = self.gate.lock().recv();
        }

        fn entered(&self) -> usize {
            self.entered.load(Ordering::SeqCst)
        }
    }

    impl TreePredictor for GatedPredictor {
        fn encode_text(
            &self,
            tree: &Tree,
            encoder: EncoderKind,
        ) -> Result<TextEncodings, PredictorError> {
            if !self.gate_detect {
                self.wait();
            }
            self.inner.encode_text(tree, encoder)
        }

        fn detect(
            &self,
            image: &RgbImage,
            tree: &Tree,
            clip: &TextEncodings,
            owl: &TextEncodings,
        ) -> Result<DetectionResult, PredictorError> {
            if self.gate_detect {
                self.wait();
            }
            self.inner.detect(image, tree, clip, owl)
        }
    }

    /// Takes ten milliseconds per pixel of frame width.
    struct WidthDelayPredictor(FullFramePredictor);

    impl TreePredictor for WidthDelayPredictor {
        fn encode_text(
            &self,
            tree: &Tree,
            encoder: EncoderKind,
        ) -> Result<TextEncodings, PredictorError> {
            self.0.encode_text(tree, encoder)
        }

        fn detect(
            &self,
            image: &RgbImage,
            tree: &Tree,
            clip: &TextEncodings,
            owl: &TextEncodings,
        ) -> Result<DetectionResult, PredictorError> {
            std::thread::sleep(Duration::from_millis(image.width() as u64 * 10));
            self.0.detect(image, tree, clip, owl)
        }
    }

    async fn wait_until(condition: impl Fn() -> bool) {
        tokio::time::timeout(TIMEOUT, async {
            while !condition() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();
    }

    fn sized_frame(width: u32, height: u32) -> Vec<u8> {
        encode_jpeg(&RgbImage::from_pixel(width, height, Rgb([128, 128, 128])), 95).unwrap()
    }

    fn jpeg_frame() -> Vec<u8> {
        encode_jpeg(&RgbImage::from_pixel(32, 24, Rgb([128, 128, 128])), 95).unwrap()
    }

    fn text(value: &str) -> Result<Message, std::io::Error> {
        Ok(Message::Text(value.into()))
    }

    fn binary(value: Vec<u8>) -> Result<Message, std::io::Error> {
        Ok(Message::Binary(value.into()))
    }

    async fn next_binary(rx: &mut ClientRx) -> Bytes {
        match tokio::time::timeout(TIMEOUT, rx.next()).await.unwrap() {
            Some(Message::Binary(data)) => data,
            other => panic!("expected binary frame, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_frames_pass_through_without_prompt() {
        let registry = Arc::new(SessionRegistry::new());
        let (tx, mut rx, handle) = start(&registry, context(4));
        let frame = jpeg_frame();

        tx.unbounded_send(binary(frame.clone())).unwrap();
        let output = next_binary(&mut rx).await;

        let expected = encode_jpeg(&decode_frame(&frame).unwrap(), 90).unwrap();
        assert_eq!(output.as_ref(), expected.as_slice());

        drop(tx);
        assert_eq!(handle.await.unwrap(), SessionState::Closed);
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn test_prompt_is_published_and_applied() {
        let registry = Arc::new(SessionRegistry::new());
        let context = context(4);
        let prompts = context.prompts.clone();
        let (tx, mut rx, handle) = start(&registry, context);
        let frame = jpeg_frame();

        tx.unbounded_send(text("prompt:[a face]")).unwrap();
        tx.unbounded_send(binary(frame.clone())).unwrap();
        let output = next_binary(&mut rx).await;

        let snapshot = prompts.get().unwrap();
        assert_eq!(snapshot.tree().labels, vec!["image", "a face"]);
        let passthrough = encode_jpeg(&decode_frame(&frame).unwrap(), 90).unwrap();
        assert_ne!(output.as_ref(), passthrough.as_slice());
        assert_eq!(decode_frame(&output).unwrap().dimensions(), (32, 24));

        drop(tx);
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn test_bad_prompt_keeps_previous_configuration() {
        let registry = Arc::new(SessionRegistry::new());
        let context = context(4);
        let prompts = context.prompts.clone();
        let (tx, mut rx, handle) = start(&registry, context);

        tx.unbounded_send(text("prompt:[a cat]")).unwrap();
        tx.unbounded_send(text("prompt:[a cat")).unwrap();
        tx.unbounded_send(text("hello:[a dog]")).unwrap();
        tx.unbounded_send(text("prompt without separator")).unwrap();
        // Acts as a barrier: messages are handled in order.
        tx.unbounded_send(binary(jpeg_frame())).unwrap();
        next_binary(&mut rx).await;

        assert_eq!(prompts.get().unwrap().tree().labels[1], "a cat");

        drop(tx);
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn test_bad_prompt_without_previous_leaves_store_empty() {
        let registry = Arc::new(SessionRegistry::new());
        let context = context(4);
        let prompts = context.prompts.clone();
        let (tx, mut rx, handle) = start(&registry, context);

        tx.unbounded_send(text("prompt:(unclosed")).unwrap();
        tx.unbounded_send(binary(jpeg_frame())).unwrap();
        next_binary(&mut rx).await;

        assert!(prompts.get().is_none());

        drop(tx);
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn test_undecodable_frame_is_dropped() {
        let registry = Arc::new(SessionRegistry::new());
        let (tx, mut rx, handle) = start(&registry, context(4));

        tx.unbounded_send(binary(b"definitely not a jpeg".to_vec()))
            .unwrap();
        tx.unbounded_send(binary(jpeg_frame())).unwrap();
        next_binary(&mut rx).await;

        drop(tx);
        assert_eq!(handle.await.unwrap(), SessionState::Closed);
        assert!(tokio::time::timeout(TIMEOUT, rx.next())
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn test_read_error_closes_session() {
        let registry = Arc::new(SessionRegistry::new());
        let (tx, _rx, handle) = start(&registry, context(4));

        tx.unbounded_send(Err(std::io::Error::other("connection reset")))
            .unwrap();

        assert_eq!(handle.await.unwrap(), SessionState::Closed);
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn test_server_shutdown_sends_close_frame() {
        let registry = Arc::new(SessionRegistry::new());
        let (_tx_a, mut rx_a, handle_a) = start(&registry, context(4));
        let (_tx_b, mut rx_b, handle_b) = start(&registry, context(4));
        assert_eq!(registry.len(), 2);

        let notified = registry.broadcast_shutdown(SERVER_SHUTDOWN, TIMEOUT).await;

        assert_eq!(notified, 2);
        assert!(registry.is_empty());
        for rx in [&mut rx_a, &mut rx_b] {
            match rx.next().await {
                Some(Message::Close(Some(frame))) => {
                    assert_eq!(frame.code, 1001);
                    assert_eq!(frame.reason.as_str(), "Server shutdown");
                }
                other => panic!("expected close frame, got {:?}", other),
            }
            assert!(rx.next().await.is_none());
        }
        assert_eq!(handle_a.await.unwrap(), SessionState::Closed);
        assert_eq!(handle_b.await.unwrap(), SessionState::Closed);
    }

    #[tokio::test]
    async fn test_frames_are_sent_in_completion_order() {
        let registry = Arc::new(SessionRegistry::new());
        let predictor = Arc::new(WidthDelayPredictor(FullFramePredictor::new(16)));
        let (tx, mut rx, handle) = start(&registry, context_with(predictor, 2));

        tx.unbounded_send(text("prompt:[a face]")).unwrap();
        tx.unbounded_send(binary(sized_frame(40, 24))).unwrap();
        tx.unbounded_send(binary(sized_frame(8, 8))).unwrap();

        let first = next_binary(&mut rx).await;
        let second = next_binary(&mut rx).await;
        assert_eq!(decode_frame(&first).unwrap().dimensions(), (8, 8));
        assert_eq!(decode_frame(&second).unwrap().dimensions(), (40, 24));

        drop(tx);
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn test_saturated_frames_are_rejected_and_prompts_still_apply() {
        let registry = Arc::new(SessionRegistry::new());
        let (predictor, release) = GatedPredictor::new(true);
        let context = context_with(predictor.clone(), 1);
        let prompts = context.prompts.clone();
        let offload = context.offload.clone();
        let (tx, mut rx, handle) = start(&registry, context);

        tx.unbounded_send(text("prompt:[a cat]")).unwrap();
        tx.unbounded_send(binary(jpeg_frame())).unwrap();
        tx.unbounded_send(binary(jpeg_frame())).unwrap();
        tx.unbounded_send(text("prompt:[a dog]")).unwrap();

        wait_until(|| {
            prompts
                .get()
                .is_some_and(|snapshot| snapshot.tree().labels[1] == "a dog")
        })
        .await;
        wait_until(|| predictor.entered() == 1).await;
        assert_eq!(offload.in_flight(), 1);
        assert!(!handle.is_finished());

        release.send(()).unwrap();
        next_binary(&mut rx).await;

        drop(tx);
        assert_eq!(handle.await.unwrap(), SessionState::Closed);
        assert!(tokio::time::timeout(TIMEOUT, rx.next())
            .await
            .unwrap()
            .is_none());
        assert_eq!(predictor.entered(), 1);
        assert_eq!(offload.in_flight(), 0);
    }

    #[tokio::test]
    async fn test_close_discards_in_flight_frame() {
        let registry = Arc::new(SessionRegistry::new());
        let (predictor, release) = GatedPredictor::new(true);
        let context = context_with(predictor.clone(), 1);
        let offload = context.offload.clone();
        let (tx, mut rx, handle) = start(&registry, context);

        tx.unbounded_send(text("prompt:[a face]")).unwrap();
        tx.unbounded_send(binary(jpeg_frame())).unwrap();
        wait_until(|| predictor.entered() == 1).await;

        drop(tx);
        assert_eq!(handle.await.unwrap(), SessionState::Closed);
        assert!(registry.is_empty());
        assert_eq!(offload.in_flight(), 1);

        release.send(()).unwrap();
        wait_until(|| offload.in_flight() == 0).await;
        assert!(tokio::time::timeout(TIMEOUT, rx.next())
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn test_shutdown_interrupts_prompt_build() {
        let registry = Arc::new(SessionRegistry::new());
        let (predictor, release) = GatedPredictor::new(false);
        let context = context_with(predictor.clone(), 1);
        let prompts = context.prompts.clone();
        let (tx, mut rx, handle) = start(&registry, context);

        tx.unbounded_send(text("prompt:[a face]")).unwrap();
        wait_until(|| predictor.entered() == 1).await;

        let notified = tokio::time::timeout(
            Duration::from_secs(2),
            registry.broadcast_shutdown(SERVER_SHUTDOWN, TIMEOUT),
        )
        .await
        .unwrap();

        assert_eq!(notified, 1);
        assert!(registry.is_empty());
        match rx.next().await {
            Some(Message::Close(Some(frame))) => assert_eq!(frame.code, 1001),
            other => panic!("expected close frame, got {:?}", other),
        }
        assert_eq!(handle.await.unwrap(), SessionState::Closed);

        drop(release);
        assert!(prompts.get().is_none());
        drop(tx);
    }
}
