//! Ordered, one-at-a-time frame writes.
//!
//! Every outbound frame of a conversation goes through a single
//! [`WriteSerializer`]. The sink sits behind a fair async mutex, so at most one
//! write is in flight and queued writes complete in submission order.
//!
//! Backpressure is observable rather than fatal: when the transport cannot
//! take a frame right away the serializer flags `overflow` and raises
//! [`ConversationEvent::Overflow`]; once the frame is accepted the flag clears
//! and [`ConversationEvent::Drain`] fires. Queued writes are never dropped.

use crate::codec::OutboundFrame;
use crate::error::{HybiError, HybiResult};
use crate::event::{self, ConversationEvent};
use futures_util::{Sink, SinkExt};
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::task::Poll;
use std::time::Duration;
use tokio::sync::{broadcast, Mutex};
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Type-erased outbound half of a WebSocket.
pub type FrameSink = Pin<Box<dyn Sink<Message, Error = WsError> + Send>>;

pub struct WriteSerializer {
    /// `None` before the handshake completes and after shutdown.
    sink: Mutex<Option<FrameSink>>,
    overflow: AtomicBool,
    /// Cancelled on forced shutdown; releases writers stuck on a full transport.
    abort: CancellationToken,
    events: broadcast::Sender<ConversationEvent>,
}

impl WriteSerializer {
    pub fn new(events: broadcast::Sender<ConversationEvent>) -> Self {
        Self {
            sink: Mutex::new(None),
            overflow: AtomicBool::new(false),
            abort: CancellationToken::new(),
            events,
        }
    }

    /// Install the outbound half once the transport is wired.
    pub async fn attach(&self, sink: FrameSink) {
        *self.sink.lock().await = Some(sink);
    }

    /// Whether the transport is currently refusing writes.
    pub fn overflow(&self) -> bool {
        self.overflow.load(Ordering::Acquire)
    }

    /// Whether the serializer has been shut down.
    pub fn is_shut_down(&self) -> bool {
        self.abort.is_cancelled()
    }

    /// Write one frame, waiting for every earlier write to finish first.
    pub async fn write(&self, frame: OutboundFrame) -> HybiResult<()> {
        if self.abort.is_cancelled() {
            return Err(HybiError::ConnectionClosed);
        }

        let mut guard = tokio::select! {
            guard = self.sink.lock() => guard,
            _ = self.abort.cancelled() => return Err(HybiError::ConnectionClosed),
        };
        let sink = guard.as_mut().ok_or(HybiError::ConnectionClosed)?;

        let mut send = sink.send(Message::from(frame));
        let result = match futures_util::poll!(&mut send) {
            Poll::Ready(result) => result,
            Poll::Pending => {
                self.set_overflow(true);
                let result = tokio::select! {
                    result = &mut send => result,
                    _ = self.abort.cancelled() => Err(WsError::AlreadyClosed),
                };
                self.set_overflow(false);
                result
            }
        };
        result.map_err(HybiError::from)
    }

    /// Close the transport's outbound half.
    ///
    /// Tries a graceful close (close frame, flush) within `grace`, then drops
    /// the sink regardless. Pending and later writes fail with
    /// `ConnectionClosed`.
    pub async fn shutdown(&self, grace: Duration) {
        let graceful = tokio::time::timeout(grace, async {
            let mut guard = self.sink.lock().await;
            if let Some(mut sink) = guard.take() {
                if let Err(e) = sink.close().await {
                    debug!(error = %e, "transport close failed");
                }
            }
        })
        .await;

        self.abort.cancel();

        if graceful.is_err() {
            warn!("graceful transport close timed out, destroying");
            self.sink.lock().await.take();
        }
    }

    fn set_overflow(&self, overflow: bool) {
        let was = self.overflow.swap(overflow, Ordering::AcqRel);
        match (was, overflow) {
            (false, true) => event::emit(&self.events, ConversationEvent::Overflow),
            (true, false) => event::emit(&self.events, ConversationEvent::Drain),
            _ => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use tokio::sync::mpsc;
    use tokio_util::sync::PollSender;

    fn channel_sink(capacity: usize) -> (FrameSink, mpsc::Receiver<Message>) {
        let (tx, rx) = mpsc::channel::<Message>(capacity);
        let sink = PollSender::new(tx).sink_map_err(|_| WsError::AlreadyClosed);
        (Box::pin(sink), rx)
    }

    #[tokio::test]
    async fn writes_keep_submission_order() {
        let writer = WriteSerializer::new(event::channel());
        let (sink, mut rx) = channel_sink(64);
        writer.attach(sink).await;

        let writes = (0..16u8).map(|i| writer.write(OutboundFrame::Data(vec![i])));
        for result in futures_util::future::join_all(writes).await {
            result.unwrap();
        }

        for i in 0..16u8 {
            assert_eq!(rx.recv().await.unwrap().into_data(), vec![i]);
        }
    }

    #[tokio::test]
    async fn overflow_then_drain() {
        let events = event::channel();
        let mut notes = events.subscribe();
        let writer = Arc::new(WriteSerializer::new(events));
        let (sink, mut rx) = channel_sink(1);
        writer.attach(sink).await;

        writer.write(OutboundFrame::Data(vec![1])).await.unwrap();
        assert!(!writer.overflow());

        let w = writer.clone();
        let blocked = tokio::spawn(async move { w.write(OutboundFrame::Data(vec![2])).await });

        assert_eq!(notes.recv().await.unwrap(), ConversationEvent::Overflow);
        assert!(writer.overflow());

        assert_eq!(rx.recv().await.unwrap().into_data(), vec![1]);
        blocked.await.unwrap().unwrap();

        assert_eq!(notes.recv().await.unwrap(), ConversationEvent::Drain);
        assert!(!writer.overflow());
        assert_eq!(rx.recv().await.unwrap().into_data(), vec![2]);
    }

    #[tokio::test]
    async fn write_before_attach_or_after_shutdown_fails() {
        let writer = WriteSerializer::new(event::channel());
        assert!(matches!(
            writer.write(OutboundFrame::Data(vec![1])).await,
            Err(HybiError::ConnectionClosed)
        ));

        let (sink, _rx) = channel_sink(4);
        writer.attach(sink).await;
        writer.shutdown(Duration::from_millis(100)).await;
        assert!(writer.is_shut_down());
        assert!(matches!(
            writer.write(OutboundFrame::Data(vec![1])).await,
            Err(HybiError::ConnectionClosed)
        ));
    }

    #[tokio::test]
    async fn shutdown_releases_a_stuck_writer() {
        let writer = Arc::new(WriteSerializer::new(event::channel()));
        let (sink, _rx) = channel_sink(1);
        writer.attach(sink).await;
        writer.write(OutboundFrame::Data(vec![1])).await.unwrap();

        let w = writer.clone();
        let stuck = tokio::spawn(async move { w.write(OutboundFrame::Data(vec![2])).await });
        tokio::task::yield_now().await;

        writer.shutdown(Duration::from_millis(50)).await;
        assert!(matches!(
            stuck.await.unwrap(),
            Err(HybiError::ConnectionClosed)
        ));
    }
}
