use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use futures::Stream;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio_stream::{StreamExt, wrappers::ReceiverStream};

use crate::{
    events::event_stream::{CloseReason, StreamEvent},
    types::SessionId,
};

/// The subscriber side of an [`EventStream`](crate::events::EventStream).
///
/// A lazy, ordered, finite sequence of events: it ends once the stream is
/// closed and every buffered event was read. Dropping the subscription
/// disconnects the subscriber.
pub struct EventSubscription {
    session_id: SessionId,
    inner: ReceiverStream<StreamEvent>,
    close_reason: Arc<Mutex<Option<CloseReason>>>,
}

impl EventSubscription {
    pub(crate) fn new(
        session_id: SessionId,
        receiver: mpsc::Receiver<StreamEvent>,
        close_reason: Arc<Mutex<Option<CloseReason>>>,
    ) -> Self {
        Self {
            session_id,
            inner: ReceiverStream::new(receiver),
            close_reason,
        }
    }

    pub fn session_id(&self) -> &SessionId {
        &self.session_id
    }

    /// Waits for the next event; `None` once the stream has ended.
    pub async fn next_event(&mut self) -> Option<StreamEvent> {
        self.inner.next().await
    }

    /// Why the stream was closed. `None` while it is still open.
    pub fn close_reason(&self) -> Option<CloseReason> {
        self.close_reason.lock().clone()
    }

    /// Drains the stream until it ends.
    pub async fn collect_events(mut self) -> (Vec<StreamEvent>, Option<CloseReason>) {
        let mut events = vec![];
        while let Some(event) = self.next_event().await {
            events.push(event);
        }
        let reason = self.close_reason();
        (events, reason)
    }
}

impl Stream for EventSubscription {
    type Item = StreamEvent;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        Pin::new(&mut self.inner).poll_next(cx)
    }
}
