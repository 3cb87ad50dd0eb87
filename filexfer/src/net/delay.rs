//! Throttling queue forwarding one query per cool-down interval.
//!
//! ```text
//!  send ──► [q3, q2, q1] ──(one per cool-down)──► downstream Dispatch
//!                 │
//!       close_silent: drop queued callbacks
//!       tear-down:    fail queued callbacks with Aborted
//! ```

use super::{Dispatch, Query, QueryCallback};
use crate::error::TransportError;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::debug;

struct DelayedQuery {
    query: Query,
    callback: QueryCallback,
    delay: Duration,
}

enum DelayMessage {
    Send(DelayedQuery),
    CloseSilent,
}

/// Single-consumer delay queue in front of a downstream dispatcher.
pub struct DelayDispatcher {
    downstream: Arc<dyn Dispatch>,
    queue: VecDeque<DelayedQuery>,
    /// End of the cool-down started by the previous dispatch.
    wakeup_at: Option<Instant>,
    /// Pending timer, if the loop is scheduled.
    timer: Option<Instant>,
    inbox: mpsc::UnboundedReceiver<DelayMessage>,
}

/// Handle used to enqueue work. Dropping every handle tears the queue down.
#[derive(Clone)]
pub struct DelayDispatcherHandle {
    tx: mpsc::UnboundedSender<DelayMessage>,
    default_delay: Duration,
}

impl DelayDispatcher {
    /// Spawns a dispatcher task in front of `downstream`.
    pub fn spawn(downstream: Arc<dyn Dispatch>, default_delay: Duration) -> DelayDispatcherHandle {
        let (tx, inbox) = mpsc::unbounded_channel();
        let dispatcher = Self {
            downstream,
            queue: VecDeque::new(),
            wakeup_at: None,
            timer: None,
            inbox,
        };
        tokio::spawn(dispatcher.run());
        DelayDispatcherHandle { tx, default_delay }
    }

    async fn run(mut self) {
        loop {
            let timer = self.timer;
            tokio::select! {
                biased;
                message = self.inbox.recv() => match message {
                    Some(DelayMessage::Send(item)) => {
                        self.queue.push_back(item);
                        self.process();
                    }
                    Some(DelayMessage::CloseSilent) => {
                        self.close_silent();
                        return;
                    }
                    None => {
                        self.tear_down();
                        return;
                    }
                },
                _ = tokio::time::sleep_until(timer.unwrap_or_else(Instant::now)), if timer.is_some() => {
                    self.timer = None;
                    self.process();
                }
            }
        }
    }

    fn process(&mut self) {
        let now = Instant::now();
        if let Some(wakeup_at) = self.wakeup_at {
            if wakeup_at > now {
                self.timer = Some(wakeup_at);
                return;
            }
        }
        let Some(item) = self.queue.pop_front() else {
            return;
        };

        self.downstream.dispatch(item.query, item.callback);

        let wakeup_at = now + item.delay;
        self.wakeup_at = Some(wakeup_at);
        if !self.queue.is_empty() {
            self.timer = Some(wakeup_at);
        }
    }

    fn close_silent(&mut self) {
        if !self.queue.is_empty() {
            debug!(dropped = self.queue.len(), "delay dispatcher closed");
        }
        self.queue.clear();
    }

    fn tear_down(&mut self) {
        for item in self.queue.drain(..) {
            (item.callback)(Err(TransportError::Aborted));
        }
    }
}

impl DelayDispatcherHandle {
    /// Enqueues a query followed by a cool-down of `delay`.
    pub fn send_with_callback_and_delay(
        &self,
        query: Query,
        callback: QueryCallback,
        delay: Duration,
    ) {
        let item = DelayedQuery {
            query,
            callback,
            delay,
        };
        if let Err(mpsc::error::SendError(DelayMessage::Send(item))) =
            self.tx.send(DelayMessage::Send(item))
        {
            (item.callback)(Err(TransportError::Aborted));
        }
    }

    /// Stops the dispatcher, discarding everything still queued.
    pub fn close_silent(&self) {
        let _ = self.tx.send(DelayMessage::CloseSilent);
    }
}

impl Dispatch for DelayDispatcherHandle {
    fn dispatch(&self, query: Query, callback: QueryCallback) {
        self.send_with_callback_and_delay(query, callback, self.default_delay);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::location::DcId;
    use crate::net::{QueryClass, QueryResult, Request, Response};
    use bytes::Bytes;
    use parking_lot::Mutex;

    /// Records dispatch times and answers immediately.
    #[derive(Default)]
    struct RecordingDispatch {
        sent: Mutex<Vec<(u64, Instant)>>,
    }

    impl Dispatch for RecordingDispatch {
        fn dispatch(&self, query: Query, callback: QueryCallback) {
            self.sent.lock().push((query.id, Instant::now()));
            callback(Ok(Response::PartSaved(true)));
        }
    }

    fn query() -> Query {
        Query::new(
            DcId(2),
            QueryClass::Download,
            Request::SaveFilePart {
                file_id: 0,
                part: 0,
                bytes: Bytes::new(),
            },
        )
    }

    #[tokio::test(start_paused = true)]
    async fn test_spaces_dispatches_by_delay() {
        let downstream = Arc::new(RecordingDispatch::default());
        let handle = DelayDispatcher::spawn(downstream.clone(), Duration::from_millis(100));
        let (tx, mut rx) = mpsc::unbounded_channel::<QueryResult>();

        let mut ids = Vec::new();
        for _ in 0..3 {
            let query = query();
            ids.push(query.id);
            let tx = tx.clone();
            handle.dispatch(query, Box::new(move |r| drop(tx.send(r))));
        }
        for _ in 0..3 {
            assert!(rx.recv().await.unwrap().is_ok());
        }

        let sent = downstream.sent.lock().clone();
        assert_eq!(sent.iter().map(|(id, _)| *id).collect::<Vec<_>>(), ids);
        assert!(sent[1].1 - sent[0].1 >= Duration::from_millis(100));
        assert!(sent[2].1 - sent[1].1 >= Duration::from_millis(100));
    }

    #[tokio::test(start_paused = true)]
    async fn test_explicit_delay_overrides_default() {
        let downstream = Arc::new(RecordingDispatch::default());
        let handle = DelayDispatcher::spawn(downstream.clone(), Duration::from_secs(10));
        let (tx, mut rx) = mpsc::unbounded_channel::<QueryResult>();
        for _ in 0..2 {
            let tx = tx.clone();
            handle.send_with_callback_and_delay(
                query(),
                Box::new(move |r| drop(tx.send(r))),
                Duration::from_millis(5),
            );
        }
        rx.recv().await.unwrap().unwrap();
        rx.recv().await.unwrap().unwrap();
        let sent = downstream.sent.lock().clone();
        assert!(sent[1].1 - sent[0].1 < Duration::from_secs(1));
    }

    #[tokio::test(start_paused = true)]
    async fn test_dropping_handle_aborts_queued() {
        let downstream = Arc::new(RecordingDispatch::default());
        let handle = DelayDispatcher::spawn(downstream.clone(), Duration::from_secs(60));
        let (tx, mut rx) = mpsc::unbounded_channel::<QueryResult>();
        for _ in 0..3 {
            let tx = tx.clone();
            handle.dispatch(query(), Box::new(move |r| drop(tx.send(r))));
        }
        drop(handle);

        let mut results = Vec::new();
        for _ in 0..3 {
            results.push(rx.recv().await.unwrap());
        }
        assert_eq!(results.iter().filter(|r| r.is_ok()).count(), 1);
        assert_eq!(
            results
                .iter()
                .filter(|r| matches!(r, Err(TransportError::Aborted)))
                .count(),
            2
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_close_silent_discards_queued() {
        let downstream = Arc::new(RecordingDispatch::default());
        let handle = DelayDispatcher::spawn(downstream.clone(), Duration::from_secs(60));
        let (tx, mut rx) = mpsc::unbounded_channel::<QueryResult>();
        for _ in 0..3 {
            let tx = tx.clone();
            handle.dispatch(query(), Box::new(move |r| drop(tx.send(r))));
        }
        drop(tx);
        handle.close_silent();

        assert!(rx.recv().await.unwrap().is_ok());
        // Remaining callbacks were dropped without being called.
        assert!(rx.recv().await.is_none());
        assert_eq!(downstream.sent.lock().len(), 1);
    }
}
