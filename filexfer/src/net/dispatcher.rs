//! Forwarding queries to a transport with completion callbacks.

use super::{Query, QueryResult, Transport};
use crate::error::TransportError;
use std::sync::Arc;
use tracing::trace;

/// Completion callback; invoked exactly once per dispatched query.
pub type QueryCallback = Box<dyn FnOnce(QueryResult) + Send + 'static>;

/// Something that accepts queries and eventually calls back.
pub trait Dispatch: Send + Sync + 'static {
    fn dispatch(&self, query: Query, callback: QueryCallback);
}

/// Runs each query on the transport as its own task.
///
/// The query races its cancellation token; a cancelled query completes with
/// [`TransportError::Canceled`].
pub struct NetDispatcher {
    transport: Arc<dyn Transport>,
}

impl NetDispatcher {
    pub fn new(transport: Arc<dyn Transport>) -> Self {
        Self { transport }
    }
}

impl Dispatch for NetDispatcher {
    fn dispatch(&self, query: Query, callback: QueryCallback) {
        let id = query.id;
        let cancel = query.cancel.clone();
        // Submitted here so the transport sees queries in dispatch order.
        let reply = (!cancel.is_cancelled()).then(|| self.transport.submit(query));
        tokio::spawn(async move {
            let result = match reply {
                None => Err(TransportError::Canceled),
                Some(reply) => tokio::select! {
                    biased;
                    _ = cancel.cancelled() => Err(TransportError::Canceled),
                    result = reply => result,
                },
            };
            trace!(query = id, ok = result.is_ok(), "query finished");
            callback(result);
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::location::DcId;
    use crate::net::{QueryClass, Request, Response, TransportFuture};
    use bytes::Bytes;
    use std::time::Duration;
    use tokio::sync::oneshot;

    struct SlowTransport;

    impl Transport for SlowTransport {
        fn submit(&self, _query: Query) -> TransportFuture {
            Box::pin(async {
                tokio::time::sleep(Duration::from_millis(50)).await;
                Ok(Response::PartSaved(true))
            })
        }
    }

    fn query() -> Query {
        Query::new(
            DcId(1),
            QueryClass::Upload,
            Request::SaveFilePart {
                file_id: 1,
                part: 0,
                bytes: Bytes::from_static(b"x"),
            },
        )
    }

    #[tokio::test]
    async fn test_dispatch_completes() {
        let dispatcher = NetDispatcher::new(Arc::new(SlowTransport));
        let (tx, rx) = oneshot::channel();
        dispatcher.dispatch(query(), Box::new(move |r| drop(tx.send(r))));
        let result = tokio::time::timeout(Duration::from_secs(1), rx)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(result, Ok(Response::PartSaved(true)));
    }

    #[tokio::test]
    async fn test_cancelled_query_reports_canceled() {
        let dispatcher = NetDispatcher::new(Arc::new(SlowTransport));
        let query = query();
        let cancel = query.cancel.clone();
        let (tx, rx) = oneshot::channel();
        dispatcher.dispatch(query, Box::new(move |r| drop(tx.send(r))));
        cancel.cancel();
        let result = tokio::time::timeout(Duration::from_secs(1), rx)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(result, Err(TransportError::Canceled));
    }
}
