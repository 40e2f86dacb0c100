//! Query dispatch
//!
//! Shared fan-in component embedded by every serving transport. A server
//! hands each accepted query to the dispatcher together with an opaque
//! requester token; the dispatcher spawns one task per query, awaits the
//! upstream, and delivers the response back through the server's responder
//! with the same token attached.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::warn;

use super::upstream::Upstream;

/// Capability to route a resolved response back to its original requester
///
/// This is the only polymorphic hook a serving transport has to supply: the
/// UDP server sends on its socket, the DTLS server feeds its session layer,
/// the CoAP server fulfills a pending response slot.
#[async_trait]
pub trait Responder<R>: Send + Sync {
    async fn send_response_to_requester(&self, response: Vec<u8>, requester: R);
}

/// Dispatches accepted queries to the upstream client
///
/// Responses come back in upstream-completion order, not in query arrival
/// order; nothing is serialized per requester.
#[derive(Clone)]
pub struct Dispatcher {
    upstream: Arc<dyn Upstream>,
    timeout: Option<Duration>,
}

impl Dispatcher {
    /// Create a new dispatcher around the shared upstream client
    pub fn new(upstream: Arc<dyn Upstream>, timeout: Option<Duration>) -> Self {
        Self { upstream, timeout }
    }

    /// Get the per-query timeout handed to the upstream
    pub fn timeout(&self) -> Option<Duration> {
        self.timeout
    }

    /// Accept a query; returns immediately after scheduling the lookup
    ///
    /// A query the upstream cannot even parse is logged and dropped; the
    /// requester gets nothing and the server keeps running.
    pub fn dispatch<R: Send + 'static>(
        &self,
        query: Vec<u8>,
        requester: R,
        responder: Arc<dyn Responder<R>>,
    ) {
        let upstream = self.upstream.clone();
        let timeout = self.timeout;
        tokio::spawn(async move {
            match upstream.query(&query, timeout).await {
                Ok(response) => {
                    responder
                        .send_response_to_requester(response, requester)
                        .await;
                }
                Err(e) => {
                    warn!("Dropping unresolvable query ({} bytes): {}", query.len(), e);
                }
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ProxyResult;
    use tokio::sync::Mutex;

    /// Upstream that answers with its configured tag after a fixed delay
    struct SlowUpstream {
        tag: u8,
        delay: Duration,
    }

    #[async_trait]
    impl Upstream for SlowUpstream {
        async fn query(&self, _wire: &[u8], _timeout: Option<Duration>) -> ProxyResult<Vec<u8>> {
            tokio::time::sleep(self.delay).await;
            Ok(vec![self.tag])
        }
    }

    /// Upstream that always fails to parse its input
    struct BrokenUpstream;

    #[async_trait]
    impl Upstream for BrokenUpstream {
        async fn query(&self, wire: &[u8], _timeout: Option<Duration>) -> ProxyResult<Vec<u8>> {
            use hickory_proto::serialize::binary::BinDecodable;
            Err(crate::error::ProxyError::Dns(
                hickory_proto::op::Message::from_bytes(wire).unwrap_err(),
            ))
        }
    }

    #[derive(Default)]
    struct Collector {
        seen: Mutex<Vec<(Vec<u8>, &'static str)>>,
    }

    #[async_trait]
    impl Responder<&'static str> for Collector {
        async fn send_response_to_requester(&self, response: Vec<u8>, requester: &'static str) {
            self.seen.lock().await.push((response, requester));
        }
    }

    #[tokio::test]
    async fn test_responses_arrive_in_completion_order() {
        let collector = Arc::new(Collector::default());
        let slow = Dispatcher::new(
            Arc::new(SlowUpstream {
                tag: 1,
                delay: Duration::from_millis(80),
            }),
            None,
        );
        let fast = Dispatcher::new(
            Arc::new(SlowUpstream {
                tag: 2,
                delay: Duration::from_millis(10),
            }),
            None,
        );

        slow.dispatch(vec![0], "first", collector.clone());
        fast.dispatch(vec![0], "second", collector.clone());

        tokio::time::sleep(Duration::from_millis(200)).await;
        let seen = collector.seen.lock().await;
        assert_eq!(
            *seen,
            vec![(vec![2], "second"), (vec![1], "first")],
            "fast query must overtake the slow one"
        );
    }

    #[tokio::test]
    async fn test_unresolvable_query_is_dropped() {
        let collector = Arc::new(Collector::default());
        let dispatcher = Dispatcher::new(Arc::new(BrokenUpstream), None);
        dispatcher.dispatch(vec![0xff], "broken", collector.clone());

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(collector.seen.lock().await.is_empty());
    }
}
