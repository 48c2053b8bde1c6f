//! Scenario tests against a hand-rolled `MockConnectionFactory`, matching the teacher's
//! own style of implementing its connection-manager trait directly for a trivial test
//! type rather than reaching for a mocking framework.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures_util::stream;
use host_pool::{
    BodyChunk, ConnectionError, ConnectionFactory, HttpConnection, HttpRequest, HttpResponse, Pool, PoolConfigBuilder, PoolError,
    ResponseEntity,
};

/// A streamed response body to hand back: each chunk is produced `delay` after the
/// previous one, so a test can hold a response open for longer than some timeout.
type StreamSpec = (Vec<Bytes>, Duration);

#[derive(Clone)]
struct MockFactory {
    connect_count: Arc<AtomicU32>,
    send_count: Arc<AtomicU32>,
    fail_sends: Arc<AtomicU32>,
    hang_connects: Arc<AtomicU32>,
    stream_response: Arc<Mutex<Option<StreamSpec>>>,
}

impl MockFactory {
    fn new() -> Self {
        MockFactory {
            connect_count: Arc::new(AtomicU32::new(0)),
            send_count: Arc::new(AtomicU32::new(0)),
            fail_sends: Arc::new(AtomicU32::new(0)),
            hang_connects: Arc::new(AtomicU32::new(0)),
            stream_response: Arc::new(Mutex::new(None)),
        }
    }

    fn failing_sends(self, n: u32) -> Self {
        self.fail_sends.store(n, Ordering::SeqCst);
        self
    }

    fn hanging_connects(self, n: u32) -> Self {
        self.hang_connects.store(n, Ordering::SeqCst);
        self
    }

    /// Every response served from here on streams `chunks`, one every `delay`, instead of
    /// the default empty 200.
    fn streamed_response(self, chunks: &[&str], delay: Duration) -> Self {
        let chunks = chunks.iter().map(|c| Bytes::from(c.to_string())).collect();
        *self.stream_response.lock().unwrap() = Some((chunks, delay));
        self
    }
}

fn mock_error(msg: &str) -> Box<dyn std::error::Error + Send + Sync> {
    Box::new(host_pool::BodyError(msg.to_string()))
}

/// A `Stream<Item = BodyChunk>` that yields each of `chunks` after `delay`, for tests that
/// need a response body the pool can't finish draining instantly.
fn delayed_body_stream(chunks: Vec<Bytes>, delay: Duration) -> impl futures_core::Stream<Item = BodyChunk> + Send + 'static {
    stream::unfold((chunks, 0usize), move |(chunks, idx)| async move {
        if idx >= chunks.len() {
            return None;
        }
        tokio::time::sleep(delay).await;
        let chunk = chunks[idx].clone();
        Some((Ok(chunk), (chunks, idx + 1)))
    })
}

#[async_trait]
impl ConnectionFactory for MockFactory {
    type Connection = MockConnection;

    async fn connect(&self) -> Result<Self::Connection, ConnectionError> {
        loop {
            let remaining = self.hang_connects.load(Ordering::SeqCst);
            if remaining == 0 {
                break;
            }
            self.hang_connects.fetch_sub(1, Ordering::SeqCst);
            std::future::pending::<()>().await;
        }
        let id = self.connect_count.fetch_add(1, Ordering::SeqCst);
        Ok(MockConnection {
            id,
            send_count: self.send_count.clone(),
            fail_sends: self.fail_sends.clone(),
            stream_response: self.stream_response.clone(),
        })
    }
}

struct MockConnection {
    id: u32,
    send_count: Arc<AtomicU32>,
    fail_sends: Arc<AtomicU32>,
    stream_response: Arc<Mutex<Option<StreamSpec>>>,
}

#[async_trait]
impl HttpConnection for MockConnection {
    async fn send_request(&mut self, _request: HttpRequest) -> Result<HttpResponse, ConnectionError> {
        self.send_count.fetch_add(1, Ordering::SeqCst);
        if self.fail_sends.load(Ordering::SeqCst) > 0 {
            self.fail_sends.fetch_sub(1, Ordering::SeqCst);
            return Err(ConnectionError::FailedAfterEstablished(mock_error("connection reset")));
        }
        let response = HttpResponse::new(200).with_header("x-conn-id", self.id.to_string());
        match self.stream_response.lock().unwrap().clone() {
            Some((chunks, delay)) => Ok(response.with_entity(ResponseEntity::Streamed(Box::pin(delayed_body_stream(chunks, delay))))),
            None => Ok(response),
        }
    }

    async fn wait_closed(&mut self) -> ConnectionError {
        std::future::pending().await
    }

    async fn shutdown(self: Box<Self>) {}
}

use futures_util::StreamExt;

fn conn_id(resp: &host_pool::ResponseContext<u64>) -> String {
    resp.outcome
        .as_ref()
        .expect("expected a successful response")
        .headers
        .get("x-conn-id")
        .expect("mock always sets x-conn-id")
        .clone()
}

#[tokio::test]
async fn single_round_trip_succeeds() {
    let pool = Pool::new(MockFactory::new(), PoolConfigBuilder::new().max_connections(2).build());
    let resp = pool.send(HttpRequest::new("GET", "/"), 1u64).await;
    assert!(resp.outcome.is_ok());
    assert_eq!(resp.tag, 1);
}

#[tokio::test]
async fn concurrent_requests_open_distinct_connections() {
    let pool = Pool::new(MockFactory::new(), PoolConfigBuilder::new().max_connections(4).build());
    let (a, b) = tokio::join!(
        pool.send(HttpRequest::new("GET", "/a"), 1u64),
        pool.send(HttpRequest::new("GET", "/b"), 2u64)
    );
    assert_ne!(conn_id(&a), conn_id(&b));
}

#[tokio::test]
async fn sequential_requests_reuse_the_same_connection() {
    let pool = Pool::new(MockFactory::new(), PoolConfigBuilder::new().max_connections(2).build());
    let first = pool.send(HttpRequest::new("GET", "/"), 1u64).await;
    let second = pool.send(HttpRequest::new("GET", "/"), 2u64).await;
    assert_eq!(conn_id(&first), conn_id(&second));
}

#[tokio::test]
async fn retries_recover_from_a_connection_reset() {
    let factory = MockFactory::new().failing_sends(1);
    let pool = Pool::new(
        factory,
        PoolConfigBuilder::new().max_connections(2).max_retries(2).build(),
    );
    let resp = pool.send(HttpRequest::new("GET", "/"), 1u64).await;
    assert!(resp.outcome.is_ok(), "expected the retry to succeed: {:?}", resp.outcome);
}

#[tokio::test]
async fn exhausted_retries_surface_the_failure() {
    let factory = MockFactory::new().failing_sends(1);
    let pool = Pool::new(
        factory,
        PoolConfigBuilder::new().max_connections(2).max_retries(0).build(),
    );
    let resp = pool.send(HttpRequest::new("GET", "/"), 1u64).await;
    assert!(matches!(resp.outcome, Err(PoolError::ConnectionFailedAfterEstablished)));
}

#[tokio::test]
async fn min_connections_are_preconnected_and_reused() {
    let factory = MockFactory::new();
    let connect_count = factory.connect_count.clone();
    let pool = Pool::new(
        factory,
        PoolConfigBuilder::new().max_connections(4).min_connections(2).build(),
    );
    for _ in 0..200 {
        if connect_count.load(Ordering::SeqCst) >= 2 {
            break;
        }
        tokio::task::yield_now().await;
    }
    assert_eq!(connect_count.load(Ordering::SeqCst), 2, "expected two preconnected slots");

    let resp = pool.send(HttpRequest::new("GET", "/"), 1u64).await;
    assert!(resp.outcome.is_ok());
    assert_eq!(
        connect_count.load(Ordering::SeqCst),
        2,
        "serving from a warm slot shouldn't open a third connection"
    );
}

#[tokio::test]
async fn dropping_every_pool_handle_fails_outstanding_requests() {
    let factory = MockFactory::new().hanging_connects(1);
    let pool = Pool::new(factory, PoolConfigBuilder::new().max_connections(1).build());
    let outstanding = pool.send(HttpRequest::new("GET", "/"), 7u64);
    let handle = tokio::spawn(outstanding);

    // Give the stage a chance to pick up the request and start the (hung) connect
    // attempt before we drop every handle.
    for _ in 0..50 {
        tokio::task::yield_now().await;
    }
    drop(pool);

    let resp = handle.await.expect("task should not panic");
    assert!(matches!(resp.outcome, Err(PoolError::PoolShutdown)));
    assert_eq!(resp.tag, 7);
}

#[tokio::test]
async fn idle_connection_times_out_then_a_later_request_reconnects() {
    let factory = MockFactory::new();
    let connect_count = factory.connect_count.clone();
    let pool = Pool::new(
        factory,
        PoolConfigBuilder::new()
            .max_connections(1)
            .idle_timeout(Some(Duration::from_millis(20)))
            .build(),
    );
    let first = pool.send(HttpRequest::new("GET", "/"), 1u64).await;
    assert!(first.outcome.is_ok());
    assert_eq!(connect_count.load(Ordering::SeqCst), 1);

    tokio::time::sleep(Duration::from_millis(100)).await;

    let second = pool.send(HttpRequest::new("GET", "/"), 2u64).await;
    assert!(second.outcome.is_ok());
    assert_eq!(connect_count.load(Ordering::SeqCst), 2, "idle timeout should have dropped the first connection");
}

#[tokio::test]
async fn streamed_response_drains_fully_and_slot_returns_to_idle() {
    let factory = MockFactory::new().streamed_response(&["chunk-a", "chunk-b"], Duration::from_millis(1));
    let connect_count = factory.connect_count.clone();
    let pool = Pool::new(factory, PoolConfigBuilder::new().max_connections(1).build());

    let first = pool.send(HttpRequest::new("GET", "/"), 1u64).await;
    let first_conn_id = conn_id(&first);
    match first.outcome.expect("first response should succeed").entity {
        ResponseEntity::Streamed(mut body) => {
            let mut collected = Vec::new();
            while let Some(chunk) = body.next().await {
                collected.push(chunk.expect("chunk should not fail"));
            }
            assert_eq!(collected, vec![Bytes::from("chunk-a"), Bytes::from("chunk-b")]);
        }
        other => panic!("expected a streamed entity, got {other:?}"),
    }

    // Draining the body to completion should have returned the slot to `Idle`, not closed
    // the connection, so a request right behind it reuses the same connection.
    let second = pool.send(HttpRequest::new("GET", "/"), 2u64).await;
    assert_eq!(conn_id(&second), first_conn_id);
    assert_eq!(connect_count.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn unsubscribed_streamed_response_times_out_and_recycles_the_connection() {
    let factory = MockFactory::new().streamed_response(&["chunk-a"], Duration::from_millis(1));
    let connect_count = factory.connect_count.clone();
    let pool = Pool::new(
        factory,
        PoolConfigBuilder::new()
            .max_connections(1)
            .response_entity_subscription_timeout(Duration::from_millis(20))
            .build(),
    );

    let first = pool.send(HttpRequest::new("GET", "/"), 1u64).await;
    assert!(first.outcome.is_ok());
    // Never poll the returned entity. After the subscription timeout the slot should kill
    // it and close the connection rather than leave it occupied forever.
    drop(first);

    tokio::time::sleep(Duration::from_millis(100)).await;

    let second = pool.send(HttpRequest::new("GET", "/"), 2u64).await;
    assert!(second.outcome.is_ok());
    assert_eq!(
        connect_count.load(Ordering::SeqCst),
        2,
        "an un-subscribed response entity should have timed out and recycled the connection"
    );
}

#[tokio::test]
async fn streaming_response_survives_past_the_idle_timeout() {
    // chunk delay * chunk count comfortably exceeds idle_timeout: while the caller is
    // draining the body, the slot must not be torn down as if it were sitting idle.
    let factory = MockFactory::new().streamed_response(&["chunk-a", "chunk-b", "chunk-c"], Duration::from_millis(30));
    let connect_count = factory.connect_count.clone();
    let pool = Pool::new(
        factory,
        PoolConfigBuilder::new()
            .max_connections(1)
            .idle_timeout(Some(Duration::from_millis(10)))
            .build(),
    );

    let first = pool.send(HttpRequest::new("GET", "/"), 1u64).await;
    let first_conn_id = conn_id(&first);
    match first.outcome.expect("response should succeed despite the slow body").entity {
        ResponseEntity::Streamed(mut body) => {
            let mut count = 0;
            while let Some(chunk) = body.next().await {
                chunk.expect("chunk should not fail");
                count += 1;
            }
            assert_eq!(count, 3);
        }
        other => panic!("expected a streamed entity, got {other:?}"),
    }

    let second = pool.send(HttpRequest::new("GET", "/"), 2u64).await;
    assert_eq!(
        conn_id(&second),
        first_conn_id,
        "a response that outlasted idle_timeout while being actively drained should not have been recycled"
    );
    assert_eq!(connect_count.load(Ordering::SeqCst), 1);
}
