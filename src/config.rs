//! Pool configuration, following a fluent `Builder` idiom: a setter per field,
//! validated with `assert!` at the point a value is set (or at `build()` for
//! cross-field invariants), mirroring `bb8::Builder`.

use std::time::Duration;

/// Every tunable the pool stage consults, including `response_timeout` (needed by
/// `WaitingForResponse`'s `stateTimeout` but easy to leave out of a summary
/// table — see DESIGN.md).
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Hard upper bound on concurrent slots.
    pub max_connections: u32,
    /// Target warm connections; drives preconnect.
    pub min_connections: u32,
    /// Initial `retries_left` per request.
    pub max_retries: u32,
    /// Upstream buffer bound; enforced by the channel the pool's input is built on, not
    /// by the stage itself.
    pub max_open_requests: usize,
    /// Max concurrent in-flight requests per connection. This implementation only
    /// supports `1` (HTTP/2 multiplexing and pipelining reordering are out of scope
    /// reordering; see DESIGN.md), so `build()` rejects any other value.
    pub pipelining_limit: u32,
    /// `Idle` state's `stateTimeout`.
    pub idle_timeout: Option<Duration>,
    /// `WaitingForResponse`'s `stateTimeout`.
    pub response_timeout: Duration,
    /// Deadline for the caller to subscribe to a streamed response entity.
    pub response_entity_subscription_timeout: Duration,
    /// Per-connection recycling horizon; jitter of up to 10% (floor 2ms) is added when a
    /// connection is established.
    pub max_connection_lifetime: Option<Duration>,
    /// Initial embargo after the first connect failure in a cascade.
    pub base_connection_backoff: Duration,
    /// Embargo ceiling. The effective ceiling for the base/doubling component is half of
    /// this value; jitter adds up to the other half.
    pub max_connection_backoff: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        PoolConfig {
            max_connections: 4,
            min_connections: 0,
            max_retries: 3,
            max_open_requests: 32,
            pipelining_limit: 1,
            idle_timeout: Some(Duration::from_secs(60)),
            response_timeout: Duration::from_secs(30),
            response_entity_subscription_timeout: Duration::from_secs(10),
            max_connection_lifetime: None,
            base_connection_backoff: Duration::from_millis(100),
            max_connection_backoff: Duration::from_secs(60),
        }
    }
}

/// A builder for [`PoolConfig`], following `bb8::Builder`'s style: defaults via
/// `Default`, fluent `fn field(mut self, v) -> Self` setters, `assert!`-validated as
/// values come in, with cross-field checks deferred to `build()`.
#[derive(Debug, Clone)]
pub struct PoolConfigBuilder {
    inner: PoolConfig,
}

impl Default for PoolConfigBuilder {
    fn default() -> Self {
        PoolConfigBuilder {
            inner: PoolConfig::default(),
        }
    }
}

impl PoolConfigBuilder {
    /// Constructs a new `PoolConfigBuilder` with every field at its default value.
    pub fn new() -> Self {
        Default::default()
    }

    /// Sets the maximum number of connections managed by the pool.
    ///
    /// Defaults to 4.
    pub fn max_connections(mut self, max_connections: u32) -> Self {
        assert!(max_connections > 0, "max_connections must be greater than zero!");
        self.inner.max_connections = max_connections;
        self
    }

    /// Sets the minimum number of connections the pool tries to keep warm.
    ///
    /// Defaults to 0.
    pub fn min_connections(mut self, min_connections: u32) -> Self {
        self.inner.min_connections = min_connections;
        self
    }

    /// Sets the number of times a request may be retried on a fresh slot after a
    /// connection-level failure.
    ///
    /// Defaults to 3.
    pub fn max_retries(mut self, max_retries: u32) -> Self {
        self.inner.max_retries = max_retries;
        self
    }

    /// Sets the upstream buffer bound enforced by the pool's request channel.
    ///
    /// Defaults to 32.
    pub fn max_open_requests(mut self, max_open_requests: usize) -> Self {
        assert!(max_open_requests > 0, "max_open_requests must be greater than zero!");
        self.inner.max_open_requests = max_open_requests;
        self
    }

    /// Sets the idle timeout used by the pool.
    ///
    /// Defaults to 60 seconds.
    pub fn idle_timeout(mut self, idle_timeout: Option<Duration>) -> Self {
        assert!(
            idle_timeout != Some(Duration::from_secs(0)),
            "idle_timeout must be greater than zero!"
        );
        self.inner.idle_timeout = idle_timeout;
        self
    }

    /// Sets the deadline by which a caller must subscribe to a streamed response entity.
    ///
    /// Defaults to 10 seconds.
    pub fn response_entity_subscription_timeout(mut self, timeout: Duration) -> Self {
        assert!(
            timeout > Duration::from_secs(0),
            "response_entity_subscription_timeout must be non-zero"
        );
        self.inner.response_entity_subscription_timeout = timeout;
        self
    }

    /// Sets how long a slot waits for a response before treating the connection as failed.
    ///
    /// Defaults to 30 seconds.
    pub fn response_timeout(mut self, timeout: Duration) -> Self {
        assert!(timeout > Duration::from_secs(0), "response_timeout must be non-zero");
        self.inner.response_timeout = timeout;
        self
    }

    /// Sets the maximum lifetime of connections in the pool.
    ///
    /// Defaults to `None` (no recycling).
    pub fn max_connection_lifetime(mut self, max_connection_lifetime: Option<Duration>) -> Self {
        assert!(
            max_connection_lifetime != Some(Duration::from_secs(0)),
            "max_connection_lifetime must be greater than zero!"
        );
        self.inner.max_connection_lifetime = max_connection_lifetime;
        self
    }

    /// Sets the initial connection-failure backoff.
    ///
    /// Defaults to 100ms.
    pub fn base_connection_backoff(mut self, base: Duration) -> Self {
        assert!(base > Duration::from_secs(0), "base_connection_backoff must be non-zero");
        self.inner.base_connection_backoff = base;
        self
    }

    /// Sets the connection-failure backoff ceiling.
    ///
    /// Defaults to 60 seconds.
    pub fn max_connection_backoff(mut self, max: Duration) -> Self {
        assert!(max > Duration::from_secs(0), "max_connection_backoff must be non-zero");
        self.inner.max_connection_backoff = max;
        self
    }

    /// Consumes the builder, validating cross-field invariants.
    ///
    /// # Panics
    ///
    /// Panics if `min_connections > max_connections`, if `base_connection_backoff` is
    /// larger than `max_connection_backoff`, or if `pipelining_limit != 1` (the only
    /// value this implementation supports; see the field's docs on [`PoolConfig`]).
    pub fn build(self) -> PoolConfig {
        assert!(
            self.inner.max_connections >= self.inner.min_connections,
            "min_connections must be no larger than max_connections"
        );
        assert!(
            self.inner.base_connection_backoff <= self.inner.max_connection_backoff,
            "base_connection_backoff must be no larger than max_connection_backoff"
        );
        assert_eq!(
            self.inner.pipelining_limit, 1,
            "pipelining_limit > 1 is not supported by this implementation"
        );
        self.inner
    }
}
