//! The data model the pool reasons about: requests and responses flowing
//! through the stage, paired with the caller's correlation tag.

use std::collections::HashMap;

use crate::entity::{RequestEntity, ResponseEntity};
use crate::error::PoolError;

/// A minimal, transport-agnostic stand-in for an HTTP request. Wire parsing, TLS, and
/// the "real" request type are external collaborators; this crate only
/// needs enough of the shape to drive the pool's state machine and close-after logic.
#[derive(Debug, Clone)]
pub struct HttpRequest {
    pub method: String,
    pub uri: String,
    pub headers: HashMap<String, String>,
    pub entity: RequestEntity,
}

impl HttpRequest {
    /// A bare request with no body, e.g. `GET`.
    pub fn new(method: impl Into<String>, uri: impl Into<String>) -> Self {
        HttpRequest {
            method: method.into(),
            uri: uri.into(),
            headers: HashMap::new(),
            entity: RequestEntity::Empty,
        }
    }

    pub fn with_entity(mut self, entity: RequestEntity) -> Self {
        self.entity = entity;
        self
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name.into(), value.into());
        self
    }

    /// Whether the request asked the connection to be closed after this exchange.
    pub fn wants_connection_close(&self) -> bool {
        header_says_close(&self.headers)
    }
}

/// A minimal stand-in for an HTTP response.
#[derive(Debug, Clone)]
pub struct HttpResponse {
    pub status: u16,
    pub headers: HashMap<String, String>,
    pub entity: ResponseEntity,
}

impl HttpResponse {
    pub fn new(status: u16) -> Self {
        HttpResponse {
            status,
            headers: HashMap::new(),
            entity: ResponseEntity::Empty,
        }
    }

    pub fn with_entity(mut self, entity: ResponseEntity) -> Self {
        self.entity = entity;
        self
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name.into(), value.into());
        self
    }

    pub fn wants_connection_close(&self) -> bool {
        header_says_close(&self.headers)
    }
}

fn header_says_close(headers: &HashMap<String, String>) -> bool {
    headers
        .iter()
        .find(|(k, _)| k.eq_ignore_ascii_case("connection"))
        .map(|(_, v)| v.eq_ignore_ascii_case("close"))
        .unwrap_or(false)
}

/// A request together with its retry budget and the caller's opaque correlation tag.
///
/// Immutable; retrying produces a new `RequestContext` with `retries_left` decremented
/// `T` is never inspected by the pool — it is only ever cloned and handed
/// back on the paired [`ResponseContext`].
#[derive(Debug, Clone)]
pub struct RequestContext<T> {
    pub request: HttpRequest,
    pub retries_left: u32,
    pub tag: T,
}

impl<T: Clone> RequestContext<T> {
    pub fn new(request: HttpRequest, retries_left: u32, tag: T) -> Self {
        RequestContext {
            request,
            retries_left,
            tag,
        }
    }

    /// Produces the context for a retry attempt, or `None` if the retry budget is
    /// exhausted. Retrying the Nth time yields
    /// `retries_left == max_retries - N`.
    pub fn into_retry(self) -> Option<Self> {
        if self.retries_left == 0 {
            None
        } else {
            Some(RequestContext {
                retries_left: self.retries_left - 1,
                ..self
            })
        }
    }
}

/// The result handed back to the caller, tagged with the same correlation value they
/// submitted alongside the request.
#[derive(Debug, Clone)]
pub struct ResponseContext<T> {
    pub tag: T,
    pub outcome: Result<HttpResponse, PoolError>,
}
