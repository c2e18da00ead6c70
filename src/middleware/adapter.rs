//! Limiter adapter for HTTP request handling.

use std::sync::Arc;

use http::header::{HeaderMap, HeaderValue, CONTENT_TYPE};
use http::{Response, StatusCode};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, trace};

use super::headers::rate_limit_headers;
use crate::ratelimit::{Clock, IdentifierKey, KeyMode, Limiter, SystemClock};

/// Message returned to rejected callers when none is configured.
pub const DEFAULT_MESSAGE: &str = "Too many requests, please try again later.";

type IdentifierFn<C> = dyn Fn(&C) -> Option<String> + Send + Sync;
type MessageFn<C> = dyn Fn(&C) -> String + Send + Sync;

/// Message sent with a rejection.
pub enum RejectionMessage<C> {
    Static(String),
    Dynamic(Arc<MessageFn<C>>),
}

impl<C> RejectionMessage<C> {
    fn render(&self, ctx: &C) -> String {
        match self {
            RejectionMessage::Static(message) => message.clone(),
            RejectionMessage::Dynamic(f) => f(ctx),
        }
    }
}

/// JSON body of a rejection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RejectionBody {
    pub error: String,
    pub message: String,
    /// Seconds to wait before retrying
    pub retry_after: u64,
}

impl RejectionBody {
    pub fn to_json(&self) -> String {
        serde_json::json!({
            "error": self.error,
            "message": self.message,
            "retryAfter": self.retry_after,
        })
        .to_string()
    }
}

/// A request turned away by the limiter.
#[derive(Debug, Clone)]
pub struct Rejection {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: RejectionBody,
}

impl Rejection {
    /// Build the HTTP response for this rejection.
    pub fn into_response(self) -> Response<String> {
        let mut response = Response::new(self.body.to_json());
        *response.status_mut() = self.status;
        *response.headers_mut() = self.headers;
        response
            .headers_mut()
            .insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        response
    }
}

/// What the request path should do next.
#[derive(Debug, Clone)]
pub enum Verdict {
    /// Continue handling the request, attaching `headers` to the response.
    Proceed { headers: HeaderMap },
    /// Stop and answer with the rejection.
    Reject(Rejection),
}

impl Verdict {
    pub fn is_proceed(&self) -> bool {
        matches!(self, Verdict::Proceed { .. })
    }

    /// Rate limit headers for either outcome.
    pub fn headers(&self) -> &HeaderMap {
        match self {
            Verdict::Proceed { headers } => headers,
            Verdict::Reject(rejection) => &rejection.headers,
        }
    }
}

/// Applies a limiter to requests of context type `C`.
///
/// The identifier function resolves the caller for one key mode. A caller
/// that cannot be identified is always let through.
pub struct LimiterAdapter<C> {
    limiter: Arc<dyn Limiter>,
    mode: KeyMode,
    identifier: Arc<IdentifierFn<C>>,
    clock: Arc<dyn Clock>,
    status: StatusCode,
    message: RejectionMessage<C>,
    send_headers: bool,
}

impl<C> LimiterAdapter<C> {
    /// Create an adapter with the system clock, status 429 and the default message.
    pub fn new<F>(limiter: Arc<dyn Limiter>, mode: KeyMode, identifier: F) -> Self
    where
        F: Fn(&C) -> Option<String> + Send + Sync + 'static,
    {
        Self {
            limiter,
            mode,
            identifier: Arc::new(identifier),
            clock: Arc::new(SystemClock::new()),
            status: StatusCode::TOO_MANY_REQUESTS,
            message: RejectionMessage::Static(DEFAULT_MESSAGE.to_string()),
            send_headers: true,
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Status code used for rejections.
    pub fn with_status(mut self, status: StatusCode) -> Self {
        self.status = status;
        self
    }

    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = RejectionMessage::Static(message.into());
        self
    }

    /// Compute the rejection message from the request context.
    pub fn with_message_fn<F>(mut self, message: F) -> Self
    where
        F: Fn(&C) -> String + Send + Sync + 'static,
    {
        self.message = RejectionMessage::Dynamic(Arc::new(message));
        self
    }

    /// Whether rate limit headers are attached to responses.
    pub fn with_headers(mut self, send_headers: bool) -> Self {
        self.send_headers = send_headers;
        self
    }

    pub fn mode(&self) -> KeyMode {
        self.mode
    }

    /// Decide whether the request described by `ctx` may proceed.
    pub async fn evaluate(&self, ctx: &C) -> Verdict {
        let identifier = match (self.identifier)(ctx) {
            Some(id) if !id.is_empty() => id,
            _ => {
                trace!(mode = %self.mode, "No identifier for request, skipping rate limit");
                return Verdict::Proceed {
                    headers: HeaderMap::new(),
                };
            }
        };

        let key = IdentifierKey::new(self.mode, identifier);
        let decision = self
            .limiter
            .check(&key.to_string_key(), self.clock.now_ms())
            .await;

        let headers = if self.send_headers {
            rate_limit_headers(&decision)
        } else {
            HeaderMap::new()
        };

        if decision.allowed {
            debug!(
                mode = %key.mode,
                identifier = %key.identifier,
                action = "allowed",
                limit = decision.limit,
                remaining = decision.remaining,
                "Rate limit check"
            );
            return Verdict::Proceed { headers };
        }

        let retry_after_secs = decision.retry_after_secs().unwrap_or(0);
        info!(
            mode = %key.mode,
            identifier = %key.identifier,
            action = "blocked",
            limit = decision.limit,
            remaining = decision.remaining,
            retry_after_secs,
            "Rate limit check"
        );

        Verdict::Reject(Rejection {
            status: self.status,
            headers,
            body: RejectionBody {
                error: "Too Many Requests".to_string(),
                message: self.message.render(ctx),
                retry_after: retry_after_secs,
            },
        })
    }
}
