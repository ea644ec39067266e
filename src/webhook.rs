// webhook.rs
use axum::body::Bytes;
use axum::http::HeaderMap;
use chrono::{DateTime, Utc};
use serde::Deserialize;
use serde_json::{Map, Value};
use tracing::{debug, info};

use crate::bus::Bus;
use crate::error::IngressError;
use crate::signature;

pub const SIGNATURE_HEADER: &str = "X-Signature";
pub const TIMESTAMP_HEADER: &str = "X-Timestamp";

/// Values above this are read as milliseconds rather than seconds.
const MILLIS_THRESHOLD: i64 = 100_000_000_000;

/// The request exactly as received: raw body bytes plus the vendor headers.
#[derive(Debug, Clone)]
pub struct CapturedRequest {
    pub raw_body: Bytes,
    pub signature: Option<String>,
    pub timestamp: Option<String>,
}

impl CapturedRequest {
    pub fn from_parts(headers: &HeaderMap, raw_body: Bytes) -> Self {
        Self {
            raw_body,
            signature: header_value(headers, SIGNATURE_HEADER),
            timestamp: header_value(headers, TIMESTAMP_HEADER),
        }
    }
}

fn header_value(headers: &HeaderMap, name: &str) -> Option<String> {
    headers
        .get(name)
        .and_then(|h| h.to_str().ok())
        .filter(|v| !v.is_empty())
        .map(str::to_string)
}

/// Typed view of a vendor payload, used for routing and gating only.
#[derive(Debug, Clone, Deserialize)]
pub struct WebhookEvent {
    pub session_id: Option<Value>,
    pub status: Option<Value>,
    pub created_at: Option<Value>,
    pub vendor_data: Option<Value>,
    pub decision: Option<Value>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl WebhookEvent {
    /// The fan-out key, when it is a non-empty string.
    pub fn session_id(&self) -> Option<&str> {
        self.session_id
            .as_ref()
            .and_then(Value::as_str)
            .filter(|s| !s.is_empty())
    }

    pub fn has_decision(&self) -> bool {
        self.decision.as_ref().is_some_and(is_truthy)
    }
}

fn is_truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().is_some_and(|f| f != 0.0),
        Value::String(s) => !s.is_empty(),
        Value::Array(_) | Value::Object(_) => true,
    }
}

/// An authenticated payload: the typed view plus the JSON forwarded verbatim.
#[derive(Debug, Clone)]
pub struct ParsedWebhook {
    pub event: WebhookEvent,
    pub payload: Value,
}

/// Which authenticated events reach subscribers.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryGate {
    /// Forward every authenticated event.
    #[default]
    Always,
    /// Forward only events carrying a final `decision`.
    Decision,
}

impl DeliveryGate {
    pub fn admits(&self, event: &WebhookEvent) -> bool {
        match self {
            DeliveryGate::Always => true,
            DeliveryGate::Decision => event.has_decision(),
        }
    }
}

/// What happened to an accepted webhook. All three are acknowledged with 200.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dispatch {
    Published,
    Held,
    Unroutable,
}

#[derive(Debug, Clone)]
pub struct WebhookHandler {
    secret: Option<String>,
    timestamp_tolerance_secs: Option<u64>,
    gate: DeliveryGate,
}

impl WebhookHandler {
    pub fn new(secret: Option<&str>, gate: DeliveryGate) -> Self {
        Self {
            secret: secret.filter(|s| !s.is_empty()).map(str::to_string),
            timestamp_tolerance_secs: None,
            gate,
        }
    }

    pub fn with_timestamp_tolerance(mut self, secs: Option<u64>) -> Self {
        self.timestamp_tolerance_secs = secs;
        self
    }

    /// Run one request through authenticate, parse, gate and publish.
    pub async fn handle(
        &self,
        request: &CapturedRequest,
        bus: &dyn Bus,
    ) -> Result<Dispatch, IngressError> {
        self.authenticate(request)?;
        let parsed = self.parse(&request.raw_body)?;

        let Some(session_id) = parsed.event.session_id() else {
            debug!("authenticated webhook has no session_id");
            return Ok(Dispatch::Unroutable);
        };

        if !self.gate.admits(&parsed.event) {
            info!(session_id, "webhook acknowledged without a decision, not forwarded");
            return Ok(Dispatch::Held);
        }

        bus.publish(session_id, &parsed.payload)
            .await
            .map_err(IngressError::Publish)?;

        info!(session_id, "webhook event dispatched");
        Ok(Dispatch::Published)
    }

    pub fn authenticate(&self, request: &CapturedRequest) -> Result<(), IngressError> {
        let signature = request
            .signature
            .as_deref()
            .ok_or(IngressError::MissingCredentials("signature header"))?;
        let timestamp = request
            .timestamp
            .as_deref()
            .ok_or(IngressError::MissingCredentials("timestamp header"))?;
        if request.raw_body.is_empty() {
            return Err(IngressError::MissingCredentials("request body"));
        }
        let secret = self
            .secret
            .as_deref()
            .ok_or(IngressError::MissingCredentials("webhook secret"))?;

        if !signature::verify(secret.as_bytes(), &request.raw_body, signature) {
            return Err(IngressError::InvalidSignature);
        }

        self.check_freshness(timestamp)
    }

    fn check_freshness(&self, timestamp: &str) -> Result<(), IngressError> {
        let Some(tolerance) = self.timestamp_tolerance_secs else {
            return Ok(());
        };

        let sent = parse_timestamp(timestamp).ok_or(IngressError::StaleTimestamp)?;
        let skew = (Utc::now() - sent).num_seconds().unsigned_abs();
        if skew > tolerance {
            return Err(IngressError::StaleTimestamp);
        }
        Ok(())
    }

    pub fn parse(&self, raw_body: &[u8]) -> Result<ParsedWebhook, IngressError> {
        let payload: Value = serde_json::from_slice(raw_body)?;
        let event = WebhookEvent::deserialize(&payload)?;
        Ok(ParsedWebhook { event, payload })
    }
}

/// Unix seconds, Unix milliseconds, or RFC 3339.
fn parse_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    let raw = raw.trim();
    if let Ok(n) = raw.parse::<i64>() {
        return if n.abs() >= MILLIS_THRESHOLD {
            DateTime::from_timestamp_millis(n)
        } else {
            DateTime::from_timestamp(n, 0)
        };
    }
    DateTime::parse_from_rfc3339(raw)
        .ok()
        .map(|dt| dt.with_timezone(&Utc))
}
