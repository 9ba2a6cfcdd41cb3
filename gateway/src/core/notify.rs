//! Outbound event notifications.
//!
//! Call and broadcast milestones are posted to the home automation event API
//! as `{url}/events/{prefix}{event_type}`. Delivery is best effort: a failed
//! post is logged and never affects the call it reports on.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{debug, warn};

use crate::core::broadcast::AggregateStatus;
use crate::core::model::{BroadcastId, JobId};
use crate::errors::{CallError, CallResult};
use crate::utils::Secret;

pub const DEFAULT_EVENT_PREFIX: &str = "phone_system_";

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum GatewayEvent {
    CallInitiated {
        call_id: JobId,
        phone_number: String,
        timestamp: DateTime<Utc>,
    },
    BroadcastStarted {
        broadcast_id: BroadcastId,
        name: String,
        total_numbers: usize,
    },
    BroadcastCompleted {
        broadcast_id: BroadcastId,
        name: String,
        total: usize,
        completed: usize,
        failed: usize,
        aggregate: Option<AggregateStatus>,
    },
}

impl GatewayEvent {
    pub fn event_type(&self) -> &'static str {
        match self {
            GatewayEvent::CallInitiated { .. } => "call_initiated",
            GatewayEvent::BroadcastStarted { .. } => "broadcast_started",
            GatewayEvent::BroadcastCompleted { .. } => "broadcast_completed",
        }
    }
}

#[derive(Clone)]
pub struct NotifierConfig {
    /// Base of the event API, e.g. `http://supervisor/core/api`
    pub url: String,
    pub token: Option<Secret>,
    pub prefix: String,
    pub timeout: Duration,
}

struct NotifierInner {
    client: reqwest::Client,
    url: String,
    token: Option<Secret>,
    prefix: String,
}

/// Cheap to clone; a disabled notifier drops every event.
#[derive(Clone, Default)]
pub struct EventNotifier {
    inner: Option<Arc<NotifierInner>>,
}

impl EventNotifier {
    pub fn disabled() -> Self {
        Self::default()
    }

    pub fn new(config: NotifierConfig) -> CallResult<Self> {
        let client = reqwest::Client::builder()
            .timeout(config.timeout)
            .build()
            .map_err(|e| {
                CallError::NotificationFailed(format!("failed to build HTTP client: {e}"))
            })?;

        Ok(Self {
            inner: Some(Arc::new(NotifierInner {
                client,
                url: config.url.trim_end_matches('/').to_string(),
                token: config.token.filter(|t| !t.is_empty()),
                prefix: config.prefix,
            })),
        })
    }

    pub fn is_enabled(&self) -> bool {
        self.inner.is_some()
    }

    fn build_request(inner: &NotifierInner, event: &GatewayEvent) -> reqwest::RequestBuilder {
        let url = format!("{}/events/{}{}", inner.url, inner.prefix, event.event_type());
        let request = inner
            .client
            .post(url)
            .header("Content-Type", "application/json")
            .json(event);

        match &inner.token {
            Some(token) => request.header("Authorization", format!("Bearer {}", token.expose())),
            None => request,
        }
    }

    /// Post one event and wait for the answer.
    pub async fn send(&self, event: &GatewayEvent) -> CallResult<()> {
        let Some(inner) = &self.inner else {
            return Ok(());
        };

        let response = Self::build_request(inner, event)
            .send()
            .await
            .map_err(|e| CallError::NotificationFailed(format!("request failed: {e}")))?;

        let status = response.status();
        if !status.is_success() {
            return Err(CallError::NotificationFailed(format!(
                "{} returned {status}",
                event.event_type()
            )));
        }
        debug!(event = event.event_type(), "Event fired");
        Ok(())
    }

    /// Fire and forget. Must be called from within the runtime.
    pub fn notify(&self, event: GatewayEvent) {
        if self.inner.is_none() {
            return;
        }
        let notifier = self.clone();
        tokio::spawn(async move {
            if let Err(e) = notifier.send(&event).await {
                warn!(event = event.event_type(), "Failed to fire event: {}", e);
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn notifier(token: Option<&str>) -> EventNotifier {
        EventNotifier::new(NotifierConfig {
            url: "http://supervisor/core/api/".to_string(),
            token: token.map(Secret::new),
            prefix: DEFAULT_EVENT_PREFIX.to_string(),
            timeout: Duration::from_secs(5),
        })
        .unwrap()
    }

    #[test]
    fn test_request_targets_prefixed_event() {
        let notifier = notifier(Some("ha-token"));
        let inner = notifier.inner.as_ref().unwrap();
        let event = GatewayEvent::BroadcastStarted {
            broadcast_id: BroadcastId::new(),
            name: "dinner".to_string(),
            total_numbers: 3,
        };

        let built = EventNotifier::build_request(inner, &event).build().unwrap();
        assert_eq!(
            built.url().as_str(),
            "http://supervisor/core/api/events/phone_system_broadcast_started"
        );
        assert_eq!(built.headers().get("Authorization").unwrap(), "Bearer ha-token");

        let body: serde_json::Value =
            serde_json::from_slice(built.body().unwrap().as_bytes().unwrap()).unwrap();
        assert_eq!(body["name"], "dinner");
        assert_eq!(body["total_numbers"], 3);
    }

    #[test]
    fn test_empty_token_sends_no_authorization() {
        let notifier = notifier(Some(""));
        let inner = notifier.inner.as_ref().unwrap();
        let event = GatewayEvent::CallInitiated {
            call_id: JobId::new(),
            phone_number: "+15550100".to_string(),
            timestamp: Utc::now(),
        };
        let built = EventNotifier::build_request(inner, &event).build().unwrap();
        assert!(built.headers().get("Authorization").is_none());
    }

    #[tokio::test]
    async fn test_disabled_notifier_is_a_no_op() {
        let notifier = EventNotifier::disabled();
        assert!(!notifier.is_enabled());
        let event = GatewayEvent::CallInitiated {
            call_id: JobId::new(),
            phone_number: "+15550100".to_string(),
            timestamp: Utc::now(),
        };
        assert!(notifier.send(&event).await.is_ok());
    }
}
