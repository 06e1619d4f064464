//! Trigger execution.
//!
//! The executor turns one fire into one recorded [`Event`]. Failures of the
//! outbound call are captured in the event; only a failure to store the
//! event reaches the caller.

use crate::error::{CallError, ExecutorError};
use async_trait::async_trait;
use rootcause::Report;
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, instrument, warn};
use trigger_relay_core::Clock;
use trigger_relay_events::{Event, EventStatus, EventStore, NewEvent, RetentionPolicy};
use trigger_relay_trigger::{HttpMethod, Trigger, TriggerKind};

/// One outbound request.
#[derive(Debug, Clone, PartialEq)]
pub struct ApiRequest {
    pub method: HttpMethod,
    pub endpoint: String,
    pub headers: BTreeMap<String, String>,
    /// JSON body; `None` for methods without one.
    pub body: Option<Value>,
}

/// A 2xx response.
#[derive(Debug, Clone, PartialEq)]
pub struct ApiResponse {
    pub status: u16,
    /// Parsed JSON, or the raw text as a string when the body is not JSON.
    pub body: Value,
}

/// Performs the outbound call of an API trigger.
#[async_trait]
pub trait ApiCaller: Send + Sync {
    /// Sends the request. Non-2xx responses are errors.
    async fn call(&self, request: &ApiRequest) -> Result<ApiResponse, CallError>;
}

/// [`ApiCaller`] backed by a shared reqwest client.
#[derive(Debug, Clone)]
pub struct ReqwestApiCaller {
    client: reqwest::Client,
    timeout: Duration,
}

impl ReqwestApiCaller {
    /// Builds a caller whose requests give up after `timeout`.
    ///
    /// # Errors
    ///
    /// Returns an error if the HTTP client cannot be initialized.
    pub fn new(timeout: Duration) -> Result<Self, Report<CallError>> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| CallError::InvalidRequest {
                reason: e.to_string(),
            })?;
        Ok(Self { client, timeout })
    }

    fn classify(&self, err: &reqwest::Error) -> CallError {
        if err.is_timeout() {
            CallError::Timeout {
                after_secs: self.timeout.as_secs(),
            }
        } else if err.is_builder() {
            CallError::InvalidRequest {
                reason: err.to_string(),
            }
        } else {
            CallError::ConnectionFailed {
                reason: err.to_string(),
            }
        }
    }
}

fn parse_body(text: String) -> Value {
    if text.trim().is_empty() {
        return Value::Null;
    }
    serde_json::from_str(&text).unwrap_or(Value::String(text))
}

#[async_trait]
impl ApiCaller for ReqwestApiCaller {
    async fn call(&self, request: &ApiRequest) -> Result<ApiResponse, CallError> {
        let method = match request.method {
            HttpMethod::Get => reqwest::Method::GET,
            HttpMethod::Post => reqwest::Method::POST,
            HttpMethod::Put => reqwest::Method::PUT,
            HttpMethod::Delete => reqwest::Method::DELETE,
        };

        let mut builder = self.client.request(method, &request.endpoint);
        for (name, value) in &request.headers {
            builder = builder.header(name, value);
        }
        if let Some(body) = &request.body {
            builder = builder.json(body);
        }

        let response = builder.send().await.map_err(|e| self.classify(&e))?;
        let status = response.status();
        let text = response.text().await.map_err(|e| self.classify(&e))?;
        let body = parse_body(text);

        if !status.is_success() {
            return Err(CallError::Status {
                status: status.as_u16(),
                body,
            });
        }
        Ok(ApiResponse {
            status: status.as_u16(),
            body,
        })
    }
}

/// How an execution was requested.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ExecutionContext {
    pub is_test: bool,
    pub is_manual: bool,
    /// Replaces the trigger's default payload.
    pub payload: Option<Map<String, Value>>,
}

impl ExecutionContext {
    /// A timer-driven fire.
    #[must_use]
    pub fn scheduled() -> Self {
        Self::default()
    }

    /// A user-requested fire.
    #[must_use]
    pub fn manual(payload: Option<Map<String, Value>>) -> Self {
        Self {
            is_test: false,
            is_manual: true,
            payload,
        }
    }

    /// A fire of a definition under test.
    #[must_use]
    pub fn test(payload: Option<Map<String, Value>>) -> Self {
        Self {
            is_test: true,
            is_manual: false,
            payload,
        }
    }
}

/// Executes triggers and records their events.
#[derive(Clone)]
pub struct TriggerExecutor {
    caller: Arc<dyn ApiCaller>,
    events: Arc<dyn EventStore>,
    clock: Arc<dyn Clock>,
    policy: RetentionPolicy,
}

impl TriggerExecutor {
    #[must_use]
    pub fn new(
        caller: Arc<dyn ApiCaller>,
        events: Arc<dyn EventStore>,
        clock: Arc<dyn Clock>,
        policy: RetentionPolicy,
    ) -> Self {
        Self {
            caller,
            events,
            clock,
            policy,
        }
    }

    /// Executes `trigger` once and stores the resulting event.
    ///
    /// # Errors
    ///
    /// Returns [`ExecutorError::PersistenceFailed`] when the event cannot be
    /// stored. Any outbound side effect has already happened at that point.
    #[instrument(skip(self, trigger, context), fields(trigger_id = %trigger.id, is_test = context.is_test, is_manual = context.is_manual))]
    pub async fn execute(
        &self,
        trigger: &Trigger,
        context: ExecutionContext,
    ) -> Result<Event, Report<ExecutorError>> {
        let mut draft = match &trigger.kind {
            TriggerKind::Scheduled { .. } => {
                NewEvent::success(trigger.id, &trigger.name, trigger.trigger_type())
            }
            TriggerKind::Api { api_config } => {
                let mut draft =
                    NewEvent::success(trigger.id, &trigger.name, trigger.trigger_type());
                match api_config.resolve_payload(context.payload) {
                    Ok(payload) => {
                        let body = api_config.method.has_body().then_some(Value::Object(payload));
                        let request = ApiRequest {
                            method: api_config.method,
                            endpoint: api_config.endpoint.clone(),
                            headers: api_config.headers.clone(),
                            body,
                        };
                        draft.request_payload.clone_from(&request.body);
                        self.call(&request, &mut draft).await;
                    }
                    Err(e) => {
                        draft.status = EventStatus::Failed;
                        draft.error_message = Some(e.to_string());
                    }
                }
                draft
            }
        };
        draft.is_test = context.is_test;
        draft.is_manual = context.is_manual;

        let event = draft.into_event(self.clock.now(), &self.policy);
        if let Err(e) = self.events.create(event.clone()).await {
            error!(event_id = %event.id, error = %e, "execution happened but its event was not stored");
            return Err(ExecutorError::PersistenceFailed {
                trigger_id: trigger.id,
                reason: e.to_string(),
            }
            .into());
        }

        debug!(event_id = %event.id, status = %event.status, "execution recorded");
        Ok(event)
    }

    async fn call(&self, request: &ApiRequest, draft: &mut NewEvent) {
        match self.caller.call(request).await {
            Ok(response) => {
                draft.response_data = Some(response.body);
            }
            Err(e) => {
                warn!(endpoint = %request.endpoint, error = %e, "api call failed");
                draft.status = EventStatus::Failed;
                draft.error_message = Some(e.to_string());
                if let CallError::Status { body, .. } = e {
                    draft.response_data = Some(body);
                }
            }
        }
    }
}

impl std::fmt::Debug for TriggerExecutor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TriggerExecutor")
            .field("policy", &self.policy)
            .finish_non_exhaustive()
    }
}
