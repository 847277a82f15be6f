// Callback delivery engine
// Non-blocking HTTP delivery of messages to business endpoints

//! # Callback Delivery
//!
//! Delivers one message to one business endpoint and reports exactly one
//! terminal outcome. The engine never retries on its own; a failed attempt
//! is recorded and the [`CompensationWorker`](super::worker::CompensationWorker)
//! picks it up again when its retry is due.
//!
//! ## Delivery Lifecycle
//!
//! ```text
//! Created -> PermitAcquired -> Sent -> Succeeded        -> Released
//!                                   -> FailedResponse
//!                                   -> FailedTransport
//!                                   -> Cancelled
//! ```
//!
//! 1. **Created**: the caller builds a [`DeliveryRequest`].
//! 2. **PermitAcquired**: [`CallbackDeliveryEngine::deliver`] waits for a
//!    slot in the endpoint's concurrency budget. If the wait is cancelled no
//!    request is sent and nothing is recorded ([`DeliveryOutcome::Abandoned`]).
//! 3. **Sent**: the POST runs on its own Tokio task. `deliver` returns a
//!    [`DeliveryHandle`] as soon as the task is spawned.
//! 4. **Classified**: success means status `200` and a body equal to `ok`
//!    or `"ok"`, ignoring case. Everything else is a failure.
//! 5. **Released**: the permit is dropped when the task ends, whichever way
//!    it ends.
//!
//! ## Timeouts
//!
//! - connect: client-wide, from `callback.connect_timeout_ms`
//! - request: per callback `timeout_ms`, falling back to
//!   `callback.default_socket_timeout_ms` when zero
//!
//! The permit wait is not bounded by either timeout; only cancellation ends it.

use std::sync::Arc;
use std::time::{Duration, Instant};

use reqwest::header::CONTENT_TYPE;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use url::Url;

use super::outcome::OutcomeRecorder;
use super::semaphore::{CallbackPermit, SemaphoreRegistry};
use crate::models::{CallbackConfig, Message, MessageCompensate};
use crate::settings::CallbackSettings;
use crate::{MessageBusError, Result};

/// Content type used when a callback does not configure one
pub const DEFAULT_CONTENT_TYPE: &str = "application/json";

/// Body recorded when a delivery is cancelled mid-flight
pub const CANCELLED_BODY: &str = "http cancelled";

/// Whether a business endpoint acknowledged the message
///
/// ```rust
/// # use message_bus::engine::callback::is_callback_success;
/// assert!(is_callback_success(200, "OK"));
/// assert!(is_callback_success(200, "\"ok\""));
/// assert!(!is_callback_success(500, "ok"));
/// ```
pub fn is_callback_success(status: u16, body: &str) -> bool {
    status == 200 && (body.eq_ignore_ascii_case("ok") || body.eq_ignore_ascii_case("\"ok\""))
}

/// `Content-Type` header value for a callback
pub fn content_type_header(content_type: Option<&str>) -> String {
    match content_type {
        Some(content_type) if !content_type.trim().is_empty() => {
            format!("{};charset=utf-8", content_type.trim())
        }
        _ => format!("{};charset=utf-8", DEFAULT_CONTENT_TYPE),
    }
}

/// Terminal outcome of one delivery attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryOutcome {
    /// Endpoint answered `200 ok`
    Succeeded,
    /// Endpoint answered, but not with `200 ok`
    FailedResponse { status: u16 },
    /// No usable response: connect error, timeout, bad URL
    FailedTransport,
    /// Cancelled after the request was sent
    Cancelled,
    /// Gave up before sending; nothing was recorded
    Abandoned,
}

impl DeliveryOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, DeliveryOutcome::Succeeded)
    }
}

/// One message bound for one endpoint
#[derive(Debug, Clone)]
pub struct DeliveryRequest {
    pub message: Arc<Message>,
    /// The compensation record being worked off, `None` for a direct callback
    pub compensate: Option<MessageCompensate>,
    pub callback: CallbackConfig,
}

impl DeliveryRequest {
    /// Direct callback with no compensation record behind it
    pub fn direct(message: Arc<Message>, callback: CallbackConfig) -> Self {
        Self {
            message,
            compensate: None,
            callback,
        }
    }

    /// Redelivery of a compensation record
    pub fn compensation(record: MessageCompensate, callback: CallbackConfig) -> Self {
        Self {
            message: Arc::new(record.to_message()),
            compensate: Some(record),
            callback,
        }
    }
}

enum HandleState {
    Done(DeliveryOutcome),
    Running(JoinHandle<DeliveryOutcome>),
}

/// Caller's view of an in-flight delivery
pub struct DeliveryHandle {
    cancel: CancellationToken,
    state: HandleState,
}

impl DeliveryHandle {
    /// Ask the delivery to stop; a finished delivery is unaffected
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn is_finished(&self) -> bool {
        match &self.state {
            HandleState::Done(_) => true,
            HandleState::Running(task) => task.is_finished(),
        }
    }

    /// Wait for the terminal outcome
    pub async fn outcome(self) -> DeliveryOutcome {
        match self.state {
            HandleState::Done(outcome) => outcome,
            HandleState::Running(task) => match task.await {
                Ok(outcome) => outcome,
                Err(e) => {
                    error!(error = %e, "delivery task did not complete");
                    DeliveryOutcome::Abandoned
                }
            },
        }
    }
}

/// Delivers messages to business endpoints under per-endpoint limits
#[derive(Clone)]
pub struct CallbackDeliveryEngine {
    client: reqwest::Client,
    semaphores: Arc<SemaphoreRegistry>,
    recorder: Arc<dyn OutcomeRecorder>,
    default_timeout: Duration,
    shutdown: CancellationToken,
}

impl CallbackDeliveryEngine {
    pub fn new(
        semaphores: Arc<SemaphoreRegistry>,
        recorder: Arc<dyn OutcomeRecorder>,
        settings: &CallbackSettings,
    ) -> Result<Self> {
        let client = reqwest::Client::builder()
            .connect_timeout(settings.connect_timeout())
            .user_agent(settings.user_agent.clone())
            .build()?;

        Ok(Self {
            client,
            semaphores,
            recorder,
            default_timeout: Duration::from_millis(settings.default_socket_timeout_ms),
            shutdown: CancellationToken::new(),
        })
    }

    pub fn semaphores(&self) -> &Arc<SemaphoreRegistry> {
        &self.semaphores
    }

    /// Token cancelled by [`shutdown`](Self::shutdown); every delivery
    /// listens to a child of it
    pub fn shutdown_token(&self) -> &CancellationToken {
        &self.shutdown
    }

    /// Cancel every pending permit wait and in-flight request
    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }

    fn request_timeout(&self, callback: &CallbackConfig) -> Duration {
        if callback.timeout_ms == 0 {
            self.default_timeout
        } else {
            Duration::from_millis(callback.timeout_ms)
        }
    }

    /// Start delivering `request`
    ///
    /// Waits only for the endpoint's concurrency permit; the HTTP exchange
    /// runs on a spawned task behind the returned handle.
    pub async fn deliver(&self, request: DeliveryRequest) -> DeliveryHandle {
        let cancel = self.shutdown.child_token();
        let callback_key = request.callback.callback_key.clone();

        let permit = match self
            .semaphores
            .acquire(&callback_key, request.callback.max_concurrency, &cancel)
            .await
        {
            Ok(permit) => permit,
            Err(e) => {
                warn!(
                    app_code = %request.message.app_code,
                    uuid = %request.message.uuid,
                    callback_key = %callback_key,
                    error = %e,
                    "callback permit not acquired, delivery abandoned"
                );
                return DeliveryHandle {
                    cancel,
                    state: HandleState::Done(DeliveryOutcome::Abandoned),
                };
            }
        };

        let engine = self.clone();
        let task_cancel = cancel.clone();
        let task = tokio::spawn(async move { engine.run(request, permit, task_cancel).await });

        DeliveryHandle {
            cancel,
            state: HandleState::Running(task),
        }
    }

    /// Deliver and wait for the outcome
    pub async fn deliver_and_wait(&self, request: DeliveryRequest) -> DeliveryOutcome {
        self.deliver(request).await.outcome().await
    }

    async fn run(
        &self,
        request: DeliveryRequest,
        permit: CallbackPermit,
        cancel: CancellationToken,
    ) -> DeliveryOutcome {
        let DeliveryRequest {
            message,
            compensate,
            callback,
        } = request;

        info!(
            app_code = %message.app_code,
            uuid = %message.uuid,
            callback_key = %callback.callback_key,
            url = %callback.url,
            "executing callback request"
        );

        let started = Instant::now();
        let response = tokio::select! {
            biased;
            _ = cancel.cancelled() => None,
            response = self.send(&message, &callback) => Some(response),
        };
        let duration_ms = started.elapsed().as_millis() as u64;

        let (outcome, recorded) = match response {
            Some(Ok((status, body))) => {
                info!(
                    app_code = %message.app_code,
                    uuid = %message.uuid,
                    callback_key = %callback.callback_key,
                    status,
                    duration_ms,
                    body = %body,
                    "callback response"
                );
                if is_callback_success(status, &body) {
                    let recorded = self
                        .recorder
                        .record_success(&message, compensate.as_ref(), &callback, duration_ms)
                        .await;
                    (DeliveryOutcome::Succeeded, recorded)
                } else {
                    let recorded = self
                        .recorder
                        .record_failure(
                            &message,
                            compensate.as_ref(),
                            &callback,
                            Some(&body),
                            duration_ms,
                            None,
                        )
                        .await;
                    (DeliveryOutcome::FailedResponse { status }, recorded)
                }
            }
            Some(Err(e)) => {
                error!(
                    app_code = %message.app_code,
                    uuid = %message.uuid,
                    callback_key = %callback.callback_key,
                    duration_ms,
                    error = %e,
                    "callback request failed"
                );
                let recorded = self
                    .recorder
                    .record_failure(
                        &message,
                        compensate.as_ref(),
                        &callback,
                        None,
                        duration_ms,
                        Some(&e),
                    )
                    .await;
                (DeliveryOutcome::FailedTransport, recorded)
            }
            None => {
                error!(
                    app_code = %message.app_code,
                    uuid = %message.uuid,
                    callback_key = %callback.callback_key,
                    duration_ms,
                    "callback request cancelled"
                );
                let recorded = self
                    .recorder
                    .record_failure(
                        &message,
                        compensate.as_ref(),
                        &callback,
                        Some(CANCELLED_BODY),
                        duration_ms,
                        Some(&MessageBusError::Cancelled),
                    )
                    .await;
                (DeliveryOutcome::Cancelled, recorded)
            }
        };

        if let Err(e) = recorded {
            error!(
                app_code = %message.app_code,
                uuid = %message.uuid,
                callback_key = %callback.callback_key,
                error = %e,
                "failed to record callback outcome"
            );
        }

        permit.release();
        debug!(callback_key = %callback.callback_key, ?outcome, "callback permit released");
        outcome
    }

    async fn send(
        &self,
        message: &Message,
        callback: &CallbackConfig,
    ) -> Result<(u16, String)> {
        let url = Url::parse(&callback.url).map_err(|e| {
            MessageBusError::InvalidArgument(format!("invalid callback url {}: {}", callback.url, e))
        })?;

        let mut request = self
            .client
            .post(url)
            .header(CONTENT_TYPE, content_type_header(callback.content_type.as_deref()))
            .timeout(self.request_timeout(callback));

        if message.has_body() {
            request = request.body(message.body.clone());
        }

        let response = request.send().await?;
        let status = response.status().as_u16();
        let body = response.text().await?;
        Ok((status, body))
    }
}
