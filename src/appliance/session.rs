//! Appliance Session Client
//!
//! Executes [`ApplianceCommand`]s with lazy authentication, a cached
//! session token, a single re-authentication on expiry and bounded
//! exponential backoff for transient failures.

use super::command::ApplianceCommand;
use super::objects::error_message;
use super::transport::{ApiRequest, ApiResponse, ApplianceTransport, Authorization, HttpMethod};
use crate::config::RetryConfig;
use crate::error::{Error, ErrorKind, Result};
use crate::metrics::DriverMetrics;
use parking_lot::RwLock;
use serde_json::{json, Value};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

// =============================================================================
// Credentials & Tokens
// =============================================================================

/// Credentials exchanged for session tokens
#[derive(Clone, PartialEq, Eq)]
pub enum Credentials {
    ApiKey(String),
    Password { username: String, password: String },
}

impl Credentials {
    fn authorization(&self) -> Authorization {
        match self {
            Credentials::ApiKey(key) => Authorization::Bearer(key.clone()),
            Credentials::Password { username, password } => Authorization::Basic {
                username: username.clone(),
                password: password.clone(),
            },
        }
    }
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Credentials::ApiKey(_) => write!(f, "ApiKey(<redacted>)"),
            Credentials::Password { username, .. } => {
                write!(f, "Password {{ username: {:?}, password: <redacted> }}", username)
            }
        }
    }
}

/// Cached session token
#[derive(Clone)]
struct SessionToken {
    value: String,
    /// Incremented on every successful authentication
    generation: u64,
}

// =============================================================================
// Session Client
// =============================================================================

/// Settings for a session client
#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub credentials: Credentials,
    pub retry: RetryConfig,
    pub token_ttl_secs: u64,
}

/// Shared, concurrency-safe client for the appliance management API
pub struct SessionClient {
    transport: Arc<dyn ApplianceTransport>,
    config: SessionConfig,
    metrics: Arc<DriverMetrics>,
    /// Current token; read without waiting on the auth lock
    token: RwLock<Option<SessionToken>>,
    /// Serializes authentication; holds the last generation issued
    auth_lock: Mutex<u64>,
}

impl SessionClient {
    /// Create a client. No request is made until the first command.
    pub fn new(
        transport: Arc<dyn ApplianceTransport>,
        config: SessionConfig,
        metrics: Arc<DriverMetrics>,
    ) -> Self {
        Self {
            transport,
            config,
            metrics,
            token: RwLock::new(None),
            auth_lock: Mutex::new(0),
        }
    }

    /// Metrics shared with this client
    pub fn metrics(&self) -> &Arc<DriverMetrics> {
        &self.metrics
    }

    /// Whether a session token is currently cached
    pub fn is_authenticated(&self) -> bool {
        self.token.read().is_some()
    }

    /// Execute a command and return its JSON result
    pub async fn execute(&self, command: &ApplianceCommand) -> Result<Value> {
        let max_attempts = self.config.retry.max_attempts.max(1);
        let probe = command.confirmation_probe();
        let retryable = command.is_idempotent() || probe.is_some();

        let attempts = AtomicU32::new(0);
        let attempts = &attempts;
        let probe = probe.as_ref();

        backoff::future::retry(self.config.retry.backoff(), || async move {
            let attempt = attempts.fetch_add(1, Ordering::SeqCst) + 1;

            if attempt > 1 {
                if let Some(probe) = probe {
                    match self.send_authenticated(probe).await {
                        Ok(observed) if command.confirmed_by(&observed) => {
                            info!(
                                "{} already took effect before the failed attempt",
                                command.name()
                            );
                            return Ok(observed);
                        }
                        Ok(_) => {
                            return Err(backoff::Error::permanent(Error::Appliance {
                                operation: command.name().to_string(),
                                status: None,
                                message: "target exists in an unexpected state after a failed attempt"
                                    .into(),
                            }))
                        }
                        Err(e) if e.kind() == ErrorKind::NotFound => {}
                        Err(e) => return Err(self.classify_failure(command, e, attempt, max_attempts, true)),
                    }
                }
            }

            self.send_authenticated(command)
                .await
                .map_err(|e| self.classify_failure(command, e, attempt, max_attempts, retryable))
        })
        .await
    }

    /// Decide whether a failure is retried by the backoff loop
    fn classify_failure(
        &self,
        command: &ApplianceCommand,
        err: Error,
        attempt: u32,
        max_attempts: u32,
        retryable: bool,
    ) -> backoff::Error<Error> {
        if err.is_transient() && retryable && attempt < max_attempts {
            warn!(
                "{} failed transiently (attempt {}/{}): {}",
                command.name(),
                attempt,
                max_attempts,
                err
            );
            self.metrics.record_retry(command.name());
            backoff::Error::transient(err)
        } else {
            backoff::Error::permanent(err)
        }
    }

    /// Send once, re-authenticating and resending exactly once on an auth failure
    async fn send_authenticated(&self, command: &ApplianceCommand) -> Result<Value> {
        let request = command.to_request();
        let token = self.current_token().await?;

        match self.dispatch(command.name(), &request, &token).await {
            Err(Error::Auth(reason)) => {
                debug!("{} rejected session token: {}", command.name(), reason);
                self.metrics.record_reauthentication();
                let fresh = self.reauthenticate(Some(token.generation)).await?;
                self.dispatch(command.name(), &request, &fresh).await
            }
            other => other,
        }
    }

    async fn dispatch(&self, name: &str, request: &ApiRequest, token: &SessionToken) -> Result<Value> {
        let started = Instant::now();
        let result = self
            .transport
            .send(request, &Authorization::Token(token.value.clone()))
            .await
            .and_then(|response| interpret_response(name, response));

        let outcome = match &result {
            Ok(_) => "success".to_string(),
            Err(e) => e.kind().to_string(),
        };
        self.metrics.record_request(name, &outcome, started.elapsed());
        result
    }

    async fn current_token(&self) -> Result<SessionToken> {
        let cached = self.token.read().clone();
        match cached {
            Some(token) => Ok(token),
            None => self.reauthenticate(None).await,
        }
    }

    /// Obtain a fresh token unless another caller already replaced `stale`
    async fn reauthenticate(&self, stale: Option<u64>) -> Result<SessionToken> {
        let mut generation = self.auth_lock.lock().await;

        let cached = self.token.read().clone();
        if let Some(current) = cached {
            if stale != Some(current.generation) {
                return Ok(current);
            }
        }

        let value = self.login().await?;
        *generation += 1;
        let token = SessionToken {
            value,
            generation: *generation,
        };
        *self.token.write() = Some(token.clone());
        info!("Authenticated with appliance (session {})", token.generation);
        Ok(token)
    }

    /// Exchange credentials for a session token
    async fn login(&self) -> Result<String> {
        let request = ApiRequest::new(HttpMethod::Post, "auth/generate_token")
            .with_body(json!({ "ttl": self.config.token_ttl_secs }));
        let auth = self.config.credentials.authorization();
        let max_attempts = self.config.retry.max_attempts.max(1);
        let attempts = AtomicU32::new(0);
        let attempts = &attempts;
        let request = &request;
        let auth = &auth;

        let value = backoff::future::retry(self.config.retry.backoff(), || async move {
            let attempt = attempts.fetch_add(1, Ordering::SeqCst) + 1;
            let started = Instant::now();
            let result = self
                .transport
                .send(request, auth)
                .await
                .and_then(|response| interpret_response("auth.generate_token", response));
            let outcome = match &result {
                Ok(_) => "success".to_string(),
                Err(e) => e.kind().to_string(),
            };
            self.metrics
                .record_request("auth.generate_token", &outcome, started.elapsed());

            result.map_err(|e| {
                if e.is_transient() && attempt < max_attempts {
                    warn!("authentication failed transiently (attempt {}): {}", attempt, e);
                    self.metrics.record_retry("auth.generate_token");
                    backoff::Error::transient(e)
                } else {
                    backoff::Error::permanent(e)
                }
            })
        })
        .await?;

        match value {
            Value::String(token) if !token.is_empty() => Ok(token),
            other => Err(Error::Auth(format!("unexpected token response: {}", other))),
        }
    }
}

// =============================================================================
// Response Classification
// =============================================================================

/// Map an HTTP response onto a JSON result or a driver error
pub fn interpret_response(operation: &str, response: ApiResponse) -> Result<Value> {
    if response.is_success() {
        if response.body.trim().is_empty() {
            return Ok(Value::Null);
        }
        return Ok(serde_json::from_str(&response.body)?);
    }

    let message = error_message(&response.body);
    match response.status {
        401 | 403 => Err(Error::Auth(message)),
        404 => Err(Error::NotFound {
            kind: operation.to_string(),
            id: message,
        }),
        408 | 429 | 502 | 503 | 504 => Err(Error::TransientNetwork(format!(
            "{} returned {}: {}",
            operation, response.status, message
        ))),
        status => Err(classify_rejection(operation, status, message)),
    }
}

fn classify_rejection(operation: &str, status: u16, message: String) -> Error {
    let lower = message.to_lowercase();
    if lower.contains("does not exist") || lower.contains("not found") {
        Error::NotFound {
            kind: operation.to_string(),
            id: message,
        }
    } else if lower.contains("dependent clones") {
        Error::SnapshotInUse { snapshot: message }
    } else if lower.contains("out of space") || lower.contains("insufficient space") {
        Error::CapacityExceeded(message)
    } else {
        Error::Appliance {
            operation: operation.to_string(),
            status: Some(status),
            message,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::appliance::simulator::{Fault, FaultRule, InMemoryAppliance, SimulatorConfig};
    use assert_matches::assert_matches;

    fn retry() -> RetryConfig {
        RetryConfig {
            max_attempts: 3,
            initial_backoff_ms: 1,
            max_backoff_ms: 5,
            multiplier: 2.0,
        }
    }

    fn client(appliance: &Arc<InMemoryAppliance>) -> SessionClient {
        SessionClient::new(
            appliance.clone(),
            SessionConfig {
                credentials: Credentials::ApiKey(SimulatorConfig::default().api_key),
                retry: retry(),
                token_ttl_secs: 600,
            },
            Arc::new(DriverMetrics::new().unwrap()),
        )
    }

    fn parent_query() -> ApplianceCommand {
        ApplianceCommand::GetDataset {
            id: SimulatorConfig::default().parent,
        }
    }

    #[test]
    fn test_interpret_response() {
        assert_eq!(
            interpret_response("x", ApiResponse::new(200, "")).unwrap(),
            Value::Null
        );
        assert_matches!(
            interpret_response("x", ApiResponse::new(401, "")),
            Err(Error::Auth(_))
        );
        assert_matches!(
            interpret_response("x", ApiResponse::new(503, "busy")),
            Err(Error::TransientNetwork(_))
        );
        assert_matches!(
            interpret_response(
                "x",
                ApiResponse::new(422, r#"{"null": [{"message": "dataset does not exist"}]}"#)
            ),
            Err(Error::NotFound { .. })
        );
        assert_matches!(
            interpret_response("x", ApiResponse::new(422, r#"{"message": "snapshot has dependent clones"}"#)),
            Err(Error::SnapshotInUse { .. })
        );
        assert_matches!(
            interpret_response("x", ApiResponse::new(422, r#"{"message": "out of space"}"#)),
            Err(Error::CapacityExceeded(_))
        );
        assert_matches!(
            interpret_response("x", ApiResponse::new(500, "zfs exploded")),
            Err(Error::Appliance { status: Some(500), .. })
        );
    }

    #[tokio::test]
    async fn test_authenticates_lazily_and_reuses_token() {
        let appliance = Arc::new(InMemoryAppliance::new(SimulatorConfig::default()));
        let client = client(&appliance);

        assert!(!client.is_authenticated());
        assert_eq!(appliance.auth_count(), 0);

        client.execute(&parent_query()).await.unwrap();
        client.execute(&parent_query()).await.unwrap();

        assert!(client.is_authenticated());
        assert_eq!(appliance.auth_count(), 1);
    }

    #[tokio::test]
    async fn test_reauthenticates_once_on_expired_token() {
        let appliance = Arc::new(InMemoryAppliance::new(SimulatorConfig::default()));
        let client = client(&appliance);

        client.execute(&parent_query()).await.unwrap();
        appliance.expire_sessions();
        client.execute(&parent_query()).await.unwrap();

        assert_eq!(appliance.auth_count(), 2);
        assert_eq!(client.metrics().reauthentication_count(), 1);
    }

    #[tokio::test]
    async fn test_second_auth_failure_surfaces() {
        let appliance = Arc::new(InMemoryAppliance::new(SimulatorConfig::default()));
        let client = client(&appliance);
        client.execute(&parent_query()).await.unwrap();

        appliance.inject(FaultRule::new(HttpMethod::Get, "pool/dataset/id/", Fault::Unauthorized).times(2));
        let result = client.execute(&parent_query()).await;

        assert_matches!(result, Err(Error::Auth(_)));
        assert_eq!(appliance.auth_count(), 2);
    }

    #[tokio::test]
    async fn test_bad_credentials_fail_with_auth_error() {
        let appliance = Arc::new(InMemoryAppliance::new(SimulatorConfig::default()));
        let client = SessionClient::new(
            appliance.clone(),
            SessionConfig {
                credentials: Credentials::ApiKey("wrong".into()),
                retry: retry(),
                token_ttl_secs: 600,
            },
            Arc::new(DriverMetrics::new().unwrap()),
        );

        assert_matches!(client.execute(&parent_query()).await, Err(Error::Auth(_)));
        assert!(!client.is_authenticated());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_callers_share_one_reauthentication() {
        let appliance = Arc::new(InMemoryAppliance::new(SimulatorConfig {
            latency_ms: 2,
            ..Default::default()
        }));
        let client = Arc::new(client(&appliance));
        client.execute(&parent_query()).await.unwrap();
        appliance.expire_sessions();

        let calls = (0..8).map(|_| {
            let client = client.clone();
            tokio::spawn(async move { client.execute(&parent_query()).await })
        });
        for result in futures::future::join_all(calls).await {
            result.unwrap().unwrap();
        }

        assert_eq!(appliance.auth_count(), 2);
    }

    #[tokio::test]
    async fn test_transient_failures_retry_idempotent_commands() {
        let appliance = Arc::new(InMemoryAppliance::new(SimulatorConfig::default()));
        let client = client(&appliance);

        appliance.inject(FaultRule::new(HttpMethod::Get, "pool/dataset/id/", Fault::Transient).times(2));
        client.execute(&parent_query()).await.unwrap();
        assert_eq!(client.metrics().retry_count("pool.dataset.get"), 2);
    }

    #[tokio::test]
    async fn test_transient_failures_stop_after_max_attempts() {
        let appliance = Arc::new(InMemoryAppliance::new(SimulatorConfig::default()));
        let client = client(&appliance);

        appliance.inject(FaultRule::new(HttpMethod::Get, "pool/dataset/id/", Fault::Transient).times(5));
        let result = client.execute(&parent_query()).await;

        assert_matches!(result, Err(Error::TransientNetwork(_)));
        assert_eq!(appliance.request_count(HttpMethod::Get, "pool/dataset/id/"), 3);
    }

    #[tokio::test]
    async fn test_non_idempotent_command_without_probe_is_not_retried() {
        let appliance = Arc::new(InMemoryAppliance::new(SimulatorConfig::default()));
        let client = client(&appliance);

        appliance.inject(FaultRule::new(HttpMethod::Post, "iscsi/target", Fault::Transient));
        let result = client
            .execute(&ApplianceCommand::CreateIscsiTarget {
                name: "volume-a".into(),
                portal_id: 1,
            })
            .await;

        assert_matches!(result, Err(Error::TransientNetwork(_)));
        assert_eq!(appliance.request_count(HttpMethod::Post, "iscsi/target"), 1);
    }

    #[tokio::test]
    async fn test_lost_create_response_is_confirmed_by_probe() {
        let appliance = Arc::new(InMemoryAppliance::new(SimulatorConfig::default()));
        let client = client(&appliance);
        let name = format!("{}/volume-a", SimulatorConfig::default().parent);

        appliance.inject(FaultRule::new(HttpMethod::Post, "pool/dataset", Fault::TransientAfterApply));
        client
            .execute(&ApplianceCommand::CreateZvol {
                name: name.clone(),
                volsize: 1 << 30,
                sparse: true,
            })
            .await
            .unwrap();

        // The create went out once; the retry was answered by the probe.
        assert_eq!(appliance.request_count(HttpMethod::Post, "pool/dataset"), 1);
        assert!(appliance.dataset(&name).is_some());
    }

    #[tokio::test]
    async fn test_create_is_reissued_when_probe_finds_nothing() {
        let appliance = Arc::new(InMemoryAppliance::new(SimulatorConfig::default()));
        let client = client(&appliance);
        let name = format!("{}/volume-a", SimulatorConfig::default().parent);

        appliance.inject(FaultRule::new(HttpMethod::Post, "pool/dataset", Fault::Transient));
        client
            .execute(&ApplianceCommand::CreateZvol {
                name: name.clone(),
                volsize: 1 << 30,
                sparse: true,
            })
            .await
            .unwrap();

        assert_eq!(appliance.request_count(HttpMethod::Post, "pool/dataset"), 2);
        assert!(appliance.dataset(&name).is_some());
    }
}
