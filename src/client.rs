//! Module-side client for the router's registration API.
//!
//! Modules call [`RegistrationClient::register_with_retry`] once their own
//! listener is up; the router may still be starting, so connect failures
//! and 5xx replies are retried with exponential backoff.

use std::time::Duration;

use backon::{ExponentialBuilder, Retryable};
use serde::Deserialize;
use tracing::{info, warn};

use crate::registry::{ModuleDescriptor, RegistrationOutcome};
use crate::tls;
use crate::trust::{CertSubject, PublishedBundle, TrustStore};
use crate::{Error, Result};

const MODULES_PATH: &str = "/admin/v1/registry/modules";

#[derive(Debug, Deserialize)]
struct RegisterReply {
    #[serde(flatten)]
    outcome: RegistrationOutcome,
}

#[derive(Debug, Deserialize)]
struct DeregisterReply {
    module_removed: bool,
}

#[derive(Debug, Deserialize)]
struct ErrorReply {
    error: ErrorBody,
}

#[derive(Debug, Deserialize)]
struct ErrorBody {
    message: String,
}

/// Retry schedule for [`RegistrationClient::register_with_retry`]
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    /// Retries after the first attempt
    pub max_retries: usize,
    /// First backoff delay
    pub min_delay: Duration,
    /// Backoff cap
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 10,
            min_delay: Duration::from_millis(200),
            max_delay: Duration::from_secs(10),
        }
    }
}

/// mTLS client of the registration API
#[derive(Debug, Clone)]
pub struct RegistrationClient {
    base_url: String,
    http: reqwest::Client,
}

impl RegistrationClient {
    /// Client presenting `bundle` and expecting the router to present
    /// `router_identity`.
    ///
    /// # Errors
    ///
    /// Returns an error if the TLS config or HTTP client cannot be built.
    pub fn new(
        router_url: &str,
        router_identity: &str,
        bundle: &PublishedBundle,
        timeout: Duration,
    ) -> Result<Self> {
        let tls = tls::client_config(bundle, router_identity)?;
        let http = reqwest::Client::builder()
            .use_preconfigured_tls(tls)
            .timeout(timeout)
            .no_proxy()
            .build()?;
        Ok(Self {
            base_url: router_url.trim_end_matches('/').to_string(),
            http,
        })
    }

    /// Client using `subject`'s published bundle
    ///
    /// # Errors
    ///
    /// Returns an error if the bundle cannot be loaded.
    pub fn from_store(
        store: &TrustStore,
        subject: &CertSubject,
        router_url: &str,
        router_identity: &str,
        timeout: Duration,
    ) -> Result<Self> {
        let bundle = store.load(subject)?;
        Self::new(router_url, router_identity, &bundle, timeout)
    }

    /// Register one instance
    ///
    /// # Errors
    ///
    /// `Error::Rejected` with the router's status and message, or an HTTP
    /// error if the router is unreachable.
    pub async fn register(&self, descriptor: &ModuleDescriptor) -> Result<RegistrationOutcome> {
        let response = self
            .http
            .post(format!("{}{MODULES_PATH}", self.base_url))
            .json(descriptor)
            .send()
            .await?;
        let reply: RegisterReply = parse(response).await?;
        info!(
            module = %descriptor.id,
            prefix = %descriptor.prefix,
            outcome = ?reply.outcome,
            "Registered with router"
        );
        Ok(reply.outcome)
    }

    /// Register, retrying transient failures
    ///
    /// # Errors
    ///
    /// The last error once retries are exhausted, or the first
    /// non-retryable one.
    pub async fn register_with_retry(
        &self,
        descriptor: &ModuleDescriptor,
        policy: RetryPolicy,
    ) -> Result<RegistrationOutcome> {
        let backoff = ExponentialBuilder::default()
            .with_min_delay(policy.min_delay)
            .with_max_delay(policy.max_delay)
            .with_max_times(policy.max_retries)
            .with_jitter();

        (|| self.register(descriptor))
            .retry(backoff)
            .sleep(tokio::time::sleep)
            .when(Error::is_retryable)
            .notify(|e: &Error, delay: Duration| {
                warn!(
                    module = %descriptor.id,
                    error = %e,
                    retry_in_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                    "Registration failed, retrying"
                );
            })
            .await
    }

    /// Remove a module, or one instance of it when `address` is given.
    /// Returns `true` if the whole module is gone.
    ///
    /// # Errors
    ///
    /// `Error::Rejected` with the router's status and message.
    pub async fn deregister(&self, module_id: &str, address: Option<&str>) -> Result<bool> {
        let mut url = format!("{}{MODULES_PATH}/{module_id}", self.base_url);
        if let Some(address) = address {
            url = format!("{url}?address={address}");
        }
        let reply: DeregisterReply = parse(self.http.delete(url).send().await?).await?;
        info!(module = %module_id, module_removed = reply.module_removed, "Deregistered from router");
        Ok(reply.module_removed)
    }

    /// Registry snapshot as returned by the router
    ///
    /// # Errors
    ///
    /// `Error::Rejected` with the router's status and message.
    pub async fn modules(&self) -> Result<serde_json::Value> {
        let response = self
            .http
            .get(format!("{}{MODULES_PATH}", self.base_url))
            .send()
            .await?;
        parse(response).await
    }
}

async fn parse<T: serde::de::DeserializeOwned>(response: reqwest::Response) -> Result<T> {
    let status = response.status();
    let body = response.bytes().await?;
    if status.is_success() {
        return Ok(serde_json::from_slice(&body)?);
    }
    let message = serde_json::from_slice::<ErrorReply>(&body)
        .map(|r| r.error.message)
        .unwrap_or_else(|_| String::from_utf8_lossy(&body).into_owned());
    Err(Error::Rejected {
        status: status.as_u16(),
        message,
    })
}
