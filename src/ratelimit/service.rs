//! Limiting service: picks the governing limiter for each request.
//!
//! A request is identified by its network address and, optionally, an
//! access credential. When credential limiting is enabled and a credential
//! is present, the credential alone governs the request and the address is
//! never consulted. Otherwise the address governs, unless address limiting
//! is disabled too.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, instrument, warn};

use super::key::LimitKey;
use super::limiter::WindowLimiter;
use super::policy::Policy;
use crate::clock::Clock;
use crate::config::{AdmissionProtocol, LimitsConfig};
use crate::error::{Error, Result};
use crate::store::CounterStore;

/// A granted admission.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Admission {
    /// When the governing window ends; `None` when no limiting applied
    pub reset_time: Option<DateTime<Utc>>,
}

impl Admission {
    /// Admission with no limiter involved.
    pub fn unlimited() -> Self {
        Self { reset_time: None }
    }

    /// Admission inside a window ending at `reset_time`.
    pub fn until(reset_time: DateTime<Utc>) -> Self {
        Self {
            reset_time: Some(reset_time),
        }
    }
}

/// Decides admission for requests against a shared counter store.
///
/// All state besides the store is fixed at construction, so one service can
/// be shared across any number of concurrent request handlers.
pub struct LimitingService {
    /// Limiter with the default policy, used for addresses and for
    /// credentials without an override
    default_limiter: WindowLimiter,
    /// One limiter per overridden credential
    credential_limiters: HashMap<String, WindowLimiter>,
    address_limiting: bool,
    credential_limiting: bool,
    protocol: AdmissionProtocol,
    store_timeout: Duration,
    store: Arc<dyn CounterStore>,
}

impl LimitingService {
    /// Create a service from validated limit settings.
    ///
    /// # Errors
    /// [`Error::Config`] if the settings are invalid.
    pub fn new(
        config: LimitsConfig,
        store: Arc<dyn CounterStore>,
        clock: Arc<dyn Clock>,
    ) -> Result<Self> {
        config.validate()?;
        let store_timeout = config.store_timeout();

        let default_limiter =
            WindowLimiter::new(store.clone(), clock.clone(), config.default_policy);
        let credential_limiters = config
            .credential_overrides
            .into_iter()
            .map(|(credential, policy)| {
                let limiter = WindowLimiter::new(store.clone(), clock.clone(), policy);
                (credential, limiter)
            })
            .collect::<HashMap<_, _>>();

        debug!(
            default_policy = %config.default_policy,
            overrides = credential_limiters.len(),
            address_limiting = config.address_limiting,
            credential_limiting = config.credential_limiting,
            protocol = ?config.protocol,
            "Limiting service configured"
        );

        Ok(Self {
            default_limiter,
            credential_limiters,
            address_limiting: config.address_limiting,
            credential_limiting: config.credential_limiting,
            protocol: config.protocol,
            store_timeout,
            store,
        })
    }

    /// Decide whether a request may proceed.
    ///
    /// Store calls are bounded by the configured store timeout.
    ///
    /// # Errors
    /// [`Error::LimitExceeded`] when the governing budget is spent, carrying
    /// the retry time. [`Error::StoreUnavailable`] when the admission check
    /// could not reach the store.
    pub async fn decide(&self, address: &str, credential: &str) -> Result<Admission> {
        let deadline = Instant::now() + self.store_timeout;
        self.decide_until(address, credential, deadline).await
    }

    /// Like [`decide`](Self::decide), with store calls bounded by the
    /// caller's `deadline`.
    #[instrument(
        skip(self, credential, deadline),
        fields(credential_present = !credential.is_empty())
    )]
    pub async fn decide_until(
        &self,
        address: &str,
        credential: &str,
        deadline: Instant,
    ) -> Result<Admission> {
        if !credential.is_empty() && self.credential_limiting {
            let limiter = self.limiter_for_credential(credential);
            return self
                .admit(limiter, &LimitKey::credential(credential), deadline)
                .await;
        }

        if !self.address_limiting {
            return Ok(Admission::unlimited());
        }

        self.admit(&self.default_limiter, &LimitKey::address(address), deadline)
            .await
    }

    /// The policy that governs `credential`.
    pub fn policy_for_credential(&self, credential: &str) -> Policy {
        self.limiter_for_credential(credential).policy()
    }

    /// The default policy.
    pub fn default_policy(&self) -> Policy {
        self.default_limiter.policy()
    }

    /// Clear the counter for `key`, immediately restoring its full budget.
    pub async fn reset(&self, key: &LimitKey) -> Result<()> {
        let deadline = Instant::now() + self.store_timeout;
        tokio::time::timeout_at(deadline, self.store.clear(&key.to_store_key()))
            .await
            .map_err(|_| Error::StoreUnavailable(crate::store::StoreError::Timeout))??;
        debug!(class = key.class(), "Counter reset");
        Ok(())
    }

    fn limiter_for_credential(&self, credential: &str) -> &WindowLimiter {
        self.credential_limiters
            .get(credential)
            .unwrap_or(&self.default_limiter)
    }

    async fn admit(
        &self,
        limiter: &WindowLimiter,
        key: &LimitKey,
        deadline: Instant,
    ) -> Result<Admission> {
        match self.protocol {
            AdmissionProtocol::CheckThenRecord => {
                let reset_time = limiter.check(key, deadline).await?;

                // a failed record never revokes the admission granted by check
                if let Err(e) = limiter.record(key, deadline).await {
                    warn!(
                        class = key.class(),
                        error = %e,
                        "Failed to record admitted request"
                    );
                }

                Ok(Admission::until(reset_time))
            }
            AdmissionProtocol::Atomic => limiter.admit(key, deadline).await.map(Admission::until),
        }
    }
}

impl std::fmt::Debug for LimitingService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LimitingService")
            .field("default_policy", &self.default_limiter.policy())
            .field("overrides", &self.credential_limiters.len())
            .field("address_limiting", &self.address_limiting)
            .field("credential_limiting", &self.credential_limiting)
            .field("protocol", &self.protocol)
            .finish_non_exhaustive()
    }
}
