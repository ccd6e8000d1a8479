//! Session orchestration.
//!
//! The manager owns the volatile channel cache and routes execution to the
//! right kernel channel, creating or resuming channels as needed. The
//! registry stays the single source of truth for session metadata; a
//! process restart always starts with zero open channels and reconnects
//! lazily on first use.

use crate::registry::{SessionRegistry, now_ts};
use crate::warn::WarningCache;
use async_trait::async_trait;
use cgpu_protocol::{
    AcceleratorVariant, ExecOutcome, ExecutionRequest, ExecutionResult, KernelState, RuntimeInfo,
    Session, SessionStats, SessionView,
};
use cgpu_runtime::channel::{ChannelConfig, KernelChannel};
use cgpu_runtime::token::AccessToken;
use cgpu_runtime::transport::Dialer;
use cgpu_runtime::{Error, Result, RetryPolicy, TokenProvider, TokenSource};
use dashmap::DashMap;
use parking_lot::Mutex;
use std::sync::Arc;
use tokio::sync::Mutex as TokioMutex;

/// Scopes the bearer token is expected to carry for kernel work. Missing
/// scopes are warned about once per distinct combination, then tolerated;
/// the remote side is the authority on rejection.
const REQUIRED_TOKEN_SCOPES: [&str; 2] = ["kernels", "runtimes"];

/// Allocates and releases remote runtimes.
///
/// Provisioning mechanics live outside this component. Deleting a session
/// never calls [`release`](RuntimeProvisioner::release) - removal is
/// local-only by contract, and remote teardown goes through
/// [`SessionManager::disconnect_runtime`] explicitly.
#[async_trait]
pub trait RuntimeProvisioner: Send + Sync {
    async fn provision(&self, account: &str, variant: AcceleratorVariant) -> Result<RuntimeInfo>;
    async fn release(&self, account: &str, runtime: &RuntimeInfo) -> Result<()>;
}

/// One cached channel plus the gate that serializes same-session callers.
struct SessionSlot {
    gate: TokioMutex<()>,
    channel: KernelChannel,
}

/// Orchestrates the session registry and kernel channels.
pub struct SessionManager {
    account: String,
    registry: Arc<SessionRegistry>,
    channels: DashMap<String, Arc<SessionSlot>>,
    tokens: Arc<TokenSource>,
    dialer: Arc<dyn Dialer>,
    provisioner: Arc<dyn RuntimeProvisioner>,
    policy: RetryPolicy,
    channel_config: ChannelConfig,
    warnings: Mutex<WarningCache>,
}

impl SessionManager {
    pub fn new(
        account: impl Into<String>,
        registry: Arc<SessionRegistry>,
        tokens: Arc<dyn TokenProvider>,
        provisioner: Arc<dyn RuntimeProvisioner>,
        dialer: Arc<dyn Dialer>,
    ) -> Self {
        Self {
            account: account.into(),
            registry,
            channels: DashMap::new(),
            tokens: Arc::new(TokenSource::new(tokens)),
            dialer,
            provisioner,
            policy: RetryPolicy::default(),
            channel_config: ChannelConfig::default(),
            warnings: Mutex::new(WarningCache::default()),
        }
    }

    pub fn with_policy(mut self, policy: RetryPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn with_channel_config(mut self, config: ChannelConfig) -> Self {
        self.channel_config = config;
        self
    }

    pub fn registry(&self) -> &SessionRegistry {
        &self.registry
    }

    /// Number of cached channels (none survive a process restart).
    pub fn open_channels(&self) -> usize {
        self.channels.len()
    }

    /// Provision a runtime and bind a new session to it. The session
    /// becomes the active one.
    pub async fn create_session(
        &self,
        label: &str,
        variant: AcceleratorVariant,
    ) -> Result<SessionView> {
        // Fail fast on a full registry rather than orphaning a fresh
        // runtime; the create below re-checks under the registry lock.
        let limit = self.registry.tier().max_sessions();
        if self.registry.count() >= limit {
            return Err(Error::SessionLimit { limit });
        }

        let runtime = self.provisioner.provision(&self.account, variant).await?;

        match self.registry.create(label, variant, runtime.clone(), now_ts()) {
            Ok(session) => Ok(self.view(session)),
            Err(err) => {
                // Lost the race to the last slot; don't leak the runtime.
                if let Err(release_err) = self.provisioner.release(&self.account, &runtime).await {
                    tracing::warn!(
                        target: "cgpu.manager",
                        error = %release_err,
                        "failed to release runtime after create race"
                    );
                }
                Err(err)
            }
        }
    }

    pub fn list_sessions(&self) -> Vec<SessionView> {
        self.registry.list(now_ts())
    }

    /// Make the resolved session active; atomic per the single-active
    /// invariant.
    pub fn switch_session(&self, query: &str) -> Result<SessionView> {
        let session = self.registry.find(query)?;
        let updated = self.registry.set_active(&session.id, now_ts())?;
        tracing::info!(target: "cgpu.manager", id = %updated.short_id(), "session activated");
        Ok(self.view(updated))
    }

    /// Remove the local record and drop any cached channel. The remote
    /// runtime is not torn down; see [`SessionManager::disconnect_runtime`].
    pub async fn delete_session(&self, query: &str) -> Result<Session> {
        let session = self.registry.find(query)?;
        let removed = self.registry.remove(&session.id)?;
        self.evict_channel(&session.id);
        tracing::info!(target: "cgpu.manager", id = %removed.short_id(), "session deleted");
        Ok(removed)
    }

    /// Remove every stale session, dropping their cached channels. The
    /// returned set is exactly what was removed.
    pub async fn clean_stale_sessions(&self) -> Result<Vec<Session>> {
        let cleaned = self.registry.clean_stale(now_ts())?;
        for session in &cleaned {
            self.evict_channel(&session.id);
        }
        if !cleaned.is_empty() {
            tracing::info!(target: "cgpu.manager", count = cleaned.len(), "stale sessions cleaned");
        }
        Ok(cleaned)
    }

    pub fn stats(&self) -> SessionStats {
        self.registry.stats(now_ts())
    }

    /// Explicit remote teardown through the provisioner collaborator. The
    /// local record survives with its kernel marked dead; `delete_session`
    /// afterwards removes it.
    pub async fn disconnect_runtime(&self, query: &str) -> Result<Session> {
        let session = self.registry.find(query)?;
        self.evict_channel(&session.id);
        self.provisioner.release(&self.account, &session.runtime).await?;
        self.registry.update(&session.id, |s| {
            s.kernel_state = KernelState::Dead;
        })
    }

    /// Run an execution request against the resolved session, connecting
    /// or transparently reconnecting its channel first. Distinct sessions
    /// proceed concurrently; calls against one session are serialized.
    ///
    /// The attempt is recorded in the registry - kernel state and
    /// `last_used_at` - whether or not it succeeded.
    pub async fn run_on(&self, query: &str, request: &ExecutionRequest) -> Result<ExecutionResult> {
        let session = self.registry.find(query)?;
        let slot = self.slot(&session);
        let _gate = slot.gate.lock().await;

        let outcome = self.run_locked(&slot, request).await;

        let kernel_state = slot.channel.kernel_state();
        if let Err(err) = self.registry.update(&session.id, |s| {
            s.kernel_state = kernel_state;
            s.last_used_at = now_ts();
        }) {
            tracing::warn!(
                target: "cgpu.manager",
                id = %session.short_id(),
                error = %err,
                "failed to record execution against the session store"
            );
        }

        outcome
    }

    async fn run_locked(
        &self,
        slot: &SessionSlot,
        request: &ExecutionRequest,
    ) -> Result<ExecutionResult> {
        if !slot.channel.is_connected() {
            let token = self.tokens.token(&self.account).await?;
            self.warn_on_missing_scopes(&token);
            slot.channel.connect().await?;
        }

        let timeout = request.timeout();

        if let Some(setup) = &request.setup {
            let result = slot.channel.execute(setup, timeout).await?;
            if let ExecOutcome::Error {
                ename,
                evalue,
                traceback,
            } = result.outcome
            {
                tracing::warn!(target: "cgpu.manager", %ename, "setup stage failed; aborting run");
                return Err(Error::Kernel {
                    ename,
                    evalue,
                    traceback,
                });
            }
        }

        let result = slot.channel.execute(&request.code, timeout).await;

        if let Some(cleanup) = &request.cleanup {
            // Best-effort: a cleanup failure never overrides the main
            // outcome.
            match slot.channel.execute(cleanup, timeout).await {
                Ok(cleanup_result) if !cleanup_result.outcome.is_success() => {
                    tracing::warn!(target: "cgpu.manager", "cleanup stage reported an error");
                }
                Err(err) => {
                    tracing::warn!(target: "cgpu.manager", error = %err, "cleanup stage failed");
                }
                Ok(_) => {}
            }
        }

        result
    }

    fn slot(&self, session: &Session) -> Arc<SessionSlot> {
        self.channels
            .entry(session.id.clone())
            .or_insert_with(|| {
                Arc::new(SessionSlot {
                    gate: TokioMutex::new(()),
                    channel: KernelChannel::new(
                        session.runtime.endpoint.clone(),
                        self.account.clone(),
                        Arc::clone(&self.tokens),
                        Arc::clone(&self.dialer),
                        self.policy.clone(),
                        self.channel_config.clone(),
                    ),
                })
            })
            .clone()
    }

    fn evict_channel(&self, id: &str) {
        if let Some((_, slot)) = self.channels.remove(id) {
            // Best-effort close; a failure here is logged by the transport
            // and never fails the caller's operation.
            slot.channel.close();
            tracing::debug!(target: "cgpu.manager", id, "cached channel dropped");
        }
    }

    fn warn_on_missing_scopes(&self, token: &AccessToken) {
        if token.scopes.is_empty() {
            // Provider doesn't report scopes; nothing to check.
            return;
        }
        let missing: Vec<&str> = REQUIRED_TOKEN_SCOPES
            .iter()
            .copied()
            .filter(|required| !token.scopes.iter().any(|scope| scope == required))
            .collect();
        if missing.is_empty() {
            return;
        }
        let key = format!("{}:{}", self.account, missing.join("+"));
        if self.warnings.lock().first_sighting(&key, now_ts()) {
            tracing::warn!(
                target: "cgpu.manager",
                account = %self.account,
                missing = %missing.join(", "),
                "token is missing expected scopes; kernel operations may be rejected"
            );
        }
    }

    fn view(&self, session: Session) -> SessionView {
        SessionView {
            status: crate::status::compute_status(&session, now_ts()),
            session,
        }
    }
}
