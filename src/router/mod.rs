//! Component registry and message router.
//!
//! Components register exactly one handler per logical id. `dispatch` is
//! synchronous from the caller's perspective: it runs the middleware
//! chain, invokes the addressee, and always returns an envelope - handler
//! failures come back as `error`-type responses, never as panics or bare
//! errors. Concurrency is the caller's responsibility.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::envelope::{EnvelopeSigner, KeyRegistry, ReplayGuard, SignedEnvelope};
use crate::types::{ComponentId, Error, Result, RuntimeConfig};

pub mod middleware;

pub use middleware::{Middleware, MiddlewareContext, BARRIER_VIOLATING_KEYS};

/// Error code returned when no handler is bound for the addressee.
pub const COMPONENT_NOT_FOUND: &str = "COMPONENT_NOT_FOUND";

/// A registered message handler.
///
/// Handlers receive the (possibly scrubbed) envelope and the caller's
/// cancellation handle, and return a signed response envelope.
#[async_trait]
pub trait ComponentHandler: Send + Sync {
    async fn handle(
        &self,
        envelope: SignedEnvelope,
        cancel: CancellationToken,
    ) -> Result<SignedEnvelope>;
}

/// Router construction options derived from [`RuntimeConfig`].
#[derive(Debug, Clone, Default)]
pub struct RouterConfig {
    pub max_message_size_bytes: usize,
    pub message_warning_threshold_bytes: usize,
    pub replay_window_ms: u64,
    /// In-process signers allowed to bypass signature + replay checks.
    pub trusted_signers: Vec<ComponentId>,
}

impl RouterConfig {
    pub fn from_runtime(config: &RuntimeConfig) -> Self {
        Self {
            max_message_size_bytes: config.max_message_size_bytes,
            message_warning_threshold_bytes: config.message_warning_threshold_bytes,
            replay_window_ms: config.replay_window_ms,
            trusted_signers: Vec::new(),
        }
    }
}

/// The in-process message router.
pub struct Router {
    handlers: RwLock<HashMap<ComponentId, Arc<dyn ComponentHandler>>>,
    keys: Arc<KeyRegistry>,
    replay: ReplayGuard,
    chain: Vec<Box<dyn Middleware>>,
    signer: EnvelopeSigner,
    config: RouterConfig,
}

impl std::fmt::Debug for Router {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Router")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl Router {
    pub fn new(config: RouterConfig) -> Self {
        let keys = Arc::new(KeyRegistry::new());
        Self::with_keys(config, keys)
    }

    pub fn with_keys(config: RouterConfig, keys: Arc<KeyRegistry>) -> Self {
        let replay = ReplayGuard::new(config.replay_window_ms);
        let signer = EnvelopeSigner::generate(ComponentId::router());
        // The router trusts itself for the error envelopes it emits.
        if keys.register(ComponentId::router(), signer.verifying_key()).is_err() {
            debug!("router key registration skipped");
        }
        Self {
            handlers: RwLock::new(HashMap::new()),
            keys,
            replay,
            chain: middleware::builtin_chain(),
            signer,
            config,
        }
    }

    /// Shared key registry, for components registering their signers.
    pub fn keys(&self) -> Arc<KeyRegistry> {
        Arc::clone(&self.keys)
    }

    /// Bind a handler. Fails if the id is already bound.
    pub fn register(&self, id: ComponentId, handler: Arc<dyn ComponentHandler>) -> Result<()> {
        let mut handlers = self
            .handlers
            .write()
            .map_err(|_| Error::internal("router registry lock poisoned"))?;
        if handlers.contains_key(&id) {
            return Err(Error::conflict(format!(
                "component {} already registered",
                id
            )));
        }
        handlers.insert(id, handler);
        Ok(())
    }

    pub fn unregister(&self, id: &ComponentId) -> Result<()> {
        let mut handlers = self
            .handlers
            .write()
            .map_err(|_| Error::internal("router registry lock poisoned"))?;
        handlers.remove(id);
        Ok(())
    }

    pub fn has(&self, id: &ComponentId) -> bool {
        self.handlers
            .read()
            .map(|h| h.contains_key(id))
            .unwrap_or(false)
    }

    /// Route an envelope through the middleware chain to its addressee.
    ///
    /// Always returns an envelope: middleware refusals and handler
    /// failures are converted into `error`-type responses carrying
    /// `{code, message}`.
    pub async fn dispatch(
        &self,
        mut envelope: SignedEnvelope,
        cancel: CancellationToken,
    ) -> SignedEnvelope {
        let ctx = MiddlewareContext {
            keys: &self.keys,
            replay: &self.replay,
            trusted_signers: &self.config.trusted_signers,
            max_message_size_bytes: self.config.max_message_size_bytes,
            message_warning_threshold_bytes: self.config.message_warning_threshold_bytes,
        };

        for stage in &self.chain {
            if let Err(err) = stage.apply(&mut envelope, &ctx) {
                debug!(stage = stage.name(), code = err.code(), "dispatch refused");
                return self.signer.sign_error(&envelope, err.code(), &err.to_string());
            }
        }

        let handler = {
            let handlers = match self.handlers.read() {
                Ok(handlers) => handlers,
                Err(_) => {
                    return self.signer.sign_error(
                        &envelope,
                        Error::internal("").code(),
                        "router registry lock poisoned",
                    )
                }
            };
            handlers.get(&envelope.to).cloned()
        };

        let Some(handler) = handler else {
            return self.signer.sign_error(
                &envelope,
                COMPONENT_NOT_FOUND,
                &format!("no handler registered for {}", envelope.to),
            );
        };

        match handler.handle(envelope.clone(), cancel).await {
            Ok(response) => response,
            Err(err) => self.signer.sign_error(&envelope, err.code(), &err.to_string()),
        }
    }
}
