//! Sandbox host - child-process gear execution.
//!
//! One child process per concurrent `execute`: integrity-checked package,
//! restricted environment, secrets injected as files, signed NDJSON
//! framing over stdin/stdout, hard timeout with TERM-then-KILL, and
//! unconditional teardown (secrets zeroed and removed, work dir removed,
//! ephemeral signing key unregistered).

use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::io::BufReader;
use tokio::process::{Child, Command};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::dag::StepExecutor;
use crate::envelope::{signing, EnvelopeSigner, KeyRegistry, MessageType, SignedEnvelope};
use crate::gears::{CachedGear, GearRegistry};
use crate::pipeline::plan::Step;
use crate::queue::{EnqueueRequest, JobQueue, JobSource};
use crate::types::{ComponentId, Error, Result};
use crate::vault::SecretsVault;
use crate::watchdog::MemoryWatchdog;

pub mod breaker;
pub mod framing;
pub mod profile;

pub use breaker::CircuitBreaker;

/// Package signature enforcement.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SigningPolicy {
    Require,
    Warn,
    Allow,
}

/// Host construction options.
#[derive(Debug, Clone)]
pub struct SandboxConfig {
    pub workspace_root: PathBuf,
    /// The gear runner binary; receives the package path as its argument.
    pub runtime_cmd: PathBuf,
    /// Fixed arguments placed before the package path.
    pub runtime_args: Vec<String>,
    pub signing_policy: SigningPolicy,
    pub gear_kill_timeout: Duration,
    /// Parent directory for per-execution work dirs (system temp when
    /// unset; tests point it somewhere observable).
    pub work_root: Option<PathBuf>,
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            workspace_root: PathBuf::from("/workspace"),
            runtime_cmd: PathBuf::from("gear-runner"),
            runtime_args: Vec::new(),
            signing_policy: SigningPolicy::Warn,
            gear_kill_timeout: Duration::from_millis(5_000),
            work_root: None,
        }
    }
}

/// The sandbox host.
pub struct SandboxHost {
    registry: Arc<GearRegistry>,
    keys: Arc<KeyRegistry>,
    vault: Option<Arc<SecretsVault>>,
    breaker: Arc<CircuitBreaker>,
    watchdog: Option<Arc<MemoryWatchdog>>,
    /// Fire-and-forget sub-job intake for children.
    sub_jobs: Option<Arc<JobQueue>>,
    signer: EnvelopeSigner,
    config: SandboxConfig,
    active: AtomicUsize,
}

impl std::fmt::Debug for SandboxHost {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SandboxHost")
            .field("active", &self.active_count())
            .finish_non_exhaustive()
    }
}

impl SandboxHost {
    pub fn new(
        registry: Arc<GearRegistry>,
        keys: Arc<KeyRegistry>,
        breaker: Arc<CircuitBreaker>,
        config: SandboxConfig,
    ) -> Self {
        let signer = EnvelopeSigner::generate(ComponentId::sandbox_host());
        let _ = keys.register(ComponentId::sandbox_host(), signer.verifying_key());
        Self {
            registry,
            keys,
            vault: None,
            breaker,
            watchdog: None,
            sub_jobs: None,
            signer,
            config,
            active: AtomicUsize::new(0),
        }
    }

    pub fn with_vault(mut self, vault: Arc<SecretsVault>) -> Self {
        self.vault = Some(vault);
        self
    }

    pub fn with_watchdog(mut self, watchdog: Arc<MemoryWatchdog>) -> Self {
        self.watchdog = Some(watchdog);
        self
    }

    pub fn with_sub_job_queue(mut self, queue: Arc<JobQueue>) -> Self {
        self.sub_jobs = Some(queue);
        self
    }

    pub fn breaker(&self) -> Arc<CircuitBreaker> {
        Arc::clone(&self.breaker)
    }

    pub fn active_count(&self) -> usize {
        self.active.load(Ordering::SeqCst)
    }

    /// Run one gear action in a fresh child process.
    pub async fn execute(
        &self,
        gear_id: &str,
        action: &str,
        parameters: serde_json::Value,
        step_id: &str,
        cancel: CancellationToken,
    ) -> Result<serde_json::Value> {
        if let Some(watchdog) = &self.watchdog {
            if watchdog.current().refuses_spawns() {
                return Err(Error::QuotaExceeded(
                    "memory pressure refuses new sandboxes".to_string(),
                ));
            }
        }
        if self.breaker.is_open(gear_id) {
            return Err(Error::GearExecutionFailed(format!(
                "circuit breaker open for {}",
                gear_id
            )));
        }

        let gear = self
            .registry
            .get_cached(gear_id)
            .ok_or_else(|| Error::GearNotFound(format!("{} not installed or disabled", gear_id)))?;
        if !gear.manifest.has_action(action) {
            return Err(Error::GearInvalid(format!(
                "{} does not implement {}",
                gear_id, action
            )));
        }

        self.check_integrity(gear_id, &gear)?;
        self.check_signing(gear_id, &gear)?;

        self.active.fetch_add(1, Ordering::SeqCst);
        let result = self
            .run_child(gear_id, &gear, action, parameters, step_id, cancel)
            .await;
        self.active.fetch_sub(1, Ordering::SeqCst);

        match &result {
            Ok(_) => self.breaker.record_success(gear_id),
            Err(Error::GearNotFound(_)) | Err(Error::GearInvalid(_)) => {}
            Err(_) => self.breaker.record_failure(gear_id),
        }
        result
    }

    /// Recompute the package hash and compare to the installed checksum.
    /// Mismatch disables the gear.
    fn check_integrity(&self, gear_id: &str, gear: &CachedGear) -> Result<()> {
        let Some(package_path) = &gear.package_path else {
            return Ok(()); // Builtins carry no package file.
        };
        let bytes = std::fs::read(package_path).map_err(|e| {
            Error::GearExecutionFailed(format!("package unreadable for {}: {}", gear_id, e))
        })?;
        let actual = signing::sha256_hex(&bytes);
        let expected = self.registry.get_checksum(gear_id)?;
        if actual != expected {
            warn!(gear_id, "package checksum mismatch; disabling gear");
            let _ = self.registry.disable(gear_id);
            self.breaker.record_failure(gear_id);
            return Err(Error::GearExecutionFailed(format!(
                "checksum mismatch for {}",
                gear_id
            )));
        }
        Ok(())
    }

    fn check_signing(&self, gear_id: &str, gear: &CachedGear) -> Result<()> {
        match (self.config.signing_policy, &gear.signature) {
            (SigningPolicy::Require, None) => Err(Error::GearExecutionFailed(format!(
                "signing policy requires a signature for {}",
                gear_id
            ))),
            (SigningPolicy::Warn, None) => {
                warn!(gear_id, "gear package is unsigned");
                Ok(())
            }
            _ => Ok(()),
        }
    }

    async fn run_child(
        &self,
        gear_id: &str,
        gear: &CachedGear,
        action: &str,
        parameters: serde_json::Value,
        step_id: &str,
        cancel: CancellationToken,
    ) -> Result<serde_json::Value> {
        let resources = gear.manifest.effective_resources();
        let work_dir = match &self.config.work_root {
            Some(root) => tempfile::Builder::new().prefix("gear-").tempdir_in(root)?,
            None => tempfile::Builder::new().prefix("gear-").tempdir()?,
        };
        let secrets_dir = work_dir.path().join("secrets");
        let has_secrets = self.inject_secrets(gear_id, gear, &secrets_dir)?;
        profile::write_profile(work_dir.path(), &gear.manifest, &self.config.workspace_root)?;

        // Ephemeral per-execution signing identity for the child.
        let child_component = ComponentId::plugin(gear_id);
        let child_signer_key = ed25519_dalek::SigningKey::generate(&mut rand::rngs::OsRng);
        self.keys
            .register(child_component.clone(), child_signer_key.verifying_key())?;

        let outcome = self
            .drive_child(
                gear_id,
                gear,
                action,
                parameters,
                step_id,
                &child_signer_key,
                work_dir.path().to_path_buf(),
                if has_secrets {
                    Some(secrets_dir.as_path())
                } else {
                    None
                },
                Duration::from_millis(resources.timeout_ms),
                cancel,
            )
            .await;

        // Teardown, always: zero secrets, drop the work dir, forget the key.
        zero_and_remove_dir(&secrets_dir);
        self.keys.remove(&child_component)?;
        drop(work_dir);
        outcome
    }

    /// Write each granted secret the vault holds to `secretsDir/<name>`,
    /// mode 0600. Returns whether anything was written.
    fn inject_secrets(
        &self,
        gear_id: &str,
        gear: &CachedGear,
        secrets_dir: &std::path::Path,
    ) -> Result<bool> {
        let Some(vault) = &self.vault else {
            return Ok(false);
        };
        let mut wrote = false;
        for name in &gear.manifest.permissions.secrets {
            match vault.retrieve(name, gear_id) {
                Ok(value) => {
                    if !wrote {
                        std::fs::create_dir_all(secrets_dir)?;
                    }
                    let path = secrets_dir.join(name);
                    std::fs::write(&path, value.as_slice())?;
                    #[cfg(unix)]
                    {
                        use std::os::unix::fs::PermissionsExt;
                        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o600))?;
                    }
                    wrote = true;
                    // `value` (Zeroizing) wipes the source buffer on drop.
                }
                Err(err) => {
                    debug!(gear_id, secret = name, error = %err, "secret not injected");
                }
            }
        }
        Ok(wrote)
    }

    #[allow(clippy::too_many_arguments)]
    async fn drive_child(
        &self,
        gear_id: &str,
        gear: &CachedGear,
        action: &str,
        parameters: serde_json::Value,
        step_id: &str,
        child_key: &ed25519_dalek::SigningKey,
        work_dir: PathBuf,
        secrets_dir: Option<&std::path::Path>,
        timeout: Duration,
        cancel: CancellationToken,
    ) -> Result<serde_json::Value> {
        let mut command = Command::new(&self.config.runtime_cmd);
        command
            .args(&self.config.runtime_args)
            .current_dir(&work_dir)
            .env_clear()
            .env("PATH", "/usr/bin:/bin")
            .env("WORKSPACE", &self.config.workspace_root)
            .env("GEAR_ID", gear_id)
            .env("GEAR_VERSION", &gear.manifest.version)
            .env("GEAR_SIGNING_KEY", hex::encode(child_key.to_bytes()))
            .env(
                "GEAR_MAX_HEAP_MB",
                gear.manifest.effective_resources().max_memory_mb.to_string(),
            )
            .stdin(std::process::Stdio::piped())
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::null())
            .kill_on_drop(true);
        if let Some(package) = &gear.package_path {
            command.arg(package);
        }
        if let Some(dir) = secrets_dir {
            command.env("SECRETS_DIR", dir);
        }

        let mut child = command.spawn().map_err(|e| {
            Error::GearExecutionFailed(format!("spawn failed for {}: {}", gear_id, e))
        })?;

        let mut stdin = child
            .stdin
            .take()
            .ok_or_else(|| Error::GearExecutionFailed("child stdin unavailable".to_string()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| Error::GearExecutionFailed("child stdout unavailable".to_string()))?;
        let mut reader = BufReader::new(stdout);

        let request = self.signer.sign_request(
            ComponentId::plugin(gear_id),
            MessageType::ExecuteRequest,
            serde_json::json!({
                "action": action,
                "parameters": parameters,
                "stepId": step_id,
            }),
        );
        framing::write_envelope(&mut stdin, &request).await?;

        let read_loop = self.read_until_response(gear_id, &request, &mut reader, &mut stdin);
        let outcome = tokio::select! {
            outcome = tokio::time::timeout(timeout, read_loop) => match outcome {
                Ok(result) => result,
                Err(_) => {
                    self.terminate(&mut child).await;
                    return Err(Error::GearTimeout(format!(
                        "{} exceeded {} ms",
                        gear_id,
                        timeout.as_millis()
                    )));
                }
            },
            _ = cancel.cancelled() => {
                self.terminate(&mut child).await;
                return Err(Error::cancelled(format!("execution of {} cancelled", gear_id)));
            }
        };
        self.terminate(&mut child).await;
        outcome
    }

    async fn read_until_response(
        &self,
        gear_id: &str,
        request: &SignedEnvelope,
        reader: &mut BufReader<tokio::process::ChildStdout>,
        stdin: &mut tokio::process::ChildStdin,
    ) -> Result<serde_json::Value> {
        // Replay guard over child messages, keyed per correlation.
        let mut seen_ids: HashSet<String> = HashSet::new();

        loop {
            let Some(line) = framing::read_line(reader).await? else {
                return Err(Error::GearError(format!(
                    "{} exited without a response",
                    gear_id
                )));
            };
            if line.trim().is_empty() {
                continue;
            }
            match framing::parse_child_line(&line)? {
                framing::ChildMessage::Progress { percent, message } => {
                    debug!(gear_id, percent, message = message.as_deref(), "gear progress");
                }
                framing::ChildMessage::Log { message } => {
                    debug!(gear_id, %message, "gear log");
                }
                framing::ChildMessage::Envelope(envelope) => {
                    self.verify_child_envelope(gear_id, request, &envelope, &mut seen_ids)?;
                    match envelope.message_type {
                        MessageType::ExecuteResponse => {
                            return extract_result(gear_id, &envelope.payload);
                        }
                        MessageType::StatusUpdate => {
                            self.handle_status_update(gear_id, &envelope, stdin).await?;
                        }
                        other => {
                            return Err(Error::GearError(format!(
                                "{} sent unexpected {}",
                                gear_id,
                                other.as_str()
                            )));
                        }
                    }
                }
            }
        }
    }

    fn verify_child_envelope(
        &self,
        gear_id: &str,
        request: &SignedEnvelope,
        envelope: &SignedEnvelope,
        seen_ids: &mut HashSet<String>,
    ) -> Result<()> {
        let key = self
            .keys
            .lookup(&envelope.signer)
            .ok_or_else(|| Error::GearError(format!("{} signed with unknown key", gear_id)))?;
        signing::verify(envelope, &key)
            .map_err(|_| Error::GearError(format!("{} envelope failed verification", gear_id)))?;
        if envelope.correlation_id != request.correlation_id {
            return Err(Error::GearError(format!(
                "{} answered a different correlation",
                gear_id
            )));
        }
        if !seen_ids.insert(envelope.message_id.to_string()) {
            return Err(Error::GearError(format!(
                "{} replayed message {}",
                gear_id, envelope.message_id
            )));
        }
        Ok(())
    }

    /// Sub-job creation from inside the sandbox: fire-and-forget. The
    /// child gets the new job id back and nothing else, ever.
    async fn handle_status_update(
        &self,
        gear_id: &str,
        envelope: &SignedEnvelope,
        stdin: &mut tokio::process::ChildStdin,
    ) -> Result<()> {
        let Some(enqueue) = envelope.payload.get("enqueue") else {
            debug!(gear_id, "gear status update");
            return Ok(());
        };
        let Some(queue) = &self.sub_jobs else {
            debug!(gear_id, "sub-job intake disabled; ignoring enqueue");
            return Ok(());
        };
        let metadata = enqueue
            .get("metadata")
            .and_then(|m| m.as_object())
            .map(|m| m.clone().into_iter().collect());
        let job = queue.enqueue(EnqueueRequest {
            source: JobSource::Plugin,
            metadata,
            ..Default::default()
        })?;
        let ack = self.signer.sign_response(
            envelope,
            MessageType::StatusUpdate,
            serde_json::json!({"jobId": job.id.as_str()}),
        );
        framing::write_envelope(stdin, &ack).await
    }

    /// SIGTERM, wait the kill grace, then SIGKILL.
    async fn terminate(&self, child: &mut Child) {
        if let Ok(Some(_)) = child.try_wait() {
            return; // Already exited.
        }
        if let Some(pid) = child.id() {
            let _ = Command::new("kill")
                .arg("-TERM")
                .arg(pid.to_string())
                .status()
                .await;
        }
        if tokio::time::timeout(self.config.gear_kill_timeout, child.wait())
            .await
            .is_err()
        {
            let _ = child.kill().await;
        }
    }
}

#[async_trait]
impl crate::router::ComponentHandler for SandboxHost {
    /// Service one `execute.request`. Execution failures come back as
    /// `execute.response` envelopes carrying the gear error taxonomy,
    /// not as transport errors.
    async fn handle(
        &self,
        envelope: SignedEnvelope,
        cancel: CancellationToken,
    ) -> Result<SignedEnvelope> {
        if envelope.message_type != MessageType::ExecuteRequest {
            return Err(Error::validation(format!(
                "sandbox host does not handle {}",
                envelope.message_type.as_str()
            )));
        }
        let gear_id = envelope.payload["plugin"]
            .as_str()
            .ok_or_else(|| Error::validation("execute.request missing plugin"))?
            .to_string();
        let action = envelope.payload["action"]
            .as_str()
            .ok_or_else(|| Error::validation("execute.request missing action"))?
            .to_string();
        let parameters = envelope.payload["parameters"].clone();
        let step_id = envelope.payload["stepId"].as_str().unwrap_or_default().to_string();

        let payload = match self
            .execute(&gear_id, &action, parameters, &step_id, cancel)
            .await
        {
            Ok(result) => serde_json::json!({"result": result}),
            Err(err) => serde_json::json!({
                "error": {"code": err.code(), "message": err.to_string()}
            }),
        };
        Ok(self
            .signer
            .sign_response(&envelope, MessageType::ExecuteResponse, payload))
    }
}

fn extract_result(gear_id: &str, payload: &serde_json::Value) -> Result<serde_json::Value> {
    if let Some(error) = payload.get("error") {
        let code = error.get("code").and_then(|c| c.as_str()).unwrap_or("");
        let message = error
            .get("message")
            .and_then(|m| m.as_str())
            .unwrap_or("unspecified gear error")
            .to_string();
        return Err(match code {
            "GEAR_INVALID" => Error::GearInvalid(message),
            "GEAR_TIMEOUT" => Error::GearTimeout(message),
            _ => Error::GearError(format!("{}: {}", gear_id, message)),
        });
    }
    Ok(payload.get("result").cloned().unwrap_or(serde_json::Value::Null))
}

/// Overwrite files with zeros before unlinking, then remove the dir.
fn zero_and_remove_dir(dir: &std::path::Path) {
    let Ok(entries) = std::fs::read_dir(dir) else {
        return;
    };
    for entry in entries.flatten() {
        let path = entry.path();
        if let Ok(meta) = entry.metadata() {
            if meta.is_file() {
                let _ = std::fs::write(&path, vec![0u8; meta.len() as usize]);
            }
        }
        let _ = std::fs::remove_file(&path);
    }
    let _ = std::fs::remove_dir_all(dir);
}

// =============================================================================
// Step executor adapter
// =============================================================================

/// Bridges the DAG executor to the sandbox host, owning the retry policy
/// for step-scoped failures.
pub struct GearStepExecutor {
    host: Arc<SandboxHost>,
    max_attempts: u32,
}

impl std::fmt::Debug for GearStepExecutor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GearStepExecutor")
            .field("max_attempts", &self.max_attempts)
            .finish_non_exhaustive()
    }
}

impl GearStepExecutor {
    pub fn new(host: Arc<SandboxHost>, max_attempts: u32) -> Self {
        Self {
            host,
            max_attempts: max_attempts.max(1),
        }
    }
}

#[async_trait]
impl StepExecutor for GearStepExecutor {
    async fn execute_step(
        &self,
        step: &Step,
        parameters: serde_json::Value,
        cancel: CancellationToken,
    ) -> Result<serde_json::Value> {
        let mut attempt = 0;
        loop {
            let result = self
                .host
                .execute(
                    &step.plugin,
                    &step.action,
                    parameters.clone(),
                    &step.id,
                    cancel.clone(),
                )
                .await;
            match result {
                Ok(value) => return Ok(value),
                Err(err) if err.retriable() && attempt + 1 < self.max_attempts => {
                    attempt += 1;
                    debug!(step = %step.id, attempt, error = %err, "retrying step");
                    tokio::time::sleep(Error::backoff_delay(attempt)).await;
                }
                Err(err) => return Err(err),
            }
        }
    }
}
