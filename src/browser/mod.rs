//! Browser session capability and setup logic.
//!
//! The pipeline treats the browser as a black-box capability behind the
//! [`BrowserSession`] and [`BrowserBackend`] traits: something that can be
//! started, asked for its cookies, and killed. What this module owns is the
//! decision logic around it: which source the session comes from (local
//! process, provisioned remote CDP endpoint, or a preconfigured CDP URL),
//! what profile it is launched with, and how login tasks get their
//! persistent storage state seeded.

pub mod provision;

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use tokio::fs;

use crate::error::BrowserError;
use crate::task::Task;

pub use provision::{CdpProvisioner, RemoteBrowserProvisioner};

/// How long a kill is allowed to take before cleanup gives up on it.
pub const CLEANUP_TIMEOUT: Duration = Duration::from_secs(30);

/// A browser cookie as reported by the session.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Cookie {
    /// Cookie name.
    #[serde(default)]
    pub name: String,
    /// Cookie value.
    #[serde(default)]
    pub value: String,
    /// Remaining attributes (domain, path, expiry, ...).
    #[serde(flatten)]
    pub attributes: Map<String, Value>,
}

/// Where the browser session comes from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BrowserSource {
    /// A locally launched browser process.
    #[default]
    Local,
    /// A remote CDP endpoint obtained from the provisioning service.
    Provisioned,
    /// A preconfigured remote CDP URL.
    Remote,
}

impl BrowserSource {
    /// Parses a CLI/server string, falling back to `Local` on unknown input.
    pub fn parse_lossy(value: &str) -> Self {
        match value {
            "local" => Self::Local,
            "provisioned" => Self::Provisioned,
            "remote" => Self::Remote,
            other => {
                tracing::warn!(
                    browser = %other,
                    "Invalid browser option, falling back to local browser"
                );
                Self::Local
            }
        }
    }

    /// String form for logs and run metadata.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Local => "local",
            Self::Provisioned => "provisioned",
            Self::Remote => "remote",
        }
    }
}

/// Launch profile for a browser session.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BrowserProfile {
    /// Run without a visible window.
    pub headless: bool,
    /// Highlight interactive elements on the page.
    pub highlight_elements: bool,
    /// Launch without a persistent user data directory.
    pub incognito: bool,
    /// Keep the browser alive across agent pauses.
    pub keep_alive: bool,
    /// Path to a storage-state file to load and persist (login tasks).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub storage_state: Option<PathBuf>,
    /// Directory for downloads (login tasks).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub downloads_path: Option<PathBuf>,
}

impl Default for BrowserProfile {
    fn default() -> Self {
        Self {
            headless: false,
            highlight_elements: true,
            incognito: true,
            keep_alive: true,
            storage_state: None,
            downloads_path: None,
        }
    }
}

/// Everything a backend needs to launch one session.
#[derive(Debug, Clone)]
pub struct LaunchSpec {
    /// Launch profile.
    pub profile: BrowserProfile,
    /// Remote CDP URL to attach to instead of launching locally.
    pub cdp_url: Option<String>,
}

/// A live browser session.
#[async_trait]
pub trait BrowserSession: Send + Sync {
    /// Opaque identifier for logs.
    fn session_id(&self) -> &str;

    /// Starts the session. Must be called before the agent runs.
    async fn start(&self) -> Result<(), BrowserError>;

    /// Returns the cookies currently held by the session.
    async fn get_cookies(&self) -> Result<Vec<Cookie>, BrowserError>;

    /// Kills the session. Idempotent; bounded by the caller's timeout.
    async fn kill(&self) -> Result<(), BrowserError>;
}

/// Something that can launch browser sessions.
#[async_trait]
pub trait BrowserBackend: Send + Sync {
    /// Launches (but does not start) a session for the given spec.
    async fn launch(&self, spec: LaunchSpec) -> Result<Arc<dyn BrowserSession>, BrowserError>;
}

/// Options controlling session setup, resolved from config and CLI flags.
#[derive(Debug, Clone, Default)]
pub struct SessionOptions {
    /// Which source to acquire the session from.
    pub source: BrowserSource,
    /// Headless launch.
    pub headless: bool,
    /// Highlight interactive elements.
    pub highlight_elements: bool,
    /// Preconfigured CDP URL for [`BrowserSource::Remote`].
    pub remote_cdp_url: Option<String>,
}

/// Acquires a started browser session for the task.
///
/// Resolves the CDP URL according to the configured source (falling back to
/// a local launch when provisioning fails or is unconfigured), builds the
/// launch profile (seeding storage state for login tasks), launches via the
/// backend, and starts the session.
pub async fn setup_session(
    task: &Task,
    options: &SessionOptions,
    backend: &dyn BrowserBackend,
    provisioner: Option<&dyn CdpProvisioner>,
    task_dir: &Path,
) -> Result<Arc<dyn BrowserSession>, BrowserError> {
    let cdp_url = resolve_cdp_url(task, options, provisioner).await;
    let profile = build_profile(task, options, task_dir).await?;

    let session = backend
        .launch(LaunchSpec {
            profile,
            cdp_url,
        })
        .await?;

    session.start().await?;
    tracing::debug!(task_id = %task.task_id, session_id = %session.session_id(), "Browser session started");
    Ok(session)
}

/// Resolves the remote CDP URL for the configured source, if any.
async fn resolve_cdp_url(
    task: &Task,
    options: &SessionOptions,
    provisioner: Option<&dyn CdpProvisioner>,
) -> Option<String> {
    match options.source {
        BrowserSource::Local => None,
        BrowserSource::Provisioned => match provisioner {
            Some(provisioner) => match provisioner.provision(options.headless).await {
                Ok(url) => Some(url),
                Err(e) => {
                    tracing::error!(
                        task_id = %task.task_id,
                        error = %e,
                        "Failed to provision remote browser session, falling back to local browser"
                    );
                    None
                }
            },
            None => {
                tracing::warn!(
                    task_id = %task.task_id,
                    "Provisioned browser requested but no provisioner configured, using local browser"
                );
                None
            }
        },
        BrowserSource::Remote => match &options.remote_cdp_url {
            Some(url) => Some(url.clone()),
            None => {
                tracing::warn!(
                    task_id = %task.task_id,
                    "Remote browser requested but no CDP URL configured, using local browser"
                );
                None
            }
        },
    }
}

/// Builds the launch profile, seeding login-task storage in the task dir.
async fn build_profile(
    task: &Task,
    options: &SessionOptions,
    task_dir: &Path,
) -> Result<BrowserProfile, BrowserError> {
    let mut profile = BrowserProfile {
        headless: options.headless,
        highlight_elements: options.highlight_elements,
        ..BrowserProfile::default()
    };

    if task.is_login_task() {
        // Login tasks keep persistent storage state so the end-of-run
        // cookie check has something to read. A persistent state conflicts
        // with incognito, so that flag is dropped for them.
        fs::create_dir_all(task_dir).await?;

        let storage_state = task_dir.join("storage_state.json");
        if !fs::try_exists(&storage_state).await.unwrap_or(false) {
            let empty = json!({"cookies": [], "origins": []});
            fs::write(&storage_state, serde_json::to_vec(&empty)?).await?;
        }

        let downloads = task_dir.join("downloads");
        fs::create_dir_all(&downloads).await?;

        profile.incognito = false;
        profile.storage_state = Some(storage_state);
        profile.downloads_path = Some(downloads);

        tracing::debug!(
            task_id = %task.task_id,
            storage_state = %task_dir.join("storage_state.json").display(),
            "Login task configured to persist cookies"
        );
    }

    Ok(profile)
}

/// Kills a session with a bounded timeout, logging instead of propagating.
pub async fn cleanup_session_safe(session: &dyn BrowserSession) {
    match tokio::time::timeout(CLEANUP_TIMEOUT, session.kill()).await {
        Ok(Ok(())) => {
            tracing::debug!(session_id = %session.session_id(), "Browser cleanup completed");
        }
        Ok(Err(e)) => {
            tracing::warn!(session_id = %session.session_id(), error = %e, "Browser cleanup failed");
        }
        Err(_) => {
            tracing::warn!(
                session_id = %session.session_id(),
                timeout_secs = CLEANUP_TIMEOUT.as_secs(),
                "Browser cleanup timed out"
            );
        }
    }
}
