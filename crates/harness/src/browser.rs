//! Launching and cleaning up the browser processes that run the tests.

use std::fs::File;
use std::path::{Path, PathBuf};
use std::process::{Child, Command, Stdio};
use std::time::{Duration, Instant};

use anyhow::{bail, Context, Result};
use reftest_core::model::BrowserSpec;
use tempfile::TempDir;

use crate::refsync::sync_tree;

const TERMINATE_GRACE: Duration = Duration::from_secs(10);

/// Capability interface the supervisor drives browsers through.
pub trait BrowserProcess: Send {
    fn name(&self) -> &str;
    /// Executable path, forwarded to the client so it can ask to be closed.
    fn path(&self) -> &Path;
    /// Prepares an isolated profile.
    fn setup(&mut self) -> Result<()>;
    fn start(&mut self, url: &str) -> Result<()>;
    /// Blocks until the user closes the browser.
    fn wait(&mut self) -> Result<()>;
    /// Stops the process and removes the profile.
    fn teardown(&mut self) -> Result<()>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BrowserKind {
    Firefox,
    Chrome,
    /// Any other executable; receives the test URL as its only argument.
    Generic,
}

impl BrowserKind {
    /// Detected from the configured name or path, case-insensitively.
    pub fn detect(name: Option<&str>, path: &str) -> Self {
        let path = path.to_lowercase();
        let name = name.map(str::to_lowercase).unwrap_or_default();
        let mentions = |key: &str| name.contains(key) || path.contains(key);
        if mentions("firefox") {
            BrowserKind::Firefox
        } else if mentions("chrome") {
            BrowserKind::Chrome
        } else {
            BrowserKind::Generic
        }
    }

    fn default_name(self) -> Option<&'static str> {
        match self {
            BrowserKind::Firefox => Some("firefox"),
            BrowserKind::Chrome => Some("chrome"),
            BrowserKind::Generic => None,
        }
    }

    /// Binary inside a macOS application bundle.
    fn bundle_binary(self) -> Option<&'static str> {
        match self {
            BrowserKind::Firefox => Some("firefox-bin"),
            BrowserKind::Chrome => Some("Google Chrome"),
            BrowserKind::Generic => None,
        }
    }
}

#[derive(Debug)]
pub struct BrowserCommand {
    name: String,
    path: PathBuf,
    kind: BrowserKind,
    /// Copied into the profile of Firefox instances.
    profile_template: Option<PathBuf>,
    log_path: PathBuf,
    profile: Option<TempDir>,
    child: Option<Child>,
}

impl BrowserCommand {
    /// Resolves a browser definition. Fails if the executable does not exist.
    pub fn from_spec(spec: &BrowserSpec, doc_root: &Path, log_dir: &Path) -> Result<Self> {
        let kind = BrowserKind::detect(spec.name.as_deref(), &spec.path);
        let mut path = PathBuf::from(&spec.path);
        if cfg!(target_os = "macos") && spec.path.trim_end_matches('/').ends_with(".app") {
            if let Some(binary) = kind.bundle_binary() {
                path = path.join("Contents").join("MacOS").join(binary);
            }
        }
        if !path.exists() {
            bail!("path to browser '{}' does not exist", path.display());
        }

        let name = spec
            .name
            .clone()
            .or_else(|| kind.default_name().map(str::to_string))
            .or_else(|| {
                path.file_stem()
                    .map(|stem| stem.to_string_lossy().into_owned())
            })
            .unwrap_or_else(|| "browser".to_string());

        let template = doc_root.join("test").join("resources").join("firefox");
        let profile_template = (kind == BrowserKind::Firefox && template.is_dir()).then_some(template);

        Ok(Self {
            log_path: log_dir.join(format!("browser-{name}.log")),
            name,
            path,
            kind,
            profile_template,
            profile: None,
            child: None,
        })
    }

    pub fn kind(&self) -> BrowserKind {
        self.kind
    }

    fn args(&self, profile: &Path, url: &str) -> Vec<String> {
        match self.kind {
            BrowserKind::Firefox => {
                let mut args = Vec::new();
                if cfg!(target_os = "macos") {
                    args.push("-foreground".to_string());
                }
                args.extend([
                    "-no-remote".to_string(),
                    "-profile".to_string(),
                    profile.display().to_string(),
                    url.to_string(),
                ]);
                args
            }
            BrowserKind::Chrome => vec![
                format!("--user-data-dir={}", profile.display()),
                "--no-first-run".to_string(),
                "--disable-sync".to_string(),
                url.to_string(),
            ],
            BrowserKind::Generic => vec![url.to_string()],
        }
    }
}

impl BrowserProcess for BrowserCommand {
    fn name(&self) -> &str {
        &self.name
    }

    fn path(&self) -> &Path {
        &self.path
    }

    fn setup(&mut self) -> Result<()> {
        let temp = tempfile::Builder::new()
            .prefix("reftest-")
            .tempdir()
            .context("create profile dir")?;
        if let Some(template) = &self.profile_template {
            sync_tree(template, &temp.path().join("profile"))
                .with_context(|| format!("copy profile template {}", template.display()))?;
        }
        self.profile = Some(temp);
        Ok(())
    }

    fn start(&mut self, url: &str) -> Result<()> {
        let profile = self
            .profile
            .as_ref()
            .map(|p| p.path().join("profile"))
            .context("browser started before setup")?;
        if let Some(parent) = self.log_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let log = File::create(&self.log_path)
            .with_context(|| format!("create {}", self.log_path.display()))?;
        let child = Command::new(&self.path)
            .args(self.args(&profile, url))
            .stdin(Stdio::null())
            .stdout(Stdio::from(log.try_clone()?))
            .stderr(Stdio::from(log))
            .spawn()
            .with_context(|| format!("spawn {}", self.path.display()))?;
        tracing::info!(browser = %self.name, pid = child.id(), "browser started");
        self.child = Some(child);
        Ok(())
    }

    fn wait(&mut self) -> Result<()> {
        if let Some(child) = self.child.as_mut() {
            let status = child.wait().context("wait for browser")?;
            tracing::info!(browser = %self.name, %status, "browser exited");
        }
        Ok(())
    }

    fn teardown(&mut self) -> Result<()> {
        if let Some(mut child) = self.child.take() {
            if child.try_wait()?.is_none() {
                terminate(&child);
                let deadline = Instant::now() + TERMINATE_GRACE;
                while child.try_wait()?.is_none() && Instant::now() < deadline {
                    std::thread::sleep(Duration::from_millis(100));
                }
                if child.try_wait()?.is_none() {
                    tracing::info!(browser = %self.name, "process still running; killing");
                    child.kill().context("kill browser")?;
                }
            }
            child.wait().context("wait for browser")?;
        }
        if let Some(profile) = self.profile.take() {
            profile.close().context("remove profile dir")?;
        }
        Ok(())
    }
}

/// Asks the process to exit. Without a portable SIGTERM this shells out to
/// `kill` on unix; elsewhere the caller falls back to a hard kill.
fn terminate(child: &Child) {
    if cfg!(unix) {
        let status = Command::new("kill")
            .arg("-TERM")
            .arg(child.id().to_string())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status();
        if let Err(e) = status {
            tracing::debug!(pid = child.id(), error = %e, "failed to send SIGTERM");
        }
    }
}
