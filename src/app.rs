use std::path::{Path, PathBuf};

use anyhow::{anyhow, Context, Result};
use globset::Glob;
use serde::Deserialize;
use thiserror::Error;

/// Extension search order for convention entrypoints. Load-bearing: the
/// first existing candidate wins.
const EXTENSIONS: [&str; 4] = ["js", "ts", "jsx", "tsx"];

const CONFIG_FILE: &str = "smallweb.json";

/// A tenant application rooted at `rootDir/<name>`.
#[derive(Debug, Clone)]
pub struct App {
    pub name: String,
    pub dir: PathBuf,
    pub entrypoint: Entrypoint,
    pub config: AppConfig,
}

/// Why an app failed to load. The dispatcher answers 404 for an unknown or
/// unreadable app, but 500 when a valid app directory exists and nothing
/// inside it resolves to an entrypoint.
#[derive(Debug, Error)]
pub enum LoadError {
    #[error("no app named {0:?}")]
    NotFound(String),

    #[error("failed to load config for app {name:?}: {source}")]
    Config {
        name: String,
        #[source]
        source: anyhow::Error,
    },

    #[error("app {0:?} has no entrypoint")]
    MissingEntrypoint(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Entrypoint {
    /// A file handed to the evaluator (or served statically for index.html).
    File(PathBuf),
    /// A sentinel routing to an in-process handler.
    Reserved(Reserved),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reserved {
    Webdav,
    Cli,
    Docs,
    Static,
    Editor,
}

impl Reserved {
    fn from_name(name: &str) -> Option<Self> {
        match name {
            "webdav" => Some(Self::Webdav),
            "cli" => Some(Self::Cli),
            "docs" => Some(Self::Docs),
            "static" => Some(Self::Static),
            "editor" => Some(Self::Editor),
            _ => None,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::Webdav => "webdav",
            Self::Cli => "cli",
            Self::Docs => "docs",
            Self::Static => "static",
            Self::Editor => "editor",
        }
    }
}

impl Entrypoint {
    /// The string form written into `EvaluatorInput.entrypoint` and the
    /// access log.
    pub fn display(&self) -> String {
        match self {
            Self::File(path) => path.display().to_string(),
            Self::Reserved(reserved) => format!("reserved:{}", reserved.name()),
        }
    }
}

/// Per-app configuration read from `<app>/smallweb.json`. All fields are
/// optional; a missing file means all defaults.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct AppConfig {
    pub entrypoint: Option<String>,
    pub private: bool,
    pub public_routes: Vec<String>,
    pub private_routes: Vec<String>,
    pub crons: Vec<CronEntry>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CronEntry {
    pub schedule: String,
    #[serde(default)]
    pub args: Vec<String>,
}

impl AppConfig {
    /// Effective privacy for a request path: start from the app-level flag,
    /// clear it for each matching public route, then set it for each
    /// matching private route. `/_auth/` paths are always private so the
    /// login flow stays mounted.
    pub fn is_private(&self, path: &str) -> bool {
        if path.starts_with("/_auth/") {
            return true;
        }
        let mut private = self.private;
        for pattern in &self.public_routes {
            if glob_match(pattern, path) {
                private = false;
            }
        }
        for pattern in &self.private_routes {
            if glob_match(pattern, path) {
                private = true;
            }
        }
        private
    }
}

fn glob_match(pattern: &str, path: &str) -> bool {
    match Glob::new(pattern) {
        Ok(glob) => glob.compile_matcher().is_match(path),
        Err(e) => {
            tracing::warn!(pattern = %pattern, error = %e, "Ignoring invalid route glob");
            false
        }
    }
}

impl App {
    /// Load the app named by a host alias: read its config and resolve its
    /// entrypoint.
    pub async fn load(root_dir: &Path, name: &str) -> Result<Self, LoadError> {
        if name.is_empty()
            || !name
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
        {
            return Err(LoadError::NotFound(name.to_string()));
        }

        let dir = root_dir.join(name);
        let config = load_config(&dir).await.map_err(|source| LoadError::Config {
            name: name.to_string(),
            source,
        })?;

        let entrypoint = match &config.entrypoint {
            Some(selector) => match selector.strip_prefix("reserved:") {
                Some(reserved) => Entrypoint::Reserved(Reserved::from_name(reserved).ok_or_else(
                    || LoadError::Config {
                        name: name.to_string(),
                        source: anyhow!("unknown reserved entrypoint {selector:?}"),
                    },
                )?),
                None => Entrypoint::File(dir.join(selector)),
            },
            None => match resolve_entrypoint(root_dir, name).await {
                Some(path) => Entrypoint::File(path),
                // A present app directory is a valid app even when nothing
                // inside it resolves; that is a server-side error, not an
                // unknown host.
                None if is_dir(&dir).await => {
                    return Err(LoadError::MissingEntrypoint(name.to_string()))
                }
                None => return Err(LoadError::NotFound(name.to_string())),
            },
        };

        Ok(Self {
            name: name.to_string(),
            dir,
            entrypoint,
            config,
        })
    }
}

async fn load_config(dir: &Path) -> Result<AppConfig> {
    let path = dir.join(CONFIG_FILE);
    let raw = match tokio::fs::read_to_string(&path).await {
        Ok(raw) => raw,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(AppConfig::default()),
        Err(e) => {
            return Err(e).with_context(|| format!("Failed to read {}", path.display()));
        }
    };
    serde_json::from_str(&raw).with_context(|| format!("Failed to parse {}", path.display()))
}

/// Convention search for an app's entrypoint, strict first-hit order:
/// `rootDir/alias.<ext>`, `rootDir/alias/mod.<ext>`,
/// `rootDir/alias/alias.<ext>`, then `rootDir/alias/index.html`.
pub async fn resolve_entrypoint(root_dir: &Path, alias: &str) -> Option<PathBuf> {
    let dir = root_dir.join(alias);

    for ext in EXTENSIONS {
        let candidate = root_dir.join(format!("{alias}.{ext}"));
        if is_file(&candidate).await {
            return Some(candidate);
        }
    }
    for ext in EXTENSIONS {
        let candidate = dir.join(format!("mod.{ext}"));
        if is_file(&candidate).await {
            return Some(candidate);
        }
    }
    for ext in EXTENSIONS {
        let candidate = dir.join(format!("{alias}.{ext}"));
        if is_file(&candidate).await {
            return Some(candidate);
        }
    }

    let index = dir.join("index.html");
    is_file(&index).await.then_some(index)
}

async fn is_file(path: &Path) -> bool {
    tokio::fs::metadata(path)
        .await
        .map(|meta| meta.is_file())
        .unwrap_or(false)
}

async fn is_dir(path: &Path) -> bool {
    tokio::fs::metadata(path)
        .await
        .map(|meta| meta.is_dir())
        .unwrap_or(false)
}

/// The leftmost host label names the app; a host with no dot is its own
/// alias.
pub fn alias(host: &str) -> &str {
    host.split_once('.').map_or(host, |(label, _)| label)
}
