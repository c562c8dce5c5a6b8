use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use clap::Args;

/// Flags for the `up` subcommand. Every flag has a `SMALLWEB_*` environment
/// fallback so the server can be configured without a wrapper script.
#[derive(Debug, Clone, Args)]
pub struct UpArgs {
    /// Root directory containing the app directories
    #[arg(long, env = "SMALLWEB_DIR", default_value = "~/smallweb")]
    pub dir: String,

    /// Apex domain served by this instance (e.g. "example.com")
    #[arg(long, env = "SMALLWEB_DOMAIN", default_value = "localhost")]
    pub domain: String,

    /// Bind address
    #[arg(long, env = "SMALLWEB_HOST", default_value = "0.0.0.0")]
    pub host: String,

    /// Listen port (default 7777, or 443 when --cert/--key are set)
    #[arg(long, env = "SMALLWEB_PORT")]
    pub port: Option<u16>,

    /// Path to TLS certificate PEM file
    #[arg(long, env = "SMALLWEB_CERT")]
    pub cert: Option<PathBuf>,

    /// Path to TLS private key PEM file
    #[arg(long, env = "SMALLWEB_KEY")]
    pub key: Option<PathBuf>,

    /// Account allowed to log in with a session; empty disables session auth
    #[arg(long, env = "SMALLWEB_EMAIL", default_value = "")]
    pub email: String,

    /// Shell used by the CLI handler
    #[arg(long, env = "SMALLWEB_SHELL")]
    pub shell: Option<String>,

    /// Extra KEY=VALUE pairs seeded under the app env layers (repeatable)
    #[arg(long = "env", value_name = "KEY=VALUE")]
    pub env: Vec<String>,

    /// OAuth2 provider authorize endpoint
    #[arg(long, env = "SMALLWEB_AUTH_URL", default_value = "https://lastlogin.net/auth")]
    pub auth_url: String,

    /// OAuth2 provider token endpoint
    #[arg(long, env = "SMALLWEB_TOKEN_URL", default_value = "https://lastlogin.net/token")]
    pub token_url: String,

    /// OAuth2 provider userinfo endpoint
    #[arg(long, env = "SMALLWEB_USERINFO_URL", default_value = "https://lastlogin.net/userinfo")]
    pub userinfo_url: String,

    /// Upper bound on concurrent evaluator children
    #[arg(long, env = "SMALLWEB_MAX_EVALUATORS", default_value_t = 32)]
    pub max_evaluators: usize,
}

/// Resolved server configuration shared by all handlers.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Root directory containing the app directories
    pub root_dir: PathBuf,

    /// Apex domain; requests for it are redirected to `www.<domain>`
    pub domain: String,

    /// Bind address and port
    pub addr: SocketAddr,

    /// TLS certificate PEM path
    pub cert: Option<PathBuf>,

    /// TLS private key PEM path
    pub key: Option<PathBuf>,

    /// Required account for session login; empty means tokens only
    pub email: String,

    /// Shell handed to the CLI handler
    #[allow(dead_code)] // consumed by the CLI collaborator handler once wired in
    pub shell: Option<String>,

    /// Config-level env seeded below the `.env` file layers
    pub env: HashMap<String, String>,

    /// OAuth2 provider endpoints
    pub oauth: OauthEndpoints,

    /// Upper bound on concurrent evaluator children
    pub max_evaluators: usize,

    /// Data home for the support file and the session store
    pub data_dir: PathBuf,
}

#[derive(Debug, Clone)]
pub struct OauthEndpoints {
    pub auth_url: String,
    pub token_url: String,
    pub userinfo_url: String,
}

impl ServerConfig {
    pub fn from_args(args: UpArgs) -> Result<Self> {
        if args.cert.is_some() != args.key.is_some() {
            bail!("--cert and --key must be set together");
        }

        let tls = args.cert.is_some();
        let port = args.port.unwrap_or(if tls { 443 } else { 7777 });
        let ip: IpAddr = args
            .host
            .parse()
            .with_context(|| format!("Invalid bind address {:?}", args.host))?;

        let mut env = HashMap::new();
        for pair in &args.env {
            let (key, value) = pair
                .split_once('=')
                .with_context(|| format!("Invalid --env entry {pair:?}, expected KEY=VALUE"))?;
            env.insert(key.to_string(), value.to_string());
        }

        let data_dir = dirs::data_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("smallweb");

        Ok(Self {
            root_dir: expand_home(&args.dir),
            domain: args.domain,
            addr: SocketAddr::new(ip, port),
            cert: args.cert,
            key: args.key,
            email: args.email,
            shell: args.shell,
            env,
            oauth: OauthEndpoints {
                auth_url: args.auth_url,
                token_url: args.token_url,
                userinfo_url: args.userinfo_url,
            },
            max_evaluators: args.max_evaluators,
            data_dir,
        })
    }

    /// Whether the instance terminates TLS, which also decides the scheme
    /// used when reconstructing request URLs for the evaluator.
    pub fn tls_enabled(&self) -> bool {
        self.cert.is_some() && self.key.is_some()
    }

    pub fn tls_paths(&self) -> Result<(&PathBuf, &PathBuf)> {
        let cert = self.cert.as_ref().context("TLS certificate not set")?;
        let key = self.key.as_ref().context("TLS key not set")?;
        Ok((cert, key))
    }
}

fn expand_home(path: &str) -> PathBuf {
    if let Some(rest) = path.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest);
        }
    }
    PathBuf::from(path)
}
