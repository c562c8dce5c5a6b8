use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::process::Stdio;

use anyhow::{bail, Context, Result};
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tokio::sync::Semaphore;
use tracing::debug;

use crate::codec::{CommandInput, EvaluatorInput, SerializedRequest, SerializedResponse};
use crate::config::ServerConfig;
use crate::envfile;

/// The support script shipped with the server and rewritten verbatim into
/// the data directory at startup. Read-only at runtime.
const SUPPORT_SOURCE: &str = include_str!("../sandbox.ts");
const SUPPORT_NAME: &str = "sandbox.ts";

/// Overrides the evaluator binary; falls back to a PATH lookup of `deno`.
const EXEC_PATH_VAR: &str = "DENO_EXEC_PATH";

/// Flag granting the sandbox script full permissions; the script itself is
/// the trust boundary for app code.
const PERMISSION_FLAG: &str = "--allow-all";

#[derive(Debug, Error)]
pub enum EvaluatorError {
    #[error("failed to spawn evaluator: {0}")]
    Spawn(#[source] std::io::Error),

    #[error("evaluator exited with {status}")]
    Failed { status: String, output: Vec<u8> },

    #[error("evaluator wrote no decodable response artifact")]
    Artifact { output: Vec<u8> },

    #[error(transparent)]
    Env(#[from] anyhow::Error),
}

impl EvaluatorError {
    /// The child's combined stdout+stderr, which becomes the 500 body.
    pub fn output(&self) -> &[u8] {
        match self {
            Self::Failed { output, .. } | Self::Artifact { output, .. } => output,
            Self::Spawn(_) | Self::Env(_) => &[],
        }
    }
}

/// Spawns one evaluator child per invocation. Fan-out is bounded by a
/// worker semaphore; children are killed when the invoking task is dropped.
pub struct Evaluator {
    exec_path: PathBuf,
    support_path: PathBuf,
    root_dir: PathBuf,
    base_env: HashMap<String, String>,
    workers: Semaphore,
}

impl Evaluator {
    /// Resolve the evaluator binary, (re)write the support file into the
    /// data directory, and build the invoker.
    pub async fn materialize(config: &ServerConfig) -> Result<Self> {
        let exec_path = match std::env::var_os(EXEC_PATH_VAR) {
            Some(path) => PathBuf::from(path),
            None => which::which("deno").context("deno not found on PATH")?,
        };

        tokio::fs::create_dir_all(&config.data_dir)
            .await
            .with_context(|| format!("Failed to create {}", config.data_dir.display()))?;
        let support_path = config.data_dir.join(SUPPORT_NAME);
        tokio::fs::write(&support_path, SUPPORT_SOURCE)
            .await
            .with_context(|| format!("Failed to write {}", support_path.display()))?;

        Ok(Self {
            exec_path,
            support_path,
            root_dir: config.root_dir.clone(),
            base_env: config.env.clone(),
            workers: Semaphore::new(config.max_evaluators),
        })
    }

    #[cfg(test)]
    pub(crate) fn with_exec(
        exec_path: PathBuf,
        support_path: PathBuf,
        root_dir: PathBuf,
        base_env: HashMap<String, String>,
    ) -> Self {
        Self {
            exec_path,
            support_path,
            root_dir,
            base_env,
            workers: Semaphore::new(4),
        }
    }

    /// Environment for a run: the server config's `env` table seeded below
    /// the layered `.env` files, so files always win.
    fn compose_env(&self, entrypoint: &Path) -> Result<HashMap<String, String>> {
        let mut env = self.base_env.clone();
        env.extend(envfile::compose(&self.root_dir, entrypoint)?);
        Ok(env)
    }

    /// Dispatch one web request into a fresh child. On success returns the
    /// decoded response artifact and the child's combined output; on any
    /// failure the combined output rides in the error.
    pub async fn fetch(
        &self,
        entrypoint: &Path,
        req: &SerializedRequest,
    ) -> Result<(SerializedResponse, Vec<u8>), EvaluatorError> {
        let _permit = self
            .workers
            .acquire()
            .await
            .context("evaluator worker pool closed")?;

        let env = self.compose_env(entrypoint)?;
        let artifacts =
            tempfile::tempdir().context("Failed to create evaluator artifact directory")?;
        let output_path = artifacts.path().join("response.json");

        let input = EvaluatorInput {
            req,
            entrypoint: entrypoint.display().to_string(),
            env: &env,
            output: output_path.display().to_string(),
        };
        let stdin_line = encode_stdin(&input).map_err(EvaluatorError::Env)?;

        let cwd = entrypoint.parent().unwrap_or(&self.root_dir);
        let mut child = Command::new(&self.exec_path)
            .arg("run")
            .arg(PERMISSION_FLAG)
            .arg(&self.support_path)
            .current_dir(cwd)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(EvaluatorError::Spawn)?;

        feed_stdin(&mut child, &stdin_line).await;

        let output = child
            .wait_with_output()
            .await
            .map_err(EvaluatorError::Spawn)?;
        let combined = [output.stdout, output.stderr].concat();

        if !output.status.success() {
            return Err(EvaluatorError::Failed {
                status: output.status.to_string(),
                output: combined,
            });
        }

        let artifact = match tokio::fs::read(&output_path).await {
            Ok(bytes) => bytes,
            Err(_) => return Err(EvaluatorError::Artifact { output: combined }),
        };
        match serde_json::from_slice(&artifact) {
            Ok(response) => Ok((response, combined)),
            Err(_) => Err(EvaluatorError::Artifact { output: combined }),
        }
    }

    /// Cron command mode: same support file and env composition, arguments
    /// from the cron entry, stdio discarded.
    pub async fn command(&self, entrypoint: &Path, args: &[String]) -> Result<()> {
        let _permit = self
            .workers
            .acquire()
            .await
            .context("evaluator worker pool closed")?;

        let env = self.compose_env(entrypoint)?;
        let input = CommandInput {
            entrypoint: entrypoint.display().to_string(),
            env: &env,
            args,
        };
        let stdin_line = encode_stdin(&input)?;

        let cwd = entrypoint.parent().unwrap_or(&self.root_dir);
        let mut child = Command::new(&self.exec_path)
            .arg("run")
            .arg(PERMISSION_FLAG)
            .arg(&self.support_path)
            .current_dir(cwd)
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .context("Failed to spawn evaluator")?;

        feed_stdin(&mut child, &stdin_line).await;

        let status = child.wait().await.context("Failed to wait on evaluator")?;
        if !status.success() {
            bail!("evaluator exited with {status}");
        }
        Ok(())
    }
}

fn encode_stdin<T: serde::Serialize>(input: &T) -> Result<Vec<u8>> {
    let mut line = serde_json::to_vec(input).context("Failed to encode evaluator input")?;
    line.push(b'\n');
    Ok(line)
}

/// Write the input line and close stdin. A child that exits without reading
/// makes this fail with EPIPE; that is not an invocation error on its own —
/// the exit status decides.
async fn feed_stdin(child: &mut tokio::process::Child, line: &[u8]) {
    if let Some(mut stdin) = child.stdin.take() {
        if let Err(e) = stdin.write_all(line).await {
            debug!(error = %e, "Evaluator closed stdin before reading input");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::fs::PermissionsExt;

    /// Write an executable stand-in evaluator and return its path. The
    /// script sees the same stdin contract as the real binary.
    fn fake_evaluator(dir: &Path, script: &str) -> PathBuf {
        let path = dir.join("fake-deno");
        std::fs::write(&path, format!("#!/bin/sh\n{script}\n")).unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
        path
    }

    fn request() -> SerializedRequest {
        SerializedRequest {
            url: "http://blog.example.test/hello".into(),
            method: "GET".into(),
            headers: vec![("accept".into(), "text/html".into())],
            body: Vec::new(),
        }
    }

    fn evaluator_with(script_dir: &Path, root: &Path, script: &str) -> Evaluator {
        let exec = fake_evaluator(script_dir, script);
        Evaluator::with_exec(
            exec,
            script_dir.join("sandbox.ts"),
            root.to_path_buf(),
            HashMap::new(),
        )
    }

    #[tokio::test]
    async fn successful_run_decodes_artifact_and_captures_output() {
        let scripts = tempfile::tempdir().unwrap();
        let root = tempfile::tempdir().unwrap();
        let app_dir = root.path().join("blog");
        std::fs::create_dir(&app_dir).unwrap();

        // Extracts the output path from the input line, writes a canned
        // artifact there, and logs to both streams.
        let evaluator = evaluator_with(
            scripts.path(),
            root.path(),
            r#"line=$(cat)
out=$(printf '%s' "$line" | sed -n 's/.*"output":"\([^"]*\)".*/\1/p')
printf '{"status":200,"headers":[["content-type","text/plain"]],"body":"aGk="}' > "$out"
echo booted
echo warn >&2"#,
        );

        let (response, logs) = evaluator
            .fetch(&app_dir.join("mod.ts"), &request())
            .await
            .unwrap();
        assert_eq!(response.status, 200);
        assert_eq!(response.body, b"hi");
        let logs = String::from_utf8(logs).unwrap();
        assert!(logs.contains("booted"));
        assert!(logs.contains("warn"));
    }

    #[tokio::test]
    async fn nonzero_exit_carries_combined_output() {
        let scripts = tempfile::tempdir().unwrap();
        let root = tempfile::tempdir().unwrap();
        let app_dir = root.path().join("blog");
        std::fs::create_dir(&app_dir).unwrap();

        let evaluator = evaluator_with(
            scripts.path(),
            root.path(),
            "cat > /dev/null\necho boom >&2\nexit 3",
        );

        let err = evaluator
            .fetch(&app_dir.join("mod.ts"), &request())
            .await
            .unwrap_err();
        match &err {
            EvaluatorError::Failed { output, .. } => {
                assert!(String::from_utf8_lossy(output).contains("boom"));
            }
            other => panic!("expected Failed, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn missing_artifact_is_an_invocation_failure() {
        let scripts = tempfile::tempdir().unwrap();
        let root = tempfile::tempdir().unwrap();
        let app_dir = root.path().join("blog");
        std::fs::create_dir(&app_dir).unwrap();

        let evaluator =
            evaluator_with(scripts.path(), root.path(), "cat > /dev/null\necho ran\nexit 0");

        let err = evaluator
            .fetch(&app_dir.join("mod.ts"), &request())
            .await
            .unwrap_err();
        assert!(matches!(err, EvaluatorError::Artifact { .. }));
        assert!(String::from_utf8_lossy(err.output()).contains("ran"));
    }

    #[tokio::test]
    async fn env_layers_reach_the_child() {
        let scripts = tempfile::tempdir().unwrap();
        let root = tempfile::tempdir().unwrap();
        let app_dir = root.path().join("blog");
        std::fs::create_dir(&app_dir).unwrap();
        std::fs::write(root.path().join(".env"), "A=1\nB=2\n").unwrap();
        std::fs::write(app_dir.join(".env"), "B=3\nC=4\n").unwrap();

        // Echo the input line back as the artifact body so the test can
        // inspect exactly what the child received.
        let evaluator = evaluator_with(
            scripts.path(),
            root.path(),
            r#"line=$(cat)
out=$(printf '%s' "$line" | sed -n 's/.*"output":"\([^"]*\)".*/\1/p')
printf '{"status":200,"headers":[],"body":"%s"}' "$(printf '%s' "$line" | base64 -w0)" > "$out""#,
        );

        let (response, _) = evaluator
            .fetch(&app_dir.join("mod.ts"), &request())
            .await
            .unwrap();
        let input: serde_json::Value = serde_json::from_slice(&response.body).unwrap();
        assert_eq!(input["env"]["A"], "1");
        assert_eq!(input["env"]["B"], "3");
        assert_eq!(input["env"]["C"], "4");
    }

    #[tokio::test]
    async fn command_mode_reports_exit_status() {
        let scripts = tempfile::tempdir().unwrap();
        let root = tempfile::tempdir().unwrap();
        let app_dir = root.path().join("jobs");
        std::fs::create_dir(&app_dir).unwrap();

        let ok = evaluator_with(scripts.path(), root.path(), "cat > /dev/null\nexit 0");
        ok.command(&app_dir.join("mod.ts"), &["refresh".into()])
            .await
            .unwrap();

        let failing = evaluator_with(scripts.path(), root.path(), "cat > /dev/null\nexit 1");
        assert!(failing
            .command(&app_dir.join("mod.ts"), &["refresh".into()])
            .await
            .is_err());
    }

    #[tokio::test]
    async fn spawn_failure_has_empty_output() {
        let root = tempfile::tempdir().unwrap();
        let evaluator = Evaluator::with_exec(
            PathBuf::from("/nonexistent/evaluator"),
            PathBuf::from("/nonexistent/sandbox.ts"),
            root.path().to_path_buf(),
            HashMap::new(),
        );

        let err = evaluator
            .fetch(&root.path().join("a.ts"), &request())
            .await
            .unwrap_err();
        assert!(matches!(err, EvaluatorError::Spawn(_)));
        assert!(err.output().is_empty());
    }
}
