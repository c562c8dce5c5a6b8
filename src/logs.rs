use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;

use crate::codec::{base64_bytes, SerializedRequest, SerializedResponse};

/// One access-log line. `response` is absent when the evaluator failed;
/// `logs` carries the child's combined stdout+stderr and is empty for
/// requests that never reached the evaluator.
#[derive(Debug, Serialize)]
pub struct AccessRecord {
    pub timestamp: DateTime<Utc>,
    pub entrypoint: String,
    pub request: SerializedRequest,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub response: Option<SerializedResponse>,
    /// Wall-clock handling time in nanoseconds.
    pub duration: u64,
    #[serde(with = "base64_bytes")]
    pub logs: Vec<u8>,
}

/// Append-only per-tenant log under `rootDir/.logs/<alias>.jsonl`. Records
/// are serialized per file so concurrent requests interleave only at line
/// boundaries. Write failures never fail the request: they are reported and
/// swallowed.
pub struct AccessLog {
    dir: PathBuf,
    files: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl AccessLog {
    pub fn new(root_dir: &Path) -> Self {
        Self {
            dir: root_dir.join(".logs"),
            files: Mutex::new(HashMap::new()),
        }
    }

    pub async fn append(&self, alias: &str, record: &AccessRecord) {
        if let Err(e) = self.try_append(alias, record).await {
            tracing::error!(app = %alias, error = %e, "Failed to write access log record");
        }
    }

    async fn try_append(&self, alias: &str, record: &AccessRecord) -> Result<()> {
        let file_lock = {
            let mut files = self.files.lock().await;
            files
                .entry(alias.to_string())
                .or_insert_with(|| Arc::new(Mutex::new(())))
                .clone()
        };
        let _guard = file_lock.lock().await;

        tokio::fs::create_dir_all(&self.dir)
            .await
            .with_context(|| format!("Failed to create {}", self.dir.display()))?;

        let mut line = serde_json::to_vec(record).context("Failed to encode access record")?;
        line.push(b'\n');

        let path = self.dir.join(format!("{alias}.jsonl"));
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await
            .with_context(|| format!("Failed to open {}", path.display()))?;
        file.write_all(&line).await?;
        file.flush().await?;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(url: &str) -> AccessRecord {
        AccessRecord {
            timestamp: Utc::now(),
            entrypoint: "/srv/blog/mod.ts".into(),
            request: SerializedRequest {
                url: url.into(),
                method: "GET".into(),
                headers: vec![("accept".into(), "text/html".into())],
                body: Vec::new(),
            },
            response: Some(SerializedResponse {
                status: 200,
                headers: vec![],
                body: Vec::new(),
            }),
            duration: 1_500_000,
            logs: b"booted\n".to_vec(),
        }
    }

    #[tokio::test]
    async fn records_append_as_parseable_lines() {
        let root = tempfile::tempdir().unwrap();
        let log = AccessLog::new(root.path());

        log.append("blog", &record("http://blog.example.test/a?x=1&y=2"))
            .await;
        log.append("blog", &record("http://blog.example.test/b")).await;

        let raw = std::fs::read_to_string(root.path().join(".logs/blog.jsonl")).unwrap();
        let lines: Vec<_> = raw.lines().collect();
        assert_eq!(lines.len(), 2);

        let first: serde_json::Value = serde_json::from_str(lines[0]).unwrap();
        assert_eq!(
            first["request"]["url"].as_str().unwrap(),
            "http://blog.example.test/a?x=1&y=2"
        );
        assert_eq!(first["response"]["status"].as_u64().unwrap(), 200);
    }

    #[tokio::test]
    async fn ampersands_survive_encoding_verbatim() {
        let root = tempfile::tempdir().unwrap();
        let log = AccessLog::new(root.path());

        log.append("shop", &record("http://shop.example.test/q?a=1&b=2"))
            .await;

        let raw = std::fs::read_to_string(root.path().join(".logs/shop.jsonl")).unwrap();
        assert!(raw.contains("a=1&b=2"));
        assert!(!raw.contains("\\u0026"));
    }

    #[tokio::test]
    async fn failed_evaluations_log_without_response() {
        let root = tempfile::tempdir().unwrap();
        let log = AccessLog::new(root.path());

        let mut failed = record("http://blog.example.test/boom");
        failed.response = None;
        failed.logs = b"error: stack trace".to_vec();
        log.append("blog", &failed).await;

        let raw = std::fs::read_to_string(root.path().join(".logs/blog.jsonl")).unwrap();
        let value: serde_json::Value = serde_json::from_str(raw.lines().next().unwrap()).unwrap();
        assert!(value.get("response").is_none());
        assert!(value.get("logs").is_some());
    }

    #[tokio::test]
    async fn unwritable_log_directory_is_swallowed() {
        let root = tempfile::tempdir().unwrap();
        // Occupy the .logs path with a file so create_dir_all fails.
        std::fs::write(root.path().join(".logs"), "").unwrap();

        let log = AccessLog::new(root.path());
        log.append("blog", &record("http://blog.example.test/")).await;
    }
}
