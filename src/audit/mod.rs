pub mod store;

use std::{
    io::{self, Write},
    sync::{Arc, Mutex},
    time::Duration,
};

use anyhow::Context;
use chrono::{DateTime, Local};
use serde::Serialize;
use tracing_appender::rolling::{RollingFileAppender, Rotation};

use crate::{
    audit::store::AuditStore,
    config::{AuditConfig, AuditRotation},
};

const TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

/// How a request ended, as recorded in the audit trail.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditOutcome {
    Forwarded,
    Preflight,
    RateLimited,
    RouteNotFound,
    MethodNotAllowed,
    PayloadTooLarge,
    UpstreamError,
    InternalError,
}

impl AuditOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Forwarded => "forwarded",
            Self::Preflight => "preflight",
            Self::RateLimited => "rate_limited",
            Self::RouteNotFound => "route_not_found",
            Self::MethodNotAllowed => "method_not_allowed",
            Self::PayloadTooLarge => "payload_too_large",
            Self::UpstreamError => "upstream_error",
            Self::InternalError => "internal_error",
        }
    }
}

/// One completed request/response cycle. Built once, handed to the logger by value.
#[derive(Debug, Clone, PartialEq)]
pub struct AuditRecord {
    pub timestamp: DateTime<Local>,
    pub method: String,
    pub path: String,
    pub service: String,
    pub identity: String,
    pub status: u16,
    pub duration_ms: u64,
    pub outcome: AuditOutcome,
}

/// Store representation of an [`AuditRecord`], native types for status and duration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AuditDocument {
    pub timestamp: String,
    pub method: String,
    pub path: String,
    pub service: String,
    pub user: String,
    pub status: u16,
    pub duration_ms: u64,
    pub outcome: AuditOutcome,
}

impl AuditRecord {
    pub fn line(&self) -> String {
        format!(
            "{} | {} {} | Service: {} | User: {} | Status: {} | Duration: {}ms | Outcome: {}",
            self.timestamp.format(TIMESTAMP_FORMAT),
            self.method,
            self.path,
            self.service,
            self.identity,
            self.status,
            self.duration_ms,
            self.outcome.as_str(),
        )
    }

    pub fn into_document(self) -> AuditDocument {
        AuditDocument {
            timestamp: self.timestamp.format(TIMESTAMP_FORMAT).to_string(),
            method: self.method,
            path: self.path,
            service: self.service,
            user: self.identity,
            status: self.status,
            duration_ms: self.duration_ms,
            outcome: self.outcome,
        }
    }
}

type LocalWriter = Box<dyn Write + Send>;

/// Writes audit lines to the local append-only sink and the diagnostic stream,
/// then ships a document to the external store in the background. Nothing here
/// can fail the request that produced the record.
pub struct AuditLogger {
    local: Option<Mutex<LocalWriter>>,
    store: Option<Arc<dyn AuditStore>>,
    store_timeout: Duration,
}

impl AuditLogger {
    pub fn new(
        local: Option<LocalWriter>,
        store: Option<Arc<dyn AuditStore>>,
        store_timeout: Duration,
    ) -> Self {
        Self {
            local: local.map(Mutex::new),
            store,
            store_timeout,
        }
    }

    pub fn from_config(cfg: &AuditConfig, store: Option<Arc<dyn AuditStore>>) -> anyhow::Result<Self> {
        let appender = open_local_sink(cfg)?;
        Ok(Self::new(
            Some(Box::new(appender)),
            store,
            Duration::from_millis(cfg.store_timeout_ms),
        ))
    }

    pub fn record(&self, record: AuditRecord) {
        let line = record.line();
        tracing::info!(target: "audit", "{line}");

        if let Err(err) = self.write_local(&line) {
            tracing::warn!(error = %err, "failed to append audit line to local sink");
        }

        let Some(store) = self.store.clone() else {
            return;
        };

        let timeout = self.store_timeout;
        let document = record.into_document();
        tokio::spawn(async move {
            match tokio::time::timeout(timeout, store.insert(document)).await {
                Ok(Ok(())) => {}
                Ok(Err(err)) => {
                    tracing::warn!(store = store.name(), error = %err, "audit store write failed");
                }
                Err(_) => {
                    tracing::warn!(
                        store = store.name(),
                        timeout_ms = timeout.as_millis() as u64,
                        "audit store write timed out"
                    );
                }
            }
        });
    }

    fn write_local(&self, line: &str) -> io::Result<()> {
        let Some(local) = &self.local else {
            return Ok(());
        };

        let mut writer = local
            .lock()
            .map_err(|_| io::Error::other("audit sink lock poisoned"))?;
        writer.write_all(format!("{line}\n").as_bytes())?;
        writer.flush()
    }
}

fn open_local_sink(cfg: &AuditConfig) -> anyhow::Result<RollingFileAppender> {
    std::fs::create_dir_all(&cfg.log_dir)
        .with_context(|| format!("failed to create audit log dir {}", cfg.log_dir.display()))?;

    let rotation = match cfg.rotation {
        AuditRotation::Never => Rotation::NEVER,
        AuditRotation::Hourly => Rotation::HOURLY,
        AuditRotation::Daily => Rotation::DAILY,
    };

    RollingFileAppender::builder()
        .rotation(rotation)
        .filename_prefix(cfg.log_file.clone())
        .build(&cfg.log_dir)
        .context("failed to open audit log file")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit::store::testing::{FailingAuditStore, MemoryAuditStore, StalledAuditStore};
    use chrono::TimeZone;
    use std::time::Instant;

    fn record() -> AuditRecord {
        AuditRecord {
            timestamp: Local.with_ymd_and_hms(2025, 1, 2, 3, 4, 5).single().unwrap(),
            method: "GET".into(),
            path: "/tasks/42".into(),
            service: "task-service".into(),
            identity: "alice".into(),
            status: 404,
            duration_ms: 12,
            outcome: AuditOutcome::Forwarded,
        }
    }

    fn audit_config(dir: &std::path::Path) -> AuditConfig {
        AuditConfig {
            log_dir: dir.to_path_buf(),
            log_file: "api_gateway.log".into(),
            rotation: AuditRotation::Never,
            redis_url: None,
            redis_key: "gateway:audit".into(),
            store_timeout_ms: 100,
        }
    }

    #[test]
    fn line_has_fixed_layout() {
        assert_eq!(
            record().line(),
            "2025-01-02 03:04:05 | GET /tasks/42 | Service: task-service | User: alice \
             | Status: 404 | Duration: 12ms | Outcome: forwarded"
        );
    }

    #[test]
    fn document_uses_native_types() {
        let doc = serde_json::to_value(record().into_document()).unwrap();
        assert_eq!(doc["timestamp"], "2025-01-02 03:04:05");
        assert_eq!(doc["user"], "alice");
        assert_eq!(doc["status"], 404);
        assert_eq!(doc["duration_ms"], 12);
        assert_eq!(doc["outcome"], "forwarded");
    }

    #[tokio::test]
    async fn local_sink_appends_one_line_per_record() {
        let dir = tempfile::tempdir().unwrap();
        let logger = AuditLogger::from_config(&audit_config(dir.path()), None).unwrap();

        logger.record(record());
        let mut limited = record();
        limited.outcome = AuditOutcome::RateLimited;
        limited.status = 429;
        logger.record(limited);

        let contents = std::fs::read_to_string(dir.path().join("api_gateway.log")).unwrap();
        let lines: Vec<_> = contents.lines().collect();
        assert_eq!(lines.len(), 2);
        assert!(lines[1].ends_with("Status: 429 | Duration: 12ms | Outcome: rate_limited"));
    }

    #[tokio::test]
    async fn store_receives_document() {
        let store = MemoryAuditStore::default();
        let logger = AuditLogger::new(None, Some(Arc::new(store.clone())), Duration::from_secs(1));

        logger.record(record());

        let docs = store.wait_for(1).await;
        assert_eq!(docs.len(), 1);
        assert_eq!(docs[0].service, "task-service");
    }

    #[tokio::test]
    async fn store_failures_are_swallowed() {
        let dir = tempfile::tempdir().unwrap();
        let logger =
            AuditLogger::from_config(&audit_config(dir.path()), Some(Arc::new(FailingAuditStore)))
                .unwrap();

        logger.record(record());
        tokio::task::yield_now().await;

        let contents = std::fs::read_to_string(dir.path().join("api_gateway.log")).unwrap();
        assert_eq!(contents.lines().count(), 1);
    }

    #[tokio::test]
    async fn stalled_store_does_not_delay_caller() {
        let logger = AuditLogger::new(
            None,
            Some(Arc::new(StalledAuditStore)),
            Duration::from_millis(50),
        );

        let started = Instant::now();
        for _ in 0..10 {
            logger.record(record());
        }
        assert!(started.elapsed() < Duration::from_millis(50));
    }

    #[tokio::test]
    async fn broken_local_sink_is_tolerated() {
        struct BrokenWriter;

        impl Write for BrokenWriter {
            fn write(&mut self, _buf: &[u8]) -> io::Result<usize> {
                Err(io::Error::other("disk full"))
            }

            fn flush(&mut self) -> io::Result<()> {
                Ok(())
            }
        }

        let store = MemoryAuditStore::default();
        let logger = AuditLogger::new(
            Some(Box::new(BrokenWriter)),
            Some(Arc::new(store.clone())),
            Duration::from_secs(1),
        );

        logger.record(record());
        assert_eq!(store.wait_for(1).await.len(), 1);
    }
}
