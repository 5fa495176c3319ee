//! Fire-and-forget side-effect consumers (audit trail, outbound email).
//!
//! Failures here are logged by the caller and never roll back a command: the
//! event is already committed when a sink sees it.

use std::sync::Mutex;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SinkError {
    #[error("sink unavailable: {0}")]
    Unavailable(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditSeverity {
    Info,
    Security,
}

/// One entry in the audit trail.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditRecord {
    pub kind: String,
    pub severity: AuditSeverity,
    pub occurred_at: DateTime<Utc>,
    pub subject: Option<String>,
    pub client_id: Option<String>,
    pub correlation_id: Option<Uuid>,
    pub detail: JsonValue,
}

impl AuditRecord {
    pub fn info(kind: impl Into<String>, occurred_at: DateTime<Utc>) -> Self {
        Self {
            kind: kind.into(),
            severity: AuditSeverity::Info,
            occurred_at,
            subject: None,
            client_id: None,
            correlation_id: None,
            detail: JsonValue::Null,
        }
    }

    pub fn security(kind: impl Into<String>, occurred_at: DateTime<Utc>) -> Self {
        Self {
            severity: AuditSeverity::Security,
            ..Self::info(kind, occurred_at)
        }
    }

    pub fn with_subject(mut self, subject: impl ToString) -> Self {
        self.subject = Some(subject.to_string());
        self
    }

    pub fn with_client(mut self, client_id: impl ToString) -> Self {
        self.client_id = Some(client_id.to_string());
        self
    }

    pub fn with_correlation(mut self, correlation_id: Uuid) -> Self {
        self.correlation_id = Some(correlation_id);
        self
    }

    pub fn with_detail(mut self, detail: JsonValue) -> Self {
        self.detail = detail;
        self
    }
}

pub trait AuditSink: Send + Sync {
    fn record(&self, record: AuditRecord) -> Result<(), SinkError>;
}

impl<S> AuditSink for std::sync::Arc<S>
where
    S: AuditSink + ?Sized,
{
    fn record(&self, record: AuditRecord) -> Result<(), SinkError> {
        (**self).record(record)
    }
}

/// Audit sink that writes records to the `audit` tracing target.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingAuditSink;

impl AuditSink for TracingAuditSink {
    fn record(&self, record: AuditRecord) -> Result<(), SinkError> {
        match record.severity {
            AuditSeverity::Security => tracing::warn!(
                target: "audit",
                kind = %record.kind,
                subject = ?record.subject,
                client_id = ?record.client_id,
                correlation_id = ?record.correlation_id,
                detail = %record.detail,
                "security audit event"
            ),
            AuditSeverity::Info => tracing::info!(
                target: "audit",
                kind = %record.kind,
                subject = ?record.subject,
                client_id = ?record.client_id,
                "audit event"
            ),
        }
        Ok(())
    }
}

/// Collects audit records in memory (tests/dev).
#[derive(Debug, Default)]
pub struct InMemoryAuditSink {
    records: Mutex<Vec<AuditRecord>>,
}

impl InMemoryAuditSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn records(&self) -> Vec<AuditRecord> {
        self.records.lock().map(|r| r.clone()).unwrap_or_default()
    }

    pub fn count_kind(&self, kind: &str) -> usize {
        self.records().iter().filter(|r| r.kind == kind).count()
    }
}

impl AuditSink for InMemoryAuditSink {
    fn record(&self, record: AuditRecord) -> Result<(), SinkError> {
        self.records
            .lock()
            .map_err(|_| SinkError::Unavailable("lock poisoned".to_string()))?
            .push(record);
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EmailTemplate {
    Welcome,
    PasswordChanged,
    IdentityLinked,
    AccountDeactivated,
}

pub trait EmailNotifier: Send + Sync {
    fn send(&self, template: EmailTemplate, recipient: &str) -> Result<(), SinkError>;
}

impl<N> EmailNotifier for std::sync::Arc<N>
where
    N: EmailNotifier + ?Sized,
{
    fn send(&self, template: EmailTemplate, recipient: &str) -> Result<(), SinkError> {
        (**self).send(template, recipient)
    }
}

/// Logs notifications to the `email` tracing target instead of delivering
/// them. Stands in for an SMTP relay in single-node deployments.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingEmailNotifier;

impl EmailNotifier for TracingEmailNotifier {
    fn send(&self, template: EmailTemplate, recipient: &str) -> Result<(), SinkError> {
        tracing::info!(target: "email", ?template, recipient, "notification queued");
        Ok(())
    }
}

/// Records sent notifications in memory (tests/dev).
#[derive(Debug, Default)]
pub struct InMemoryEmailNotifier {
    sent: Mutex<Vec<(EmailTemplate, String)>>,
}

impl InMemoryEmailNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn sent(&self) -> Vec<(EmailTemplate, String)> {
        self.sent.lock().map(|s| s.clone()).unwrap_or_default()
    }
}

impl EmailNotifier for InMemoryEmailNotifier {
    fn send(&self, template: EmailTemplate, recipient: &str) -> Result<(), SinkError> {
        self.sent
            .lock()
            .map_err(|_| SinkError::Unavailable("lock poisoned".to_string()))?
            .push((template, recipient.to_string()));
        Ok(())
    }
}
