//! Replication control.
//!
//! Replications are documents in the server's `_replicator` database;
//! submitting one starts a job, purging it cancels the job. Progress and
//! health are polled read-only from the `_scheduler` endpoints. Task
//! introspection (`_active_tasks`) lives here too since replication jobs
//! surface through it.

use crate::client::gate::Missing;
use crate::client::CouchClient;
use crate::document::RevsInfoEnvelope;
use crate::error::{CouchError, Result};
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

/// A replication request document.
#[derive(Debug, Clone, Serialize)]
pub struct ReplicationCommand {
    #[serde(rename = "_id", skip_serializing_if = "Option::is_none")]
    pub doc_id: Option<String>,
    pub source: String,
    pub target: String,
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub continuous: bool,
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub create_target: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub filter: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub selector: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub doc_ids: Option<Vec<String>>,
}

impl ReplicationCommand {
    pub fn new(source: impl Into<String>, target: impl Into<String>) -> Self {
        ReplicationCommand {
            doc_id: None,
            source: source.into(),
            target: target.into(),
            continuous: false,
            create_target: false,
            filter: None,
            selector: None,
            doc_ids: None,
        }
    }

    #[must_use]
    pub fn doc_id(mut self, id: impl Into<String>) -> Self {
        self.doc_id = Some(id.into());
        self
    }

    #[must_use]
    pub fn continuous(mut self, continuous: bool) -> Self {
        self.continuous = continuous;
        self
    }

    #[must_use]
    pub fn create_target(mut self, create: bool) -> Self {
        self.create_target = create;
        self
    }

    #[must_use]
    pub fn filter(mut self, filter: impl Into<String>) -> Self {
        self.filter = Some(filter.into());
        self
    }

    #[must_use]
    pub fn selector(mut self, selector: Value) -> Self {
        self.selector = Some(selector);
        self
    }

    #[must_use]
    pub fn doc_ids(mut self, ids: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.doc_ids = Some(ids.into_iter().map(Into::into).collect());
        self
    }
}

/// Server response to a replication submission.
#[derive(Debug, Clone, Deserialize)]
pub struct ReplicationResponse {
    #[serde(default)]
    pub ok: bool,
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub rev: Option<String>,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub reason: Option<String>,
}

impl ReplicationResponse {
    fn failed(error: impl Into<String>) -> Self {
        ReplicationResponse {
            ok: false,
            id: None,
            rev: None,
            error: Some(error.into()),
            reason: None,
        }
    }
}

/// Outcome of a cancellation.
#[derive(Debug, Clone, PartialEq)]
pub struct CancelResult {
    pub ok: bool,
    pub reason: Option<String>,
}

/// Scheduler-reported replication state.
///
/// A closed enumeration; anything the server adds later collapses to
/// [`ReplicationState::Failed`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReplicationState {
    Initializing,
    Error,
    Running,
    Pending,
    Crashing,
    Completed,
    #[serde(other)]
    Failed,
}

impl ReplicationState {
    /// The job is progressing or will progress without intervention.
    #[must_use]
    pub fn healthy(self) -> bool {
        matches!(
            self,
            ReplicationState::Initializing
                | ReplicationState::Running
                | ReplicationState::Pending
                | ReplicationState::Completed
        )
    }

    /// The scheduler will not move the job any further.
    #[must_use]
    pub fn terminal(self) -> bool {
        matches!(self, ReplicationState::Completed | ReplicationState::Failed)
    }
}

/// One entry of `_scheduler/docs`.
#[derive(Debug, Clone, Deserialize)]
pub struct SchedulerDoc {
    pub database: String,
    pub doc_id: String,
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub source: Option<String>,
    #[serde(default)]
    pub target: Option<String>,
    pub state: ReplicationState,
    #[serde(default)]
    pub error_count: u64,
    #[serde(default)]
    pub info: Value,
}

#[derive(Debug, Deserialize)]
struct SchedulerDocsResponse {
    #[serde(default)]
    docs: Vec<SchedulerDoc>,
}

/// One entry of `_scheduler/jobs`.
#[derive(Debug, Clone, Deserialize)]
pub struct SchedulerJob {
    pub id: String,
    pub database: String,
    #[serde(default)]
    pub doc_id: Option<String>,
    #[serde(default)]
    pub pid: Option<String>,
    #[serde(default)]
    pub source: Option<String>,
    #[serde(default)]
    pub target: Option<String>,
    #[serde(default)]
    pub history: Vec<Value>,
}

#[derive(Debug, Deserialize)]
struct SchedulerJobsResponse {
    #[serde(default)]
    jobs: Vec<SchedulerJob>,
}

/// Fields every task kind reports.
#[derive(Debug, Clone, Default, Deserialize, PartialEq)]
pub struct TaskCommon {
    #[serde(default)]
    pub pid: Option<String>,
    #[serde(default)]
    pub started_on: Option<u64>,
    #[serde(default)]
    pub updated_on: Option<u64>,
}

/// One entry of `_active_tasks`, dispatched on its `type` tag.
#[derive(Debug, Clone, PartialEq)]
pub enum ActiveTask {
    Indexer {
        common: TaskCommon,
        database: Option<String>,
        design_document: Option<String>,
        progress: Option<u8>,
    },
    Replication {
        common: TaskCommon,
        source: Option<String>,
        target: Option<String>,
        doc_id: Option<String>,
        continuous: bool,
    },
    DatabaseCompaction {
        common: TaskCommon,
        database: Option<String>,
        progress: Option<u8>,
    },
    ViewCompaction {
        common: TaskCommon,
        database: Option<String>,
        design_document: Option<String>,
        progress: Option<u8>,
    },
    /// A task kind this client does not know.
    Other { kind: String, common: TaskCommon },
}

impl<'de> Deserialize<'de> for ActiveTask {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        use serde::de::Error as _;
        let value = Value::deserialize(deserializer)?;
        let kind = value
            .get("type")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        let common: TaskCommon =
            serde_json::from_value(value.clone()).map_err(D::Error::custom)?;
        let text = |field: &str| {
            value
                .get(field)
                .and_then(Value::as_str)
                .map(str::to_string)
        };
        let progress = value
            .get("progress")
            .and_then(Value::as_u64)
            .map(|p| p.min(100) as u8);

        Ok(match kind.as_str() {
            "indexer" => ActiveTask::Indexer {
                common,
                database: text("database"),
                design_document: text("design_document"),
                progress,
            },
            "replication" => ActiveTask::Replication {
                common,
                source: text("source"),
                target: text("target"),
                doc_id: text("doc_id"),
                continuous: value
                    .get("continuous")
                    .and_then(Value::as_bool)
                    .unwrap_or(false),
            },
            "database_compaction" => ActiveTask::DatabaseCompaction {
                common,
                database: text("database"),
                progress,
            },
            "view_compaction" => ActiveTask::ViewCompaction {
                common,
                database: text("database"),
                design_document: text("design_document"),
                progress,
            },
            _ => ActiveTask::Other { kind, common },
        })
    }
}

#[derive(Debug, Deserialize)]
struct PurgeResponse {
    #[serde(default)]
    purged: BTreeMap<String, Vec<String>>,
}

/// Handle for the root-level replication endpoints.
#[derive(Clone)]
pub struct Replicator {
    client: CouchClient,
}

impl Replicator {
    pub(crate) fn new(client: CouchClient) -> Self {
        Replicator { client }
    }

    /// Submit a replication command.
    ///
    /// Ensures the `_replicator` database exists first; when it cannot be
    /// created the command is not submitted and the response reports the
    /// failure rather than erroring.
    pub async fn replicate(&self, command: &ReplicationCommand) -> Result<ReplicationResponse> {
        if !self.ensure_replicator_db().await? {
            return Ok(ReplicationResponse::failed("Replicator DB not found"));
        }

        let request = self
            .client
            .request()?
            .segment("_replicator")
            .method("POST")
            .body_json(command)?
            .build()?;
        let response: ReplicationResponse = self
            .client
            .send_json(request, Missing::Error)
            .await?
            .ok_or(CouchError::NotFound)?;
        Ok(response)
    }

    /// Cancel a replication by purging its document, all revisions at
    /// once.
    pub async fn cancel(&self, doc_id: &str) -> Result<CancelResult> {
        let request = self
            .client
            .request()?
            .segment("_replicator")
            .segment(doc_id)
            .query("revs_info", true)
            .build()?;
        let Some(envelope) = self
            .client
            .send_json::<RevsInfoEnvelope>(request, Missing::Absent)
            .await?
        else {
            return Ok(CancelResult {
                ok: false,
                reason: Some(format!("replication document `{doc_id}` not found")),
            });
        };

        let revs: Vec<String> = envelope
            .revs_info
            .into_iter()
            .map(|info| info.rev)
            .collect();
        let mut body = BTreeMap::new();
        body.insert(doc_id.to_string(), revs);

        let request = self
            .client
            .request()?
            .segment("_replicator")
            .segment("_purge")
            .method("POST")
            .body_json(&body)?
            .build()?;
        let purge: PurgeResponse = self
            .client
            .send_json(request, Missing::Error)
            .await?
            .ok_or(CouchError::NotFound)?;

        if purge.purged.contains_key(doc_id) {
            Ok(CancelResult {
                ok: true,
                reason: None,
            })
        } else {
            Ok(CancelResult {
                ok: false,
                reason: Some(format!("purge did not acknowledge `{doc_id}`")),
            })
        }
    }

    /// Poll `_scheduler/docs`.
    pub async fn scheduler_docs(&self) -> Result<Vec<SchedulerDoc>> {
        let request = self
            .client
            .request()?
            .segment("_scheduler")
            .segment("docs")
            .build()?;
        let response: SchedulerDocsResponse = self
            .client
            .send_json(request, Missing::Error)
            .await?
            .ok_or(CouchError::NotFound)?;
        Ok(response.docs)
    }

    /// Poll `_scheduler/jobs`.
    pub async fn scheduler_jobs(&self) -> Result<Vec<SchedulerJob>> {
        let request = self
            .client
            .request()?
            .segment("_scheduler")
            .segment("jobs")
            .build()?;
        let response: SchedulerJobsResponse = self
            .client
            .send_json(request, Missing::Error)
            .await?
            .ok_or(CouchError::NotFound)?;
        Ok(response.jobs)
    }

    /// True when `_replicator` exists or was just created.
    async fn ensure_replicator_db(&self) -> Result<bool> {
        let probe = self.client.request()?.segment("_replicator").build()?;
        if self
            .client
            .send(probe, Missing::Absent)
            .await?
            .is_some()
        {
            return Ok(true);
        }

        tracing::debug!("_replicator database absent, creating");
        let create = self
            .client
            .request()?
            .segment("_replicator")
            .method("PUT")
            .build()?;
        match self.client.send(create, Missing::Error).await {
            Ok(_) => Ok(true),
            // Another client created it between the probe and the PUT.
            Err(e) if e.is_conflict() => Ok(true),
            Err(e) => {
                tracing::warn!(error = %e, "could not create _replicator database");
                Ok(false)
            }
        }
    }
}
