//! couchflow: reactive, streaming client for CouchDB-style document
//! databases.
//!
//! The crate is built around three streaming subsystems:
//!
//! - **views**: view responses decode incrementally into typed
//!   [`ViewEvent`] streams — rows, counters, and errors — without ever
//!   buffering a whole response ([`view`]).
//! - **changes**: a continuous `_changes` subscription that survives
//!   connection failures with exponential backoff and resumes from the
//!   last delivered sequence ([`changes`]).
//! - **design documents**: code-declared views/filters/shows/lists/update
//!   handlers reconciled into the stored design document without touching
//!   unrelated keys ([`design`]).
//!
//! Around them sit document CRUD with optimistic concurrency, bulk
//! updates, Mango selector queries, and replication control.
//!
//! ```no_run
//! use couchflow::{ClientConfig, CouchClient, ViewQuery};
//! use serde_json::Value;
//!
//! # async fn example() -> couchflow::Result<()> {
//! let client = CouchClient::new(
//!     ClientConfig::new("http://localhost:5984", "orders")
//!         .with_credentials("admin", "secret"),
//! )?;
//! let db = client.db();
//!
//! let mut rows = db
//!     .query_view::<Value, Value, Value>(
//!         &ViewQuery::new("Order", "by_code").include_docs(true).limit(10),
//!     )
//!     .await?;
//! while let Some(event) = rows.next_event().await? {
//!     println!("{event:?}");
//! }
//! # Ok(())
//! # }
//! ```

pub mod bulk;
pub mod changes;
pub mod client;
pub mod config;
pub mod design;
pub mod document;
pub mod error;
pub mod json;
pub mod mango;
pub mod replicator;
pub mod transport;
pub mod view;

pub use bulk::{BulkRequest, BulkUpdateResult};
pub use changes::{Change, ChangeEnvelope, ChangeFeed, ChangesOptions, Seq, TypedChangeFeed};
pub use client::{CouchClient, Database, HeaderRegistry};
pub use config::{BackoffConfig, ClientConfig};
pub use design::{
    reconcile, reconcile_mango_indexes, DesignDocument, DesignMapping, HandlerDef, MangoIndexDef,
    ReconcileOptions, ReconcileOutcome, SourceProvider, ViewDef,
};
pub use document::{
    Attachment, CouchDocument, DbInfo, RawDocument, RevInfo, SecurityDocument, SecurityGroup,
    WriteOk,
};
pub use error::{CouchError, Result};
pub use mango::{Condition, MangoQuery, MangoQueryResult, Operator, Selector};
pub use replicator::{
    ActiveTask, CancelResult, ReplicationCommand, ReplicationResponse, ReplicationState,
    Replicator, SchedulerDoc, SchedulerJob,
};
pub use transport::{HttpTransport, ReqwestTransport};
pub use view::{DocSlot, Stale, ViewEvent, ViewQuery, ViewRow};
