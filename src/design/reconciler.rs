//! Design-document reconciler.
//!
//! Brings the stored design document in line with the code-declared
//! definitions:
//!
//! 1. generate the candidate from the declarations;
//! 2. GET the stored document — absent means PUT the candidate as new;
//! 3. otherwise merge per category and PUT only when something changed,
//!    using the stored revision.
//!
//! A Conflict on the PUT surfaces to the caller; the operation is
//! idempotent, so retrying it is safe. Concurrent reconcilers on the same
//! id are not serialized here — conflicts are the coordination mechanism.

use crate::client::Database;
use crate::design::merge::merge;
use crate::design::{
    mango_index_document, DesignDocument, DesignMapping, MangoIndexDef, SourceProvider,
};
use crate::error::Result;

/// Reconciliation switches.
#[derive(Debug, Clone, Copy)]
pub struct ReconcileOptions {
    /// Overwrite stored entries that differ from declared ones.
    pub force_update: bool,
    /// When false, an existing document is never touched, changed or not.
    pub update_if_exists: bool,
}

impl Default for ReconcileOptions {
    fn default() -> Self {
        ReconcileOptions {
            force_update: false,
            update_if_exists: true,
        }
    }
}

/// What the reconciler did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconcileOutcome {
    /// No stored document existed; the candidate was created.
    Created,
    /// The merged document was written.
    Updated,
    /// The stored document already covered every declaration.
    Unchanged,
    /// A document exists and `update_if_exists` is off.
    SkippedExisting,
}

/// Reconcile the declarations for one type into its design document.
pub async fn reconcile(
    db: &Database,
    mapping: &DesignMapping,
    provider: &dyn SourceProvider,
    options: ReconcileOptions,
) -> Result<ReconcileOutcome> {
    let candidate = mapping.generate(provider)?;
    reconcile_candidate(db, candidate, options).await
}

/// Reconcile the Mango index document for one type
/// (`_design/<Type>_mango`, `language: "query"`).
pub async fn reconcile_mango_indexes(
    db: &Database,
    type_name: &str,
    indexes: &[MangoIndexDef],
    options: ReconcileOptions,
) -> Result<ReconcileOutcome> {
    let candidate = mango_index_document(type_name, indexes);
    reconcile_candidate(db, candidate, options).await
}

async fn reconcile_candidate(
    db: &Database,
    candidate: DesignDocument,
    options: ReconcileOptions,
) -> Result<ReconcileOutcome> {
    let stored = db.get_design_document(&candidate.id).await?;

    let Some(stored) = stored else {
        tracing::debug!(id = %candidate.id, "design document absent, creating");
        db.put_design_document(&candidate).await?;
        return Ok(ReconcileOutcome::Created);
    };

    if !options.update_if_exists {
        return Ok(ReconcileOutcome::SkippedExisting);
    }

    let (mut merged, changed) = merge(&stored, &candidate, options.force_update);
    if !changed {
        return Ok(ReconcileOutcome::Unchanged);
    }

    merged.rev = stored.rev;
    tracing::debug!(id = %merged.id, "design document changed, updating");
    db.put_design_document(&merged).await?;
    Ok(ReconcileOutcome::Updated)
}
