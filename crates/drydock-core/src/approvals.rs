//! Approval queue: suspended transitions awaiting a human, plus the sweep
//! that expires requests nobody answered.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::{info, instrument, warn};

use drydock_state::{
    ApprovalId, ApprovalKind, ApprovalRecord, ApprovalStatus, ApprovalStore, Transition,
    VersionKey,
};

use crate::error::DrydockResult;

/// Queue of open approval requests, one per suspended transition.
pub struct ApprovalQueue {
    store: Arc<dyn ApprovalStore>,
}

impl ApprovalQueue {
    pub fn new(store: Arc<dyn ApprovalStore>) -> Self {
        ApprovalQueue { store }
    }

    /// Open a request for a suspended transition, or return the already-open
    /// one for the same edge. Re-requesting a transition must not pile up
    /// duplicate requests for reviewers. The second element is true when a
    /// new request was created.
    #[instrument(
        skip_all,
        fields(key = %transition.key, from = %transition.from, to = %transition.to)
    )]
    pub async fn open(
        &self,
        transition: Transition,
        kind: ApprovalKind,
        reason: String,
        expires_in_secs: Option<u64>,
        now: DateTime<Utc>,
    ) -> DrydockResult<(ApprovalRecord, bool)> {
        let existing = self.store.open_for(&transition.key).await?;
        if let Some(open) = existing.into_iter().find(|r| {
            r.transition.from == transition.from
                && r.transition.to == transition.to
                && r.kind == kind
        }) {
            info!(request_id = %open.request_id, "reusing open approval request");
            return Ok((open, false));
        }

        let record = ApprovalRecord::new(transition, kind, reason, expires_in_secs, now);
        let record = self.store.create(record).await?;
        info!(request_id = %record.request_id, reason = %record.reason, "approval requested");
        Ok((record, true))
    }

    pub async fn get(&self, request_id: &ApprovalId) -> DrydockResult<ApprovalRecord> {
        Ok(self.store.get(request_id).await?)
    }

    /// Move a request to a terminal status. Exactly-once; a second resolve
    /// surfaces as `ApprovalAlreadyResolved`.
    pub async fn resolve(
        &self,
        request_id: &ApprovalId,
        status: ApprovalStatus,
        resolved_by: &str,
        at: DateTime<Utc>,
    ) -> DrydockResult<ApprovalRecord> {
        Ok(self.store.resolve(request_id, status, resolved_by, at).await?)
    }

    pub async fn list_open(&self) -> DrydockResult<Vec<ApprovalRecord>> {
        Ok(self.store.list_open().await?)
    }

    pub async fn open_for(&self, key: &VersionKey) -> DrydockResult<Vec<ApprovalRecord>> {
        Ok(self.store.open_for(key).await?)
    }

    /// Expire every open request whose deadline has passed. Returns the
    /// records marked expired so the caller can audit them.
    pub async fn sweep_expired(&self, now: DateTime<Utc>) -> DrydockResult<Vec<ApprovalRecord>> {
        let mut expired = Vec::new();
        for record in self.store.list_open().await? {
            if !record.is_expired_at(now) {
                continue;
            }
            let marked = self
                .store
                .resolve(&record.request_id, ApprovalStatus::Expired, "expiry-sweep", now)
                .await?;
            warn!(
                request_id = %marked.request_id,
                key = %marked.transition.key,
                "approval request expired unanswered"
            );
            expired.push(marked);
        }
        Ok(expired)
    }
}
