//! Diff a parsed export against the remote store and apply inserts/updates.

use std::collections::HashMap;
use std::str::FromStr;

use chrono::NaiveDate;
use thiserror::Error;
use tracing::{debug, info};
use uploader_core::{
    Identity, NewGroup, ParsedExport, ReconciliationResult, TimeTrackingDraft, TimeTrackingRow,
};
use uploader_storage::{Store, StoreError};

use crate::Credentials;

/// Which remote rows a run reads: only the signed-in user's, or all visible.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum OwnerScope {
    #[default]
    User,
    Unscoped,
}

impl OwnerScope {
    pub fn owner<'a>(&self, identity: &'a Identity) -> Option<&'a str> {
        match self {
            OwnerScope::User => Some(identity.user_id.as_str()),
            OwnerScope::Unscoped => None,
        }
    }
}

impl FromStr for OwnerScope {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "user" => Ok(OwnerScope::User),
            "none" | "unscoped" => Ok(OwnerScope::Unscoped),
            other => Err(format!("expected `user` or `none`, got {other:?}")),
        }
    }
}

#[derive(Debug, Error)]
pub enum ReconcileError {
    #[error("authentication rejected during {stage}")]
    Authentication {
        stage: &'static str,
        #[source]
        source: StoreError,
    },
    #[error("store request failed during {stage}")]
    Store {
        stage: &'static str,
        #[source]
        source: StoreError,
    },
    #[error("group {0:?} has no id after creating missing groups")]
    UnresolvedGroup(String),
}

impl ReconcileError {
    pub fn is_authentication(&self) -> bool {
        matches!(self, ReconcileError::Authentication { .. })
    }
}

fn at_stage(stage: &'static str) -> impl FnOnce(StoreError) -> ReconcileError {
    move |source| {
        if source.is_authentication() {
            ReconcileError::Authentication { stage, source }
        } else {
            ReconcileError::Store { stage, source }
        }
    }
}

/// Rows to write, split by whether a remote row already holds their key.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReconciliationPlan {
    pub inserts: Vec<TimeTrackingDraft>,
    pub updates: Vec<TimeTrackingDraft>,
}

/// Build drafts for every entry of `data`.
///
/// Remote rows are matched by `(date, activity)`, not by group, so two groups
/// logging the same activity on one date collapse into a single draft and the
/// later entry wins. When `existing` holds several rows for one key the last
/// one is targeted.
pub fn plan_reconciliation(
    data: &ParsedExport,
    group_ids: &HashMap<String, i64>,
    existing: &[TimeTrackingRow],
    user_id: &str,
) -> Result<ReconciliationPlan, ReconcileError> {
    let remote: HashMap<(NaiveDate, &str), i64> = existing
        .iter()
        .map(|row| (row.natural_key(), row.id))
        .collect();

    let mut drafts: Vec<TimeTrackingDraft> = Vec::new();
    let mut slots: HashMap<(NaiveDate, String), usize> = HashMap::new();
    for record in data.records() {
        let group_id = *group_ids
            .get(&record.group)
            .ok_or_else(|| ReconcileError::UnresolvedGroup(record.group.clone()))?;
        let draft = TimeTrackingDraft {
            id: remote
                .get(&(record.date, record.activity.as_str()))
                .copied(),
            date: record.date,
            group_id,
            activity: record.activity.clone(),
            duration: record.duration,
            user_id: Some(user_id.to_string()),
        };
        match slots.get(&(record.date, record.activity.clone())) {
            Some(&slot) => drafts[slot] = draft,
            None => {
                slots.insert((record.date, record.activity), drafts.len());
                drafts.push(draft);
            }
        }
    }

    let (updates, inserts) = drafts.into_iter().partition(|draft| draft.id.is_some());
    Ok(ReconciliationPlan { inserts, updates })
}

pub struct ReconciliationEngine {
    credentials: Credentials,
    scope: OwnerScope,
}

impl ReconciliationEngine {
    pub fn new(credentials: Credentials, scope: OwnerScope) -> Self {
        Self { credentials, scope }
    }

    pub async fn reconcile(
        &self,
        store: &dyn Store,
        data: &ParsedExport,
    ) -> Result<ReconciliationResult, ReconcileError> {
        if data.is_empty() {
            debug!("export holds no entries; store not contacted");
            return Ok(ReconciliationResult::default());
        }

        let identity = store
            .authenticate(&self.credentials.email, self.credentials.password.expose())
            .await
            .map_err(at_stage("sign in"))?;
        let owner = self.scope.owner(&identity);

        let (group_ids, groups_created) =
            self.resolve_groups(store, &identity, owner, data).await?;

        let existing = store
            .select_time_tracking(&identity, owner)
            .await
            .map_err(at_stage("select time tracking"))?;
        let plan = plan_reconciliation(data, &group_ids, &existing, &identity.user_id)?;
        debug!(
            existing = existing.len(),
            inserts = plan.inserts.len(),
            updates = plan.updates.len(),
            "planned reconciliation"
        );

        let inserted = if plan.inserts.is_empty() {
            0
        } else {
            store
                .insert_time_tracking(&identity, &plan.inserts)
                .await
                .map_err(at_stage("insert time tracking"))?
        };
        let updated = if plan.updates.is_empty() {
            0
        } else {
            store
                .upsert_time_tracking(&identity, &plan.updates)
                .await
                .map_err(at_stage("update time tracking"))?
        };

        Ok(ReconciliationResult {
            inserted,
            updated,
            groups_created,
        })
    }

    /// Map every group named in `data` to a remote id, creating the missing
    /// ones in a single batch.
    async fn resolve_groups(
        &self,
        store: &dyn Store,
        identity: &Identity,
        owner: Option<&str>,
        data: &ParsedExport,
    ) -> Result<(HashMap<String, i64>, usize), ReconcileError> {
        let names = data.group_names();
        let mut ids: HashMap<String, i64> = store
            .select_groups(identity, owner)
            .await
            .map_err(at_stage("select groups"))?
            .into_iter()
            .filter(|group| names.contains(group.name.as_str()))
            .map(|group| (group.name, group.id))
            .collect();

        let missing: Vec<NewGroup> = names
            .iter()
            .filter(|name| !ids.contains_key(**name))
            .map(|name| NewGroup {
                name: name.to_string(),
                user_id: Some(identity.user_id.clone()),
            })
            .collect();
        if missing.is_empty() {
            return Ok((ids, 0));
        }

        let created = store
            .insert_groups(identity, &missing)
            .await
            .map_err(at_stage("create groups"))?;
        let groups_created = created.len();
        info!(groups_created, "created missing groups");
        ids.extend(created.into_iter().map(|group| (group.name, group.id)));
        Ok((ids, groups_created))
    }
}
