use std::collections::HashMap;

use async_trait::async_trait;
use tokio::sync::Mutex;
use uploader_core::{Group, Identity, NewGroup, TimeTrackingDraft, TimeTrackingRow};

use crate::{Store, StoreError};

const TOKEN_PREFIX: &str = "memory-token:";

/// Number of calls made per store operation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StoreCallCounts {
    pub authenticate: usize,
    pub select_groups: usize,
    pub insert_groups: usize,
    pub select_time_tracking: usize,
    pub insert_time_tracking: usize,
    pub upsert_time_tracking: usize,
}

impl StoreCallCounts {
    pub fn total(&self) -> usize {
        self.authenticate
            + self.select_groups
            + self.insert_groups
            + self.select_time_tracking
            + self.insert_time_tracking
            + self.upsert_time_tracking
    }
}

#[derive(Default)]
struct State {
    accounts: HashMap<String, (String, String)>,
    groups: Vec<Group>,
    rows: Vec<TimeTrackingRow>,
    next_id: i64,
    calls: StoreCallCounts,
    offline: bool,
}

impl State {
    fn allocate_id(&mut self) -> i64 {
        self.next_id += 1;
        self.next_id
    }

    fn check_online(&self) -> Result<(), StoreError> {
        if self.offline {
            return Err(StoreError::Backend("store is offline".to_string()));
        }
        Ok(())
    }

    fn check_token(&self, identity: &Identity) -> Result<(), StoreError> {
        let expected = format!("{TOKEN_PREFIX}{}", identity.user_id);
        if identity.access_token != expected {
            return Err(StoreError::Authentication("token rejected".to_string()));
        }
        Ok(())
    }
}

fn owned_by(user_id: &Option<String>, owner: Option<&str>) -> bool {
    match owner {
        Some(owner) => user_id.as_deref() == Some(owner),
        None => true,
    }
}

/// Store kept in process memory; stands in for the remote backend in tests.
#[derive(Default)]
pub struct InMemoryStore {
    state: Mutex<State>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_account(
        mut self,
        email: impl Into<String>,
        password: impl Into<String>,
        user_id: impl Into<String>,
    ) -> Self {
        self.state
            .get_mut()
            .accounts
            .insert(email.into(), (password.into(), user_id.into()));
        self
    }

    pub fn with_groups(mut self, groups: impl IntoIterator<Item = Group>) -> Self {
        let state = self.state.get_mut();
        for group in groups {
            state.next_id = state.next_id.max(group.id);
            state.groups.push(group);
        }
        self
    }

    pub fn with_rows(mut self, rows: impl IntoIterator<Item = TimeTrackingRow>) -> Self {
        let state = self.state.get_mut();
        for row in rows {
            state.next_id = state.next_id.max(row.id);
            state.rows.push(row);
        }
        self
    }

    pub async fn groups(&self) -> Vec<Group> {
        self.state.lock().await.groups.clone()
    }

    pub async fn rows(&self) -> Vec<TimeTrackingRow> {
        self.state.lock().await.rows.clone()
    }

    pub async fn calls(&self) -> StoreCallCounts {
        self.state.lock().await.calls
    }

    pub async fn set_offline(&self, offline: bool) {
        self.state.lock().await.offline = offline;
    }
}

#[async_trait]
impl Store for InMemoryStore {
    async fn authenticate(&self, email: &str, password: &str) -> Result<Identity, StoreError> {
        let mut state = self.state.lock().await;
        state.calls.authenticate += 1;
        state.check_online()?;
        match state.accounts.get(email) {
            Some((expected, user_id)) if expected == password => Ok(Identity {
                user_id: user_id.clone(),
                access_token: format!("{TOKEN_PREFIX}{user_id}"),
            }),
            _ => Err(StoreError::Authentication(
                "invalid login credentials".to_string(),
            )),
        }
    }

    async fn select_groups(
        &self,
        identity: &Identity,
        owner: Option<&str>,
    ) -> Result<Vec<Group>, StoreError> {
        let mut state = self.state.lock().await;
        state.calls.select_groups += 1;
        state.check_online()?;
        state.check_token(identity)?;
        Ok(state
            .groups
            .iter()
            .filter(|g| owned_by(&g.user_id, owner))
            .cloned()
            .collect())
    }

    async fn insert_groups(
        &self,
        identity: &Identity,
        groups: &[NewGroup],
    ) -> Result<Vec<Group>, StoreError> {
        let mut state = self.state.lock().await;
        state.calls.insert_groups += 1;
        state.check_online()?;
        state.check_token(identity)?;
        let mut created = Vec::with_capacity(groups.len());
        for group in groups {
            let id = state.allocate_id();
            let group = Group {
                id,
                name: group.name.clone(),
                user_id: group.user_id.clone(),
            };
            state.groups.push(group.clone());
            created.push(group);
        }
        Ok(created)
    }

    async fn select_time_tracking(
        &self,
        identity: &Identity,
        owner: Option<&str>,
    ) -> Result<Vec<TimeTrackingRow>, StoreError> {
        let mut state = self.state.lock().await;
        state.calls.select_time_tracking += 1;
        state.check_online()?;
        state.check_token(identity)?;
        Ok(state
            .rows
            .iter()
            .filter(|r| owned_by(&r.user_id, owner))
            .cloned()
            .collect())
    }

    async fn insert_time_tracking(
        &self,
        identity: &Identity,
        rows: &[TimeTrackingDraft],
    ) -> Result<usize, StoreError> {
        let mut state = self.state.lock().await;
        state.calls.insert_time_tracking += 1;
        state.check_online()?;
        state.check_token(identity)?;
        if rows.iter().any(|r| r.id.is_some()) {
            return Err(StoreError::Backend(
                "insert payload must not carry ids".to_string(),
            ));
        }
        for draft in rows {
            let id = state.allocate_id();
            state.rows.push(TimeTrackingRow {
                id,
                date: draft.date,
                group_id: draft.group_id,
                activity: draft.activity.clone(),
                duration: draft.duration,
                user_id: draft.user_id.clone(),
            });
        }
        Ok(rows.len())
    }

    async fn upsert_time_tracking(
        &self,
        identity: &Identity,
        rows: &[TimeTrackingDraft],
    ) -> Result<usize, StoreError> {
        let mut state = self.state.lock().await;
        state.calls.upsert_time_tracking += 1;
        state.check_online()?;
        state.check_token(identity)?;
        for draft in rows {
            let Some(id) = draft.id else {
                return Err(StoreError::Backend(
                    "upsert requires every row to carry an id".to_string(),
                ));
            };
            let row = TimeTrackingRow {
                id,
                date: draft.date,
                group_id: draft.group_id,
                activity: draft.activity.clone(),
                duration: draft.duration,
                user_id: draft.user_id.clone(),
            };
            match state.rows.iter_mut().find(|existing| existing.id == id) {
                Some(existing) => *existing = row,
                None => {
                    state.next_id = state.next_id.max(id);
                    state.rows.push(row);
                }
            }
        }
        Ok(rows.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    fn draft(id: Option<i64>, activity: &str, duration: u32) -> TimeTrackingDraft {
        TimeTrackingDraft {
            id,
            date: NaiveDate::from_ymd_opt(2024, 1, 1).unwrap(),
            group_id: 1,
            activity: activity.into(),
            duration,
            user_id: Some("user-1".into()),
        }
    }

    fn store() -> InMemoryStore {
        InMemoryStore::new().with_account("a@example.com", "pw", "user-1")
    }

    #[tokio::test]
    async fn authenticate_checks_password() {
        let store = store();
        let identity = store.authenticate("a@example.com", "pw").await.unwrap();
        assert_eq!(identity.user_id, "user-1");
        assert!(store
            .authenticate("a@example.com", "nope")
            .await
            .unwrap_err()
            .is_authentication());
        assert_eq!(store.calls().await.authenticate, 2);
    }

    #[tokio::test]
    async fn foreign_tokens_are_rejected() {
        let store = store();
        let forged = Identity {
            user_id: "user-1".into(),
            access_token: "stolen".into(),
        };
        let err = store.select_groups(&forged, None).await.unwrap_err();
        assert!(err.is_authentication());
    }

    #[tokio::test]
    async fn insert_then_upsert_updates_in_place() {
        let store = store();
        let identity = store.authenticate("a@example.com", "pw").await.unwrap();

        store
            .insert_time_tracking(&identity, &[draft(None, "Work", 30)])
            .await
            .unwrap();
        let id = store.rows().await[0].id;
        store
            .upsert_time_tracking(&identity, &[draft(Some(id), "Work", 45)])
            .await
            .unwrap();

        let rows = store.rows().await;
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].duration, 45);
    }

    #[tokio::test]
    async fn owner_filter_limits_selects() {
        let store = store().with_groups([
            Group {
                id: 1,
                name: "Mine".into(),
                user_id: Some("user-1".into()),
            },
            Group {
                id: 2,
                name: "Theirs".into(),
                user_id: Some("user-2".into()),
            },
        ]);
        let identity = store.authenticate("a@example.com", "pw").await.unwrap();

        let mine = store.select_groups(&identity, Some("user-1")).await.unwrap();
        assert_eq!(mine.len(), 1);
        assert_eq!(store.select_groups(&identity, None).await.unwrap().len(), 2);

        let created = store
            .insert_groups(
                &identity,
                &[NewGroup {
                    name: "New".into(),
                    user_id: Some("user-1".into()),
                }],
            )
            .await
            .unwrap();
        assert_eq!(created[0].id, 3);
    }

    #[tokio::test]
    async fn seeded_rows_reserve_their_ids() {
        let seeded = TimeTrackingRow {
            id: 40,
            date: NaiveDate::from_ymd_opt(2024, 1, 1).unwrap(),
            group_id: 1,
            activity: "Seeded".into(),
            duration: 5,
            user_id: Some("user-1".into()),
        };
        let store = store().with_rows([seeded]);
        let identity = store.authenticate("a@example.com", "pw").await.unwrap();

        store
            .insert_time_tracking(&identity, &[draft(None, "Work", 30)])
            .await
            .unwrap();
        let ids = store.rows().await.iter().map(|r| r.id).collect::<Vec<_>>();
        assert_eq!(ids, vec![40, 41]);
        assert_eq!(
            store
                .select_time_tracking(&identity, Some("user-2"))
                .await
                .unwrap()
                .len(),
            0
        );
    }

    #[tokio::test]
    async fn offline_store_fails_every_call() {
        let store = store();
        store.set_offline(true).await;
        let err = store.authenticate("a@example.com", "pw").await.unwrap_err();
        assert!(matches!(err, StoreError::Backend(_)));
    }
}
