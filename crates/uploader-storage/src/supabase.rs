//! Supabase (GoTrue auth + PostgREST tables) implementation of [`Store`].

use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Method, RequestBuilder, Response, StatusCode};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::debug;
use uploader_core::{Group, Identity, NewGroup, TimeTrackingDraft, TimeTrackingRow};

use crate::{Store, StoreError};

pub const GROUPS_TABLE: &str = "groups";
pub const TIME_TRACKING_TABLE: &str = "time_tracking";

/// PostgREST caps unpaged responses at 1000 rows by default.
const DEFAULT_PAGE_SIZE: usize = 1000;

const GROUP_COLUMNS: &str = "id,name,user_id";
const TIME_TRACKING_COLUMNS: &str = "id,date,group_id,activity,duration,user_id";

#[derive(Debug, Clone)]
pub struct StoreClientConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
    /// Rows requested per select page.
    pub page_size: usize,
}

impl Default for StoreClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(20),
            user_agent: None,
            page_size: DEFAULT_PAGE_SIZE,
        }
    }
}

#[derive(Debug, Clone)]
pub struct SupabaseStore {
    client: reqwest::Client,
    base_url: String,
    api_key: String,
    page_size: usize,
}

#[derive(Serialize)]
struct PasswordGrant<'a> {
    email: &'a str,
    password: &'a str,
}

#[derive(Deserialize)]
struct TokenResponse {
    access_token: String,
    user: TokenUser,
}

#[derive(Deserialize)]
struct TokenUser {
    id: String,
}

impl SupabaseStore {
    pub fn new(
        base_url: impl Into<String>,
        api_key: impl Into<String>,
        config: StoreClientConfig,
    ) -> Result<Self, StoreError> {
        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout);

        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }

        let client = builder.build()?;
        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            api_key: api_key.into(),
            page_size: config.page_size.max(1),
        })
    }

    fn auth_url(&self) -> String {
        format!("{}/auth/v1/token", self.base_url)
    }

    fn table_url(&self, table: &str) -> String {
        format!("{}/rest/v1/{}", self.base_url, table)
    }

    fn table_request(&self, method: Method, table: &str, identity: &Identity) -> RequestBuilder {
        self.client
            .request(method, self.table_url(table))
            .header("apikey", &self.api_key)
            .bearer_auth(&identity.access_token)
    }

    async fn select_all<T: DeserializeOwned>(
        &self,
        identity: &Identity,
        table: &str,
        columns: &str,
        owner: Option<&str>,
        operation: &'static str,
    ) -> Result<Vec<T>, StoreError> {
        let mut out = Vec::new();
        let mut offset = 0usize;
        loop {
            let mut query = vec![
                ("select", columns.to_string()),
                ("order", "id.asc".to_string()),
                ("limit", self.page_size.to_string()),
                ("offset", offset.to_string()),
            ];
            if let Some(owner) = owner {
                query.push(("user_id", format!("eq.{owner}")));
            }

            let resp = self
                .table_request(Method::GET, table, identity)
                .query(&query)
                .send()
                .await?;
            let page: Vec<T> = check_status(resp, operation).await?.json().await?;
            let fetched = page.len();
            out.extend(page);
            debug!(table, offset, fetched, "fetched page");
            if fetched < self.page_size {
                return Ok(out);
            }
            offset += fetched;
        }
    }

    async fn post_rows<T: Serialize + Sync>(
        &self,
        identity: &Identity,
        table: &str,
        rows: &[T],
        prefer: &'static str,
        operation: &'static str,
    ) -> Result<Response, StoreError> {
        let resp = self
            .table_request(Method::POST, table, identity)
            .header("Prefer", prefer)
            .json(rows)
            .send()
            .await?;
        check_status(resp, operation).await
    }
}

async fn check_status(resp: Response, operation: &'static str) -> Result<Response, StoreError> {
    let status = resp.status();
    if status.is_success() {
        return Ok(resp);
    }
    let message = resp.text().await.unwrap_or_default();
    if status == StatusCode::UNAUTHORIZED {
        return Err(StoreError::Authentication(format!("{operation}: {message}")));
    }
    Err(StoreError::Operation {
        operation,
        status: status.as_u16(),
        message,
    })
}

#[async_trait]
impl Store for SupabaseStore {
    async fn authenticate(&self, email: &str, password: &str) -> Result<Identity, StoreError> {
        if email.trim().is_empty() || password.is_empty() {
            return Err(StoreError::Authentication(
                "email and password are required".to_string(),
            ));
        }

        let resp = self
            .client
            .post(self.auth_url())
            .query(&[("grant_type", "password")])
            .header("apikey", &self.api_key)
            .json(&PasswordGrant { email, password })
            .send()
            .await?;

        let status = resp.status();
        if matches!(
            status,
            StatusCode::BAD_REQUEST | StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN
        ) {
            let message = resp.text().await.unwrap_or_default();
            return Err(StoreError::Authentication(format!("http {status}: {message}")));
        }

        let token: TokenResponse = check_status(resp, "sign in").await?.json().await?;
        Ok(Identity {
            user_id: token.user.id,
            access_token: token.access_token,
        })
    }

    async fn select_groups(
        &self,
        identity: &Identity,
        owner: Option<&str>,
    ) -> Result<Vec<Group>, StoreError> {
        self.select_all(identity, GROUPS_TABLE, GROUP_COLUMNS, owner, "select groups")
            .await
    }

    async fn insert_groups(
        &self,
        identity: &Identity,
        groups: &[NewGroup],
    ) -> Result<Vec<Group>, StoreError> {
        if groups.is_empty() {
            return Ok(Vec::new());
        }
        let resp = self
            .post_rows(
                identity,
                GROUPS_TABLE,
                groups,
                "return=representation",
                "insert groups",
            )
            .await?;
        Ok(resp.json().await?)
    }

    async fn select_time_tracking(
        &self,
        identity: &Identity,
        owner: Option<&str>,
    ) -> Result<Vec<TimeTrackingRow>, StoreError> {
        self.select_all(
            identity,
            TIME_TRACKING_TABLE,
            TIME_TRACKING_COLUMNS,
            owner,
            "select time tracking",
        )
        .await
    }

    async fn insert_time_tracking(
        &self,
        identity: &Identity,
        rows: &[TimeTrackingDraft],
    ) -> Result<usize, StoreError> {
        if rows.is_empty() {
            return Ok(0);
        }
        self.post_rows(
            identity,
            TIME_TRACKING_TABLE,
            rows,
            "return=minimal",
            "insert time tracking",
        )
        .await?;
        Ok(rows.len())
    }

    async fn upsert_time_tracking(
        &self,
        identity: &Identity,
        rows: &[TimeTrackingDraft],
    ) -> Result<usize, StoreError> {
        if rows.is_empty() {
            return Ok(0);
        }
        if rows.iter().any(|row| row.id.is_none()) {
            return Err(StoreError::Backend(
                "upsert requires every row to carry an id".to_string(),
            ));
        }
        self.post_rows(
            identity,
            TIME_TRACKING_TABLE,
            rows,
            "resolution=merge-duplicates,return=minimal",
            "upsert time tracking",
        )
        .await?;
        Ok(rows.len())
    }
}
