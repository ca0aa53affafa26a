use std::time::Duration;

use reqwest::{Client, Method, Response};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::models::{Group, Record};

/// Failure reason reported by the server or the transport. The sync layer
/// never retries these on its own; "try again" is a user action.
#[derive(Debug, Error)]
#[error("{reason}")]
pub struct RemoteError {
    pub reason: String,
}

impl RemoteError {
    pub fn new(reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
        }
    }
}

impl From<reqwest::Error> for RemoteError {
    fn from(err: reqwest::Error) -> Self {
        Self::new(err.to_string())
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct AuthPayload {
    pub user_id: i64,
    pub username: String,
    pub token: String,
}

/// One async call per use case. Ciphertext fields are opaque Base64 strings
/// at this boundary; plaintext never crosses it in either direction.
#[allow(async_fn_in_trait)]
pub trait RemoteClient: Send + Sync {
    async fn login(&self, username: &str, password: &str) -> Result<AuthPayload, RemoteError>;
    async fn login_with_token(&self, token: &str) -> Result<AuthPayload, RemoteError>;
    async fn register(&self, username: &str, password: &str) -> Result<AuthPayload, RemoteError>;

    async fn fetch_groups(&self, token: &str) -> Result<Vec<Group>, RemoteError>;
    async fn fetch_records(
        &self,
        token: &str,
        group_id: Option<i64>,
    ) -> Result<Vec<Record>, RemoteError>;

    async fn create_group(
        &self,
        token: &str,
        name: &str,
        comment: Option<&str>,
    ) -> Result<Group, RemoteError>;
    async fn update_group(&self, token: &str, group: &Group) -> Result<Group, RemoteError>;
    async fn delete_group(&self, token: &str, id: i64) -> Result<(), RemoteError>;

    async fn create_record(&self, token: &str, record: &Record) -> Result<Record, RemoteError>;
    async fn update_record(&self, token: &str, record: &Record) -> Result<Record, RemoteError>;
    async fn delete_record(&self, token: &str, id: i64) -> Result<(), RemoteError>;
}

#[derive(Serialize)]
struct CredentialsBody<'a> {
    username: &'a str,
    password: &'a str,
}

#[derive(Serialize)]
struct GroupBody<'a> {
    name: &'a str,
    comment: Option<&'a str>,
}

/// HTTP implementation of [`RemoteClient`].
pub struct ApiClient {
    client: Client,
    base_url: String,
}

impl ApiClient {
    pub fn new(base_url: String) -> Self {
        Self {
            client: Client::builder()
                .timeout(Duration::from_secs(10))
                .build()
                .expect("Failed to create HTTP client"),
            base_url,
        }
    }

    async fn request<T: Serialize>(
        &self,
        method: Method,
        path: &str,
        token: Option<&str>,
        body: Option<&T>,
    ) -> Result<Response, RemoteError> {
        let url = format!("{}{}", self.base_url, path);
        let mut builder = self.client.request(method, &url);

        if let Some(token) = token {
            builder = builder.bearer_auth(token);
        }
        if let Some(body) = body {
            builder = builder.json(body);
        }

        let resp = builder.send().await?;
        if resp.status().is_success() {
            return Ok(resp);
        }

        let status = resp.status();
        let reason = resp.text().await.unwrap_or_default();
        if reason.is_empty() {
            Err(RemoteError::new(format!("{} {}", status, path)))
        } else {
            Err(RemoteError::new(format!("{} {}: {}", status, path, reason)))
        }
    }

    async fn json<T: for<'de> Deserialize<'de>>(resp: Response) -> Result<T, RemoteError> {
        resp.json().await.map_err(RemoteError::from)
    }
}

impl RemoteClient for ApiClient {
    async fn login(&self, username: &str, password: &str) -> Result<AuthPayload, RemoteError> {
        let body = CredentialsBody { username, password };
        let resp = self
            .request(Method::POST, "/auth/login", None, Some(&body))
            .await?;
        Self::json(resp).await
    }

    async fn login_with_token(&self, token: &str) -> Result<AuthPayload, RemoteError> {
        let resp = self
            .request::<()>(Method::POST, "/auth/token", Some(token), None)
            .await?;
        Self::json(resp).await
    }

    async fn register(&self, username: &str, password: &str) -> Result<AuthPayload, RemoteError> {
        let body = CredentialsBody { username, password };
        let resp = self
            .request(Method::POST, "/auth/register", None, Some(&body))
            .await?;
        Self::json(resp).await
    }

    async fn fetch_groups(&self, token: &str) -> Result<Vec<Group>, RemoteError> {
        let resp = self
            .request::<()>(Method::GET, "/groups", Some(token), None)
            .await?;
        Self::json(resp).await
    }

    async fn fetch_records(
        &self,
        token: &str,
        group_id: Option<i64>,
    ) -> Result<Vec<Record>, RemoteError> {
        let path = match group_id {
            Some(id) => format!("/records?group={}", id),
            None => "/records".to_string(),
        };
        let resp = self
            .request::<()>(Method::GET, &path, Some(token), None)
            .await?;
        Self::json(resp).await
    }

    async fn create_group(
        &self,
        token: &str,
        name: &str,
        comment: Option<&str>,
    ) -> Result<Group, RemoteError> {
        let body = GroupBody { name, comment };
        let resp = self
            .request(Method::POST, "/groups", Some(token), Some(&body))
            .await?;
        Self::json(resp).await
    }

    async fn update_group(&self, token: &str, group: &Group) -> Result<Group, RemoteError> {
        let path = format!("/groups/{}", group.id);
        let resp = self
            .request(Method::PUT, &path, Some(token), Some(group))
            .await?;
        Self::json(resp).await
    }

    async fn delete_group(&self, token: &str, id: i64) -> Result<(), RemoteError> {
        let path = format!("/groups/{}", id);
        self.request::<()>(Method::DELETE, &path, Some(token), None)
            .await?;
        Ok(())
    }

    async fn create_record(&self, token: &str, record: &Record) -> Result<Record, RemoteError> {
        let resp = self
            .request(Method::POST, "/records", Some(token), Some(record))
            .await?;
        Self::json(resp).await
    }

    async fn update_record(&self, token: &str, record: &Record) -> Result<Record, RemoteError> {
        let path = format!("/records/{}", record.id);
        let resp = self
            .request(Method::PUT, &path, Some(token), Some(record))
            .await?;
        Self::json(resp).await
    }

    async fn delete_record(&self, token: &str, id: i64) -> Result<(), RemoteError> {
        let path = format!("/records/{}", id);
        self.request::<()>(Method::DELETE, &path, Some(token), None)
            .await?;
        Ok(())
    }
}
