use anyhow::{Context, Result};
use reqwest::Client;
use serde_json::{json, Value};

/// How a test user identifies itself to the backend: a signed bearer token,
/// or a bare user id accepted by non-production servers.
#[derive(Debug, Clone)]
pub struct Identity {
    pub user_id: String,
    pub token: Option<String>,
}

impl Identity {
    pub fn parse(spec: &str) -> Self {
        match spec.split_once(':') {
            Some((user_id, token)) => Self {
                user_id: user_id.to_string(),
                token: Some(token.to_string()),
            },
            None => Self {
                user_id: spec.to_string(),
                token: None,
            },
        }
    }
}

pub struct ApiClient {
    client: Client,
    base_url: String,
}

impl ApiClient {
    pub fn new(client: Client, base_url: String) -> Self {
        Self { client, base_url }
    }

    fn request(&self, method: reqwest::Method, path: &str, as_user: &Identity) -> reqwest::RequestBuilder {
        let mut builder = self
            .client
            .request(method, format!("{}{}", self.base_url, path));
        builder = match &as_user.token {
            Some(token) => builder.bearer_auth(token),
            None => builder.query(&[("user_id", as_user.user_id.as_str())]),
        };
        builder
    }

    /// Dispatches an event to one user; returns the local delivery count
    /// the server reported.
    pub async fn send_to_user(
        &self,
        as_user: &Identity,
        target_user_id: &str,
        event_type: &str,
        payload: Value,
    ) -> Result<u64> {
        let response = self
            .request(
                reqwest::Method::POST,
                &format!("/events/users/{target_user_id}"),
                as_user,
            )
            .json(&json!({ "type": event_type, "payload": payload }))
            .send()
            .await?
            .error_for_status()?;
        let body: Value = response.json().await?;
        body["data"]["delivered"]
            .as_u64()
            .context("No delivered count in response")
    }

    /// Broadcasts an event; returns the local delivery count.
    pub async fn broadcast(
        &self,
        as_user: &Identity,
        event_type: &str,
        payload: Value,
    ) -> Result<u64> {
        let response = self
            .request(reqwest::Method::POST, "/events/broadcast", as_user)
            .json(&json!({ "type": event_type, "payload": payload }))
            .send()
            .await?
            .error_for_status()?;
        let body: Value = response.json().await?;
        body["data"]["delivered"]
            .as_u64()
            .context("No delivered count in response")
    }

    pub async fn status(&self, as_user: &Identity) -> Result<Value> {
        let response = self
            .request(reqwest::Method::GET, "/events/status", as_user)
            .send()
            .await?
            .error_for_status()?;
        let body: Value = response.json().await?;
        Ok(body["data"].clone())
    }

    pub async fn stats(&self, as_user: &Identity) -> Result<Value> {
        let response = self
            .request(reqwest::Method::GET, "/events/stats", as_user)
            .send()
            .await?
            .error_for_status()?;
        let body: Value = response.json().await?;
        Ok(body["data"].clone())
    }
}
