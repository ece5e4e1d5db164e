use std::sync::Mutex;
use std::time::{Duration, Instant};

use serde_json::{Value, json};
use thiserror::Error;

/// Refresh the cached token this long before the vendor says it expires.
const TOKEN_EXPIRY_MARGIN_SECS: u64 = 60;

const HTTP_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Error)]
pub enum EnodeError {
    #[error("http request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("unexpected status {status}: {body}")]
    Status {
        status: reqwest::StatusCode,
        body: String,
    },
    #[error("response missing expected field {0}")]
    MissingField(&'static str),
    #[error("token cache lock poisoned")]
    TokenCachePoisoned,
}

/// Vendor API surface used by the pollers and the subscription monitor.
/// Abstracted behind a trait so background components can be tested against
/// a fake.
pub trait EnodeApi: Send + Sync {
    fn vehicles(&self) -> Result<Vec<Value>, EnodeError>;
    fn user_vehicles(&self, user_id: &str) -> Result<Vec<Value>, EnodeError>;
    fn list_subscriptions(&self) -> Result<Vec<Value>, EnodeError>;
    fn create_subscription(&self, url: &str, secret: &str) -> Result<Value, EnodeError>;
    fn delete_subscription(&self, webhook_id: &str) -> Result<(), EnodeError>;
    fn test_subscription(&self, webhook_id: &str) -> Result<Value, EnodeError>;
}

struct CachedToken {
    access_token: String,
    expires_at: Instant,
}

pub struct EnodeClient {
    http: reqwest::blocking::Client,
    base_url: String,
    auth_url: String,
    client_id: String,
    client_secret: String,
    token: Mutex<Option<CachedToken>>,
}

impl EnodeClient {
    pub fn new(
        base_url: &str,
        auth_url: &str,
        client_id: &str,
        client_secret: &str,
    ) -> Result<Self, EnodeError> {
        let http = reqwest::blocking::Client::builder()
            .timeout(HTTP_TIMEOUT)
            .build()?;

        Ok(Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
            auth_url: auth_url.to_string(),
            client_id: client_id.to_string(),
            client_secret: client_secret.to_string(),
            token: Mutex::new(None),
        })
    }

    /// Returns a valid access token, fetching a fresh one via the
    /// client-credentials grant when the cached token is absent or near
    /// expiry.
    fn access_token(&self) -> Result<String, EnodeError> {
        let mut cached = self
            .token
            .lock()
            .map_err(|_| EnodeError::TokenCachePoisoned)?;

        if let Some(token) = cached.as_ref()
            && Instant::now() < token.expires_at
        {
            return Ok(token.access_token.clone());
        }

        let response = self
            .http
            .post(&self.auth_url)
            .basic_auth(&self.client_id, Some(&self.client_secret))
            .form(&[("grant_type", "client_credentials")])
            .send()?;

        let status = response.status();
        if !status.is_success() {
            return Err(EnodeError::Status {
                status,
                body: response.text().unwrap_or_default(),
            });
        }

        let body: Value = response.json()?;
        let access_token = body
            .get("access_token")
            .and_then(Value::as_str)
            .ok_or(EnodeError::MissingField("access_token"))?
            .to_string();
        let expires_in = body
            .get("expires_in")
            .and_then(Value::as_u64)
            .unwrap_or(3600);

        let lifetime = Duration::from_secs(expires_in.saturating_sub(TOKEN_EXPIRY_MARGIN_SECS));
        *cached = Some(CachedToken {
            access_token: access_token.clone(),
            expires_at: Instant::now() + lifetime,
        });

        tracing::debug!(expires_in, "refreshed vendor access token");

        Ok(access_token)
    }

    fn get(&self, path: &str) -> Result<Value, EnodeError> {
        let token = self.access_token()?;
        let response = self
            .http
            .get(format!("{}{path}", self.base_url))
            .bearer_auth(token)
            .send()?;
        Self::parse_response(response)
    }

    fn post(&self, path: &str, body: &Value) -> Result<Value, EnodeError> {
        let token = self.access_token()?;
        let response = self
            .http
            .post(format!("{}{path}", self.base_url))
            .bearer_auth(token)
            .json(body)
            .send()?;
        Self::parse_response(response)
    }

    fn parse_response(response: reqwest::blocking::Response) -> Result<Value, EnodeError> {
        let status = response.status();
        if !status.is_success() {
            return Err(EnodeError::Status {
                status,
                body: response.text().unwrap_or_default(),
            });
        }
        if status == reqwest::StatusCode::NO_CONTENT {
            return Ok(Value::Null);
        }
        Ok(response.json()?)
    }

    fn data_array(body: Value, context: &'static str) -> Result<Vec<Value>, EnodeError> {
        match body.get("data").and_then(Value::as_array) {
            Some(items) => Ok(items.clone()),
            None => match body {
                // Some list endpoints return a bare array.
                Value::Array(items) => Ok(items),
                _ => Err(EnodeError::MissingField(context)),
            },
        }
    }
}

impl EnodeApi for EnodeClient {
    fn vehicles(&self) -> Result<Vec<Value>, EnodeError> {
        let body = self.get("/vehicles")?;
        Self::data_array(body, "data")
    }

    fn user_vehicles(&self, user_id: &str) -> Result<Vec<Value>, EnodeError> {
        let body = self.get(&format!("/users/{user_id}/vehicles"))?;
        Self::data_array(body, "data")
    }

    fn list_subscriptions(&self) -> Result<Vec<Value>, EnodeError> {
        let body = self.get("/webhooks")?;
        Self::data_array(body, "data")
    }

    fn create_subscription(&self, url: &str, secret: &str) -> Result<Value, EnodeError> {
        self.post(
            "/webhooks",
            &json!({
                "url": url,
                "secret": secret,
                "events": ["user:vehicle:discovered", "user:vehicle:updated"],
            }),
        )
    }

    fn delete_subscription(&self, webhook_id: &str) -> Result<(), EnodeError> {
        let token = self.access_token()?;
        let response = self
            .http
            .delete(format!("{}/webhooks/{webhook_id}", self.base_url))
            .bearer_auth(token)
            .send()?;

        let status = response.status();
        if !status.is_success() {
            return Err(EnodeError::Status {
                status,
                body: response.text().unwrap_or_default(),
            });
        }

        Ok(())
    }

    fn test_subscription(&self, webhook_id: &str) -> Result<Value, EnodeError> {
        self.post(&format!("/webhooks/{webhook_id}/test"), &json!({}))
    }
}
