use anyhow::{Result, anyhow};
use reqwest::{
    Client,
    header::{HeaderMap, HeaderValue, CONTENT_TYPE, AUTHORIZATION},
    Method,
};
use serde::de::DeserializeOwned;
use serde_json::Value;
use thiserror::Error;
use tracing::{debug, error};

use shared_config::AppConfig;

pub const DEFAULT_CHUNK_SIZE: usize = 100;

/// Failure classes returned by PostgREST that callers branch on.
#[derive(Error, Debug)]
pub enum SupabaseError {
    #[error("Authentication error: {0}")]
    Auth(String),

    #[error("Resource not found: {0}")]
    NotFound(String),

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("API error ({status}): {body}")]
    Api { status: u16, body: String },
}

impl SupabaseError {
    /// Body of the failed response, used to read raised database exceptions.
    pub fn body(&self) -> &str {
        match self {
            SupabaseError::Auth(body)
            | SupabaseError::NotFound(body)
            | SupabaseError::Conflict(body) => body,
            SupabaseError::Api { body, .. } => body,
        }
    }
}

pub struct SupabaseClient {
    client: Client,
    base_url: String,
    anon_key: String,
    service_role_key: String,
}

impl SupabaseClient {
    pub fn new(config: &AppConfig) -> Self {
        Self {
            client: Client::new(),
            base_url: config.supabase_url.trim_end_matches('/').to_string(),
            anon_key: config.supabase_anon_key.clone(),
            service_role_key: config.supabase_service_role_key.clone(),
        }
    }

    fn get_headers(&self, auth_token: Option<&str>) -> Result<HeaderMap> {
        let mut headers = HeaderMap::new();

        headers.insert("apikey", HeaderValue::from_str(&self.anon_key)?);
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));

        // Background jobs run without a user token and act as the service role.
        let bearer = match auth_token {
            Some(token) => Some(token),
            None if !self.service_role_key.is_empty() => Some(self.service_role_key.as_str()),
            None => None,
        };

        if let Some(token) = bearer {
            headers.insert(
                AUTHORIZATION,
                HeaderValue::from_str(&format!("Bearer {}", token))?,
            );
        }

        Ok(headers)
    }

    pub async fn request<T>(&self, method: Method, path: &str,
                            auth_token: Option<&str>, body: Option<Value>)
                            -> Result<T>
    where T: DeserializeOwned {
        self.request_with_headers(method, path, auth_token, body, None).await
    }

    pub async fn request_with_headers<T>(&self, method: Method, path: &str,
                                         auth_token: Option<&str>, body: Option<Value>,
                                         extra_headers: Option<HeaderMap>)
                                         -> Result<T>
    where T: DeserializeOwned {
        let url = format!("{}{}", self.base_url, path);
        debug!("Making {} request to {}", method, url);

        let mut headers = self.get_headers(auth_token)?;
        if let Some(extra) = extra_headers {
            headers.extend(extra);
        }

        let mut req = self.client.request(method, &url)
            .headers(headers);

        if let Some(body_data) = body {
            req = req.json(&body_data);
        }

        let response = req.send().await?;

        let status = response.status();
        let text = response.text().await?;

        if !status.is_success() {
            error!("API error ({}): {}", status, text);

            return Err(match status.as_u16() {
                401 | 403 => SupabaseError::Auth(text),
                404 => SupabaseError::NotFound(text),
                409 => SupabaseError::Conflict(text),
                code => SupabaseError::Api { status: code, body: text },
            }.into());
        }

        // DELETE and PATCH without a representation come back empty.
        let payload = if text.trim().is_empty() { "null" } else { text.as_str() };
        let data = serde_json::from_str::<T>(payload)
            .map_err(|e| anyhow!("Failed to decode response from {}: {}", path, e))?;
        Ok(data)
    }

    /// Insert a row, reporting `false` when a unique constraint rejects it.
    pub async fn insert_unique(&self, path: &str, row: Value) -> Result<bool> {
        match self.request::<Value>(Method::POST, path, None, Some(row)).await {
            Ok(_) => Ok(true),
            Err(e) => match e.downcast_ref::<SupabaseError>() {
                Some(SupabaseError::Conflict(_)) => Ok(false),
                _ => Err(e),
            },
        }
    }

    /// Insert rows in batches, returning how many were written.
    pub async fn insert_chunked(&self, path: &str, rows: Vec<Value>, chunk_size: usize) -> Result<usize> {
        let chunk_size = chunk_size.max(1);
        let mut written = 0;

        for chunk in rows.chunks(chunk_size) {
            let _: Value = self.request(
                Method::POST,
                path,
                None,
                Some(Value::Array(chunk.to_vec())),
            ).await?;
            written += chunk.len();
            debug!("Inserted {} rows into {} ({} total)", chunk.len(), path, written);
        }

        Ok(written)
    }

    /// Call a Postgres function exposed through PostgREST.
    pub async fn rpc<T>(&self, function: &str, params: Value) -> Result<T>
    where T: DeserializeOwned {
        let path = format!("/rest/v1/rpc/{}", function);
        self.request(Method::POST, &path, None, Some(params)).await
    }

    pub fn return_representation() -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert("Prefer", HeaderValue::from_static("return=representation"));
        headers
    }
}
