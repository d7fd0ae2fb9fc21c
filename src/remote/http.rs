use super::{RemoteAuthority, RemoteResult};
use crate::core::{CanonicalRecord, Collection, Fields, RemoteError, Result, SyncError};
use async_trait::async_trait;
use reqwest::{Client, Method, StatusCode, Url};
use serde::Deserialize;
use std::time::Duration;
use tracing::{Level, event};

/// Body the Remote Authority sends with a failed request.
#[derive(Debug, Deserialize)]
struct ErrorBody {
    error: String,
    #[serde(default)]
    code: Option<String>,
}

/// Remote Authority spoken to over REST: `POST/GET /{resource}`,
/// `PUT/DELETE /{resource}/{id}`.
#[derive(Debug, Clone)]
pub struct HttpRemoteAuthority {
    client: Client,
    base_url: Url,
    bearer_token: Option<String>,
}

impl HttpRemoteAuthority {
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self> {
        let base_url = Url::parse(base_url)
            .map_err(|err| SyncError::Config(format!("Invalid remote URL '{}': {}", base_url, err)))?;
        if base_url.cannot_be_a_base() {
            return Err(SyncError::Config(format!(
                "Remote URL '{}' cannot be used as a base",
                base_url
            )));
        }
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|err| SyncError::Config(format!("Failed to build HTTP client: {}", err)))?;
        Ok(Self {
            client,
            base_url,
            bearer_token: None,
        })
    }

    pub fn with_bearer_token(mut self, token: impl Into<String>) -> Self {
        self.bearer_token = Some(token.into());
        self
    }

    fn url(&self, collection: Collection, id: Option<&str>) -> RemoteResult<Url> {
        let mut url = self.base_url.clone();
        {
            let mut segments = url
                .path_segments_mut()
                .map_err(|_| RemoteError::permanent(None, "remote URL cannot be a base"))?;
            segments.pop_if_empty().push(collection.resource());
            if let Some(id) = id {
                segments.push(id);
            }
        }
        Ok(url)
    }

    async fn send(
        &self,
        method: Method,
        url: Url,
        body: Option<&Fields>,
    ) -> RemoteResult<Option<Vec<u8>>> {
        event!(Level::DEBUG, %method, %url, "remote request");
        let mut request = self.client.request(method.clone(), url.clone());
        if let Some(token) = &self.bearer_token {
            request = request.bearer_auth(token);
        }
        if let Some(body) = body {
            request = request.json(body);
        }

        let response = request.send().await.map_err(classify_transport)?;
        let status = response.status();
        let bytes = response.bytes().await.map_err(classify_transport)?;

        if status.is_success() {
            if status == StatusCode::NO_CONTENT || bytes.is_empty() {
                return Ok(None);
            }
            return Ok(Some(bytes.to_vec()));
        }

        let message = match serde_json::from_slice::<ErrorBody>(&bytes) {
            Ok(body) => match body.code {
                Some(code) => format!("{} ({})", body.error, code),
                None => body.error,
            },
            Err(_) => String::from_utf8_lossy(&bytes).trim().to_string(),
        };
        event!(Level::DEBUG, %method, %url, status = status.as_u16(), %message, "remote request failed");
        Err(RemoteError::from_status(status.as_u16(), message))
    }
}

fn classify_transport(err: reqwest::Error) -> RemoteError {
    if err.is_timeout() || err.is_connect() || err.is_request() || err.is_body() {
        return RemoteError::transient(err.to_string());
    }
    match err.status() {
        Some(status) => RemoteError::from_status(status.as_u16(), err.to_string()),
        None => RemoteError::transient(err.to_string()),
    }
}

fn decode<T: serde::de::DeserializeOwned>(body: Option<Vec<u8>>, what: &str) -> RemoteResult<T> {
    let body = body.ok_or_else(|| {
        RemoteError::permanent(None, format!("empty response body for {}", what))
    })?;
    serde_json::from_slice(&body).map_err(|err| {
        RemoteError::permanent(None, format!("malformed response body for {}: {}", what, err))
    })
}

#[async_trait]
impl RemoteAuthority for HttpRemoteAuthority {
    async fn create(&self, collection: Collection, payload: &Fields) -> RemoteResult<CanonicalRecord> {
        let url = self.url(collection, None)?;
        let body = self.send(Method::POST, url, Some(payload)).await?;
        decode(body, "create")
    }

    async fn update(
        &self,
        collection: Collection,
        id: &str,
        payload: &Fields,
    ) -> RemoteResult<Option<CanonicalRecord>> {
        let url = self.url(collection, Some(id))?;
        match self.send(Method::PUT, url, Some(payload)).await? {
            Some(body) => decode(Some(body), "update").map(Some),
            None => Ok(None),
        }
    }

    async fn delete(&self, collection: Collection, id: &str) -> RemoteResult<()> {
        let url = self.url(collection, Some(id))?;
        self.send(Method::DELETE, url, None).await?;
        Ok(())
    }

    async fn list(&self, collection: Collection) -> RemoteResult<Vec<CanonicalRecord>> {
        let url = self.url(collection, None)?;
        let body = self.send(Method::GET, url, None).await?;
        match body {
            Some(body) => decode(Some(body), "list"),
            None => Ok(Vec::new()),
        }
    }
}
