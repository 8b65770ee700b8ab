//! HTTP clients configured from [`Settings`].
//!
//! Three `reqwest` clients share one configuration (user agent, proxy,
//! TLS verification, connect timeout):
//! - `api`: bounded by the request timeout, follows redirects
//! - `transfer`: no total timeout, the downloader enforces an idle deadline
//! - `no_redirect`: used to read signed `Location` headers

use crate::config::{NetworkConfig, Settings};
use crate::{AimodelError, Result};
use reqwest::{redirect, Client, RequestBuilder, Response, StatusCode};
use serde::de::DeserializeOwned;
use std::time::Duration;
use tracing::debug;

/// Configured HTTP clients plus the credentials to attach to registry calls.
#[derive(Debug, Clone)]
pub struct HttpClient {
    api: Client,
    transfer: Client,
    no_redirect: Client,
    api_key: Option<String>,
    timeout: Duration,
}

impl HttpClient {
    /// Build clients with default settings and the given request timeout.
    pub fn with_timeout(timeout: Duration) -> Result<Self> {
        let mut settings = Settings::default();
        settings.timeout_secs = timeout.as_secs().max(1);
        Self::from_settings(&settings)
    }

    /// Build the clients from user settings: user agent, proxy, TLS
    /// verification, request timeout and API key.
    pub fn from_settings(settings: &Settings) -> Result<Self> {
        let timeout = settings.timeout();
        Ok(Self {
            api: build_client(settings, Some(timeout), redirect::Policy::default())?,
            transfer: build_client(settings, None, redirect::Policy::default())?,
            no_redirect: build_client(settings, Some(timeout), redirect::Policy::none())?,
            api_key: settings.api_key().map(str::to_string),
            timeout,
        })
    }

    /// Per-request deadline, also used as the idle deadline between body chunks.
    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Client for file transfers. It never carries the API key.
    pub fn transfer(&self) -> &Client {
        &self.transfer
    }

    /// Attach the bearer token when an API key is configured.
    pub fn authorize(&self, request: RequestBuilder) -> RequestBuilder {
        match &self.api_key {
            Some(key) => request.bearer_auth(key),
            None => request,
        }
    }

    /// GET `url` and decode the JSON body.
    pub async fn get_json<T: DeserializeOwned>(&self, url: &str) -> Result<T> {
        debug!("GET {}", url);
        let response = self
            .authorize(self.api.get(url))
            .send()
            .await
            .map_err(|e| self.map_error(e))?;
        let response = check_status(response, url)?;
        let body = response.bytes().await.map_err(|e| self.map_error(e))?;
        serde_json::from_slice(&body).map_err(|e| AimodelError::Json {
            message: format!("Malformed response from {}: {}", url, e),
            source: Some(e),
        })
    }

    /// GET `url` without following redirects.
    pub async fn get_no_redirect(&self, url: &str) -> Result<Response> {
        debug!("GET {} (no redirect)", url);
        self.authorize(self.no_redirect.get(url))
            .send()
            .await
            .map_err(|e| self.map_error(e))
    }

    /// GET `url` and return the whole body.
    pub async fn get_bytes(&self, url: &str) -> Result<Vec<u8>> {
        let response = self
            .api
            .get(url)
            .send()
            .await
            .map_err(|e| self.map_error(e))?;
        let response = check_status(response, url)?;
        let body = response.bytes().await.map_err(|e| self.map_error(e))?;
        Ok(body.to_vec())
    }

    /// Map a transport error, reporting this client's request timeout.
    pub fn map_error(&self, err: reqwest::Error) -> AimodelError {
        AimodelError::from_reqwest(err, self.timeout)
    }
}

fn build_client(
    settings: &Settings,
    timeout: Option<Duration>,
    policy: redirect::Policy,
) -> Result<Client> {
    let mut builder = Client::builder()
        .user_agent(NetworkConfig::USER_AGENT)
        .connect_timeout(NetworkConfig::CONNECT_TIMEOUT.min(settings.timeout()))
        .redirect(policy);

    if let Some(timeout) = timeout {
        builder = builder.timeout(timeout);
    }
    if settings.disable_ssl {
        builder = builder.danger_accept_invalid_certs(true);
    }
    if let Some(proxy) = settings.proxy() {
        let proxy = reqwest::Proxy::all(proxy).map_err(|e| AimodelError::Config {
            message: format!("Invalid proxy '{}': {}", proxy, e),
        })?;
        builder = builder.proxy(proxy);
    }

    builder.build().map_err(|e| AimodelError::NetworkFailure {
        message: format!("Failed to create HTTP client: {}", e),
        source: Some(e),
    })
}

/// Map a non-success status onto the error taxonomy.
pub fn check_status(response: Response, url: &str) -> Result<Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    Err(match status {
        StatusCode::NOT_FOUND => AimodelError::NotFound {
            what: url.to_string(),
        },
        StatusCode::UNAUTHORIZED => AimodelError::AuthRequired {
            url: url.to_string(),
        },
        _ => AimodelError::Http {
            url: url.to_string(),
            status: status.as_u16(),
        },
    })
}
