//! Civitai REST client.
//!
//! Endpoints used:
//! - `GET /model-versions/by-hash/{sha256}`
//! - `GET /models/{id}`
//! - `GET /model-versions/{id}`
//!
//! Download URLs are resolved without following redirects; the signed
//! location comes from the `Location` header.

use super::types::{
    HashMatch, PreviewImage, RegistryFile, RemoteModel, ResolvedDownload, VersionRecord,
};
use super::ModelRegistry;
use crate::config::Settings;
use crate::error::{AimodelError, FailureKind, Result};
use crate::network::{check_status, HttpClient, RetryPolicy};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use regex::Regex;
use reqwest::{header, Url};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use std::collections::HashMap;
use std::sync::LazyLock;
use tracing::{debug, warn};

static MODEL_PATH: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"models/(\d+)").unwrap());
static VERSION_QUERY: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"[?&]modelVersionId=(\d+)").unwrap());

/// Model id and optional version id from a model page URL such as
/// `https://civitai.com/models/123/name?modelVersionId=456`.
pub fn parse_model_url(url: &str) -> Option<(u64, Option<u64>)> {
    let model_id = MODEL_PATH.captures(url)?[1].parse().ok()?;
    let version_id = VERSION_QUERY
        .captures(url)
        .and_then(|c| c[1].parse().ok());
    Some((model_id, version_id))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ApiModel {
    id: u64,
    #[serde(default)]
    name: String,
    #[serde(default, rename = "type")]
    model_type: String,
    #[serde(default)]
    nsfw: bool,
    #[serde(default)]
    description: Option<String>,
    #[serde(default)]
    model_versions: Vec<ApiVersion>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ApiVersionModel {
    #[serde(default)]
    name: Option<String>,
    #[serde(default, rename = "type")]
    model_type: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ApiVersion {
    id: u64,
    #[serde(default)]
    model_id: Option<u64>,
    #[serde(default)]
    name: String,
    #[serde(default)]
    created_at: Option<String>,
    #[serde(default)]
    published_at: Option<String>,
    #[serde(default)]
    status: Option<String>,
    #[serde(default)]
    early_access_deadline: Option<String>,
    #[serde(default)]
    base_model: Option<String>,
    #[serde(default)]
    trained_words: Vec<String>,
    #[serde(default)]
    description: Option<String>,
    #[serde(default)]
    files: Vec<ApiFile>,
    #[serde(default)]
    images: Vec<ApiImage>,
    #[serde(default)]
    model: Option<ApiVersionModel>,
    #[serde(default)]
    download_url: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ApiFile {
    id: u64,
    #[serde(default)]
    name: String,
    #[serde(default, rename = "sizeKB")]
    size_kb: Option<f64>,
    #[serde(default)]
    primary: Option<bool>,
    #[serde(default)]
    hashes: HashMap<String, String>,
    #[serde(default)]
    download_url: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ApiImage {
    url: String,
    #[serde(default, rename = "type")]
    kind: Option<String>,
}

/// [`ModelRegistry`] backed by the Civitai API.
#[derive(Debug, Clone)]
pub struct CivitaiClient {
    http: HttpClient,
    base_url: String,
    retry: RetryPolicy,
    hide_early_access: bool,
}

impl CivitaiClient {
    /// Create a client for the API at `base_url`.
    pub fn new(http: HttpClient, base_url: impl Into<String>, retry: RetryPolicy) -> Self {
        Self {
            http,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            retry,
            hide_early_access: true,
        }
    }

    /// Build a client from user settings: API base, key, proxy, timeout and retries.
    pub fn from_settings(settings: &Settings) -> Result<Self> {
        Ok(Self::new(
            HttpClient::from_settings(settings)?,
            settings.api_base_url.clone(),
            settings.retry_policy(),
        )
        .with_hide_early_access(settings.hide_early_access))
    }

    /// Treat early-access and file-less versions as retracted.
    pub fn with_hide_early_access(mut self, hide: bool) -> Self {
        self.hide_early_access = hide;
        self
    }

    async fn get<T: DeserializeOwned>(&self, path: &str) -> Result<T> {
        let url = format!("{}{}", self.base_url, path);
        let (result, _) = self.retry.run(|| self.http.get_json::<T>(&url)).await;
        result
    }

    async fn get_version(&self, version_id: u64) -> Result<ApiVersion> {
        self.get(&format!("/model-versions/{}", version_id))
            .await
            .map_err(|e| match e {
                AimodelError::NotFound { .. } => AimodelError::NotFound {
                    what: format!("model version {}", version_id),
                },
                other => other,
            })
    }

    /// Follow one redirect hop by hand to obtain the signed URL.
    async fn resolve_redirect(&self, url: &str) -> Result<String> {
        let (result, _) = self
            .retry
            .run(|| async {
                let response = self.http.get_no_redirect(url).await?;
                let status = response.status();

                if status.is_redirection() {
                    let location = response
                        .headers()
                        .get(header::LOCATION)
                        .and_then(|v| v.to_str().ok())
                        .map(str::to_string);
                    let body = response.text().await.unwrap_or_default();
                    let location_text = location.as_deref().unwrap_or_default();
                    if requires_login(&body) || requires_login(location_text) {
                        return Err(AimodelError::AuthRequired {
                            url: url.to_string(),
                        });
                    }
                    let location = location.ok_or_else(|| AimodelError::Http {
                        url: url.to_string(),
                        status: status.as_u16(),
                    })?;
                    let resolved = Url::parse(url)
                        .and_then(|base| base.join(&location))
                        .map(|u| u.to_string())
                        .unwrap_or(location);
                    return Ok(resolved);
                }

                check_status(response, url)?;
                Ok(url.to_string())
            })
            .await;
        result
    }

    fn convert_version(
        &self,
        api: ApiVersion,
        model_id: u64,
        now: DateTime<Utc>,
    ) -> Option<VersionRecord> {
        let published_at = api
            .published_at
            .as_deref()
            .or(api.created_at.as_deref())
            .and_then(parse_timestamp);
        let Some(published_at) = published_at else {
            warn!("Skipping version {} without a publish time", api.id);
            return None;
        };

        let unpublished = api
            .status
            .as_deref()
            .is_some_and(|status| status != "Published");
        let early_access = self.hide_early_access
            && (api.files.is_empty()
                || api
                    .early_access_deadline
                    .as_deref()
                    .and_then(parse_timestamp)
                    .is_some_and(|deadline| deadline > now));

        let fallback_url = api.download_url.clone().unwrap_or_default();
        Some(VersionRecord {
            version_id: api.id,
            model_id: api.model_id.unwrap_or(model_id),
            name: api.name,
            published_at,
            retracted: unpublished || early_access,
            base_model: api.base_model,
            trained_words: api.trained_words,
            files: api
                .files
                .into_iter()
                .map(|f| convert_file(f, &fallback_url))
                .collect(),
            images: convert_images(api.images),
        })
    }
}

#[async_trait]
impl ModelRegistry for CivitaiClient {
    async fn identify_by_hash(&self, digest: &str) -> Result<Option<HashMatch>> {
        let result: Result<ApiVersion> = self
            .get(&format!("/model-versions/by-hash/{}", digest))
            .await;
        let api = match result {
            Ok(api) => api,
            Err(AimodelError::NotFound { .. }) => {
                debug!("Registry does not know {}", digest);
                return Ok(None);
            }
            Err(e @ AimodelError::AuthRequired { .. }) => return Err(e),
            Err(e) => {
                return Err(AimodelError::IdentifyFailure {
                    digest: digest.to_string(),
                    message: e.to_string(),
                })
            }
        };

        let model_id = api.model_id.ok_or_else(|| AimodelError::IdentifyFailure {
            digest: digest.to_string(),
            message: "response carries no modelId".to_string(),
        })?;
        let model = api.model.unwrap_or_default();
        let fallback_url = api.download_url.clone().unwrap_or_default();
        let file = api
            .files
            .into_iter()
            .map(|f| convert_file(f, &fallback_url))
            .find(|f| {
                f.sha256
                    .as_deref()
                    .is_some_and(|h| h.eq_ignore_ascii_case(digest))
            });

        Ok(Some(HashMatch {
            model_id,
            version_id: api.id,
            version_name: api.name,
            model_name: model.name,
            model_type: model.model_type,
            base_model: api.base_model,
            trained_words: api.trained_words,
            description: api.description,
            images: convert_images(api.images),
            file,
        }))
    }

    async fn get_model(&self, model_id: u64) -> Result<RemoteModel> {
        let api: ApiModel = self
            .get(&format!("/models/{}", model_id))
            .await
            .map_err(|e| match e {
                AimodelError::NotFound { .. } => AimodelError::NotFound {
                    what: format!("model {}", model_id),
                },
                other => other,
            })?;

        let now = Utc::now();
        let versions = api
            .model_versions
            .into_iter()
            .filter_map(|v| self.convert_version(v, api.id, now))
            .collect();

        Ok(RemoteModel {
            model_id: api.id,
            name: api.name,
            model_type: api.model_type,
            nsfw: api.nsfw,
            description: api.description,
            versions,
        })
    }

    async fn resolve_download_url(
        &self,
        version_id: u64,
        file_id: Option<u64>,
    ) -> Result<ResolvedDownload> {
        let api = self.get_version(version_id).await?;
        let model_id = api.model_id.unwrap_or_default();
        let version = self
            .convert_version(api, model_id, Utc::now())
            .ok_or_else(|| AimodelError::NotFound {
                what: format!("published version {}", version_id),
            })?;

        let file = match file_id {
            Some(id) => version.file(id),
            None => version.primary_file(),
        }
        .ok_or_else(|| AimodelError::NotFound {
            what: match file_id {
                Some(id) => format!("file {} of version {}", id, version_id),
                None => format!("files of version {}", version_id),
            },
        })?;

        if file.download_url.is_empty() {
            return Err(AimodelError::NotFound {
                what: format!("download URL for file {}", file.file_id),
            });
        }

        let url = self.resolve_redirect(&file.download_url).await?;
        Ok(ResolvedDownload {
            url,
            expected_size: file.size_bytes,
            expected_hash: file.sha256.clone(),
            file_name: file.name.clone(),
        })
    }
}

fn requires_login(text: &str) -> bool {
    text.contains("login?returnUrl") && text.contains("reason=download-auth")
}

fn parse_timestamp(value: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(value)
        .ok()
        .map(|t| t.with_timezone(&Utc))
}

fn convert_file(api: ApiFile, fallback_url: &str) -> RegistryFile {
    let sha256 = api
        .hashes
        .iter()
        .find(|(algo, _)| algo.eq_ignore_ascii_case("sha256"))
        .map(|(_, hash)| hash.to_lowercase());
    RegistryFile {
        file_id: api.id,
        name: api.name,
        size_bytes: api
            .size_kb
            .filter(|kb| *kb > 0.0)
            .map(|kb| (kb * 1024.0).round() as u64),
        sha256,
        download_url: api
            .download_url
            .unwrap_or_else(|| fallback_url.to_string()),
        primary: api.primary.unwrap_or(false),
    }
}

fn convert_images(images: Vec<ApiImage>) -> Vec<PreviewImage> {
    images
        .into_iter()
        .map(|i| PreviewImage {
            url: i.url,
            kind: i.kind.unwrap_or_else(|| "image".to_string()),
        })
        .collect()
}

/// Whether a registry failure means the registry could not be consulted.
pub(crate) fn is_unavailable(err: &AimodelError) -> bool {
    matches!(
        err.kind(),
        FailureKind::Identify | FailureKind::Network | FailureKind::Timeout
    )
}
