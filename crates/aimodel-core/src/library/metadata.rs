//! Descriptive sidecar fields and preview images for identified files.

use super::index::IndexedModel;
use super::sidecar::Sidecar;
use crate::config::{NetworkConfig, Settings};
use crate::error::Result;
use crate::hashing::ContentHasher;
use crate::metadata::atomic_write_bytes;
use crate::network::HttpClient;
use crate::registry::{DynRegistry, HashMatch};
use regex::Regex;
use std::path::Path;
use std::sync::LazyLock;
use tracing::{debug, info, warn};

pub const ACTIVATION_TEXT_KEY: &str = "activation text";
pub const SD_VERSION_KEY: &str = "sd version";
pub const DESCRIPTION_KEY: &str = "description";

static LORA_TAG: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"<[^>]*:[^>]*>").unwrap());
static COMMA_SPACING: LazyLock<Regex> = LazyLock::new(|| Regex::new(r",\s*").unwrap());
static WIDTH_SEGMENT: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"/width=\d+").unwrap());
static ANCHOR: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"(?is)<a\s[^>]*href\s*=\s*["']([^"']*)["'][^>]*>(.*?)</a>"#).unwrap()
});
static TAG: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"(?s)<[^>]+>").unwrap());
static BLOCK_END: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)<br\s*/?>|</p>|</li>|</h[1-6]>").unwrap());

const IMAGE_EXTENSIONS: &[&str] = &[".jpg", ".jpeg", ".png", ".gif", ".bmp", ".webp"];

/// What to fill in.
#[derive(Debug, Clone, Copy)]
pub struct CompletionOptions {
    pub force: bool,
    pub metadata: bool,
    pub preview: bool,
}

impl Default for CompletionOptions {
    fn default() -> Self {
        Self {
            force: false,
            metadata: true,
            preview: true,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompletionStatus {
    Completed {
        metadata_written: bool,
        preview_written: bool,
    },
    /// Everything requested was already present.
    Skipped,
    /// The file has no remote identity to complete from.
    Unidentified,
}

/// Fills sidecar descriptive fields and fetches preview images.
#[derive(Clone)]
pub struct MetadataCompleter {
    registry: DynRegistry,
    http: HttpClient,
    save_metadata: bool,
    save_preview: bool,
}

impl MetadataCompleter {
    /// Create a completer. `save_metadata` and `save_preview` come from `settings`.
    pub fn new(registry: DynRegistry, http: HttpClient, settings: &Settings) -> Self {
        Self {
            registry,
            http,
            save_metadata: settings.save_metadata,
            save_preview: settings.save_preview,
        }
    }

    /// Complete the sidecar and preview of an indexed file.
    ///
    /// Uses the registry data captured during the scan when present,
    /// otherwise asks the registry again. A failed preview download is
    /// logged, not returned.
    pub async fn complete(
        &self,
        model: &IndexedModel,
        options: CompletionOptions,
    ) -> Result<CompletionStatus> {
        if !model.is_identified() {
            return Ok(CompletionStatus::Unidentified);
        }

        let path = model.file.path.as_path();
        let sidecar = Sidecar::load_or_default(path);
        let want_metadata = options.metadata && (options.force || !has_descriptive_fields(&sidecar));
        let want_preview = options.preview
            && self.save_preview
            && (options.force || !Sidecar::preview_path_for(path).exists());

        if !want_metadata && !want_preview {
            return Ok(CompletionStatus::Skipped);
        }

        let matched = match &model.matched {
            Some(matched) => matched.clone(),
            None => match self
                .registry
                .identify_by_hash(&model.file.content_hash)
                .await?
            {
                Some(matched) => matched,
                None => return Ok(CompletionStatus::Unidentified),
            },
        };

        let metadata_written = if want_metadata {
            let mut sidecar = Sidecar::load_or_default(path);
            let changed = apply_metadata(&mut sidecar, &matched, options.force);
            if changed {
                sidecar.save(path)?;
                debug!("Wrote metadata for {}", path.display());
            }
            changed
        } else {
            false
        };

        let preview_written = if want_preview {
            match self.write_preview(path, &matched).await {
                Ok(written) => written,
                Err(e) => {
                    warn!("Failed to save preview for {}: {}", path.display(), e);
                    false
                }
            }
        } else {
            false
        };

        Ok(CompletionStatus::Completed {
            metadata_written,
            preview_written,
        })
    }

    /// Write the sidecar of a freshly downloaded file.
    ///
    /// A digest verified during the transfer seeds the hash cache; without
    /// one the file is hashed here. Descriptive fields and the preview
    /// follow the `save_metadata`/`save_preview` settings.
    pub async fn record_download(
        &self,
        path: &Path,
        matched: &HashMatch,
        verified_digest: Option<&str>,
    ) -> Result<CompletionStatus> {
        let hasher = ContentHasher::new();
        match verified_digest {
            Some(digest) => {
                hasher.seed(path, digest)?;
            }
            None => {
                hasher.hash(path).await?;
            }
        }

        let mut sidecar = Sidecar::load_or_default(path);
        sidecar.set_identity(matched.model_id, matched.version_id);
        let metadata_written = if self.save_metadata {
            apply_metadata(&mut sidecar, matched, true)
        } else {
            sidecar.model_name = matched.model_name.clone();
            sidecar.model_type = matched.model_type.clone();
            false
        };
        sidecar.save(path)?;

        let preview_written = if self.save_preview {
            match self.write_preview(path, matched).await {
                Ok(written) => written,
                Err(e) => {
                    warn!("Failed to save preview for {}: {}", path.display(), e);
                    false
                }
            }
        } else {
            false
        };

        Ok(CompletionStatus::Completed {
            metadata_written,
            preview_written,
        })
    }

    /// Fetch the first image preview of `matched` next to `model_path`.
    pub async fn write_preview(&self, model_path: &Path, matched: &HashMatch) -> Result<bool> {
        let Some(image) = matched.first_image() else {
            debug!("No preview image for {}", model_path.display());
            return Ok(false);
        };
        let url = preview_url(&image.url);
        let bytes = self.http.get_bytes(&url).await?;
        let preview_path = Sidecar::preview_path_for(model_path);
        atomic_write_bytes(&preview_path, &bytes)?;
        info!("Saved preview {}", preview_path.display());
        Ok(true)
    }
}

fn has_descriptive_fields(sidecar: &Sidecar) -> bool {
    sidecar.has_extra(ACTIVATION_TEXT_KEY) && sidecar.has_extra(SD_VERSION_KEY)
}

/// Copy registry fields into the sidecar. Existing values are kept unless
/// `force`. Returns whether anything changed.
pub fn apply_metadata(sidecar: &mut Sidecar, matched: &HashMatch, force: bool) -> bool {
    let before = sidecar.clone();

    if force || !sidecar.has_extra(ACTIVATION_TEXT_KEY) {
        sidecar.set_extra(ACTIVATION_TEXT_KEY, activation_text(&matched.trained_words));
    }
    if force || !sidecar.has_extra(SD_VERSION_KEY) {
        sidecar.set_extra(
            SD_VERSION_KEY,
            normalize_base_model(matched.base_model.as_deref().unwrap_or_default()),
        );
    }
    if let Some(description) = matched.description.as_deref().map(clean_description) {
        if !description.is_empty() && (force || !sidecar.has_extra(DESCRIPTION_KEY)) {
            sidecar.set_extra(DESCRIPTION_KEY, description);
        }
    }
    if force || sidecar.model_name.is_none() {
        sidecar.model_name = matched.model_name.clone().or(sidecar.model_name.take());
    }
    if force || sidecar.model_type.is_none() {
        sidecar.model_type = matched.model_type.clone().or(sidecar.model_type.take());
    }
    sidecar.set_identity(matched.model_id, matched.version_id);

    *sidecar != before
}

/// Trained words joined with `, `, with `<name:weight>` tokens removed.
pub fn activation_text(trained_words: &[String]) -> String {
    let joined = trained_words.join(",");
    let stripped = LORA_TAG.replace_all(&joined, "");
    let spaced = COMMA_SPACING.replace_all(&stripped, ", ");
    spaced
        .trim_matches(|c: char| c == ',' || c.is_whitespace())
        .to_string()
}

/// `SD1`, `SD2`, `SDXL` or `Other`.
pub fn normalize_base_model(base_model: &str) -> &'static str {
    if base_model.starts_with("SD 1") {
        "SD1"
    } else if base_model.starts_with("SD 2") {
        "SD2"
    } else if base_model.starts_with("SDXL") {
        "SDXL"
    } else {
        "Other"
    }
}

/// Plain text from an HTML description. Links become `text url` unless
/// they point at an image.
pub fn clean_description(html: &str) -> String {
    let linked = ANCHOR.replace_all(html, |caps: &regex::Captures| {
        let href = &caps[1];
        let text = &caps[2];
        let lower = href.to_lowercase();
        if IMAGE_EXTENSIONS.iter().any(|ext| lower.ends_with(ext)) {
            text.to_string()
        } else {
            format!("{} {}", text, href)
        }
    });
    let broken = BLOCK_END.replace_all(&linked, "\n");
    let text = TAG.replace_all(&broken, "");
    decode_entities(&text).trim().to_string()
}

fn decode_entities(text: &str) -> String {
    text.replace("&nbsp;", " ")
        .replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&quot;", "\"")
        .replace("&#39;", "'")
        .replace("&amp;", "&")
}

/// Preview URL rewritten to the preview width.
pub fn preview_url(url: &str) -> String {
    WIDTH_SEGMENT
        .replace_all(url, format!("/width={}", NetworkConfig::PREVIEW_WIDTH).as_str())
        .into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn matched() -> HashMatch {
        HashMatch {
            model_id: 4201,
            version_id: 130072,
            version_name: "v6".into(),
            model_name: Some("Realistic".into()),
            model_type: Some("Checkpoint".into()),
            base_model: Some("SD 1.5".into()),
            trained_words: vec!["analog style".into(), "<lora:foo:0.8>".into(), "film".into()],
            description: Some("<p>Great <a href=\"https://x.io/guide\">guide</a></p>".into()),
            images: Vec::new(),
            file: None,
        }
    }

    #[test]
    fn test_activation_text() {
        assert_eq!(activation_text(&matched().trained_words), "analog style, film");
        assert_eq!(activation_text(&[]), "");
        assert_eq!(
            activation_text(&["a,b".into(), " c".into()]),
            "a, b, c"
        );
    }

    #[test]
    fn test_normalize_base_model() {
        assert_eq!(normalize_base_model("SD 1.5"), "SD1");
        assert_eq!(normalize_base_model("SD 2.1 768"), "SD2");
        assert_eq!(normalize_base_model("SDXL 1.0"), "SDXL");
        assert_eq!(normalize_base_model("Pony"), "Other");
    }

    #[test]
    fn test_clean_description() {
        assert_eq!(
            clean_description("<p>Great <a href=\"https://x.io/guide\">guide</a></p>"),
            "Great guide https://x.io/guide"
        );
        assert_eq!(
            clean_description("<a href='https://x.io/a.PNG'>pic</a> &amp; more"),
            "pic & more"
        );
    }

    #[test]
    fn test_preview_url() {
        assert_eq!(
            preview_url("https://image.civitai.com/abc/width=450/1.jpeg"),
            "https://image.civitai.com/abc/width=512/1.jpeg"
        );
        assert_eq!(preview_url("https://x/1.png"), "https://x/1.png");
    }

    #[test]
    fn test_apply_metadata_keeps_existing_unless_forced() {
        let mut sidecar = Sidecar::default();
        sidecar.set_extra(ACTIVATION_TEXT_KEY, "mine");

        assert!(apply_metadata(&mut sidecar, &matched(), false));
        assert_eq!(sidecar.extra_str(ACTIVATION_TEXT_KEY), Some("mine"));
        assert_eq!(sidecar.extra_str(SD_VERSION_KEY), Some("SD1"));
        assert_eq!(
            sidecar.extra_str(DESCRIPTION_KEY),
            Some("Great guide https://x.io/guide")
        );
        assert_eq!(sidecar.identity(), Some((4201, 130072)));
        assert_eq!(sidecar.model_type.as_deref(), Some("Checkpoint"));

        assert!(!apply_metadata(&mut sidecar, &matched(), false));

        assert!(apply_metadata(&mut sidecar, &matched(), true));
        assert_eq!(
            sidecar.extra_str(ACTIVATION_TEXT_KEY),
            Some("analog style, film")
        );
    }
}
