//! Local model library: sidecars, scanning and metadata completion.

mod index;
mod metadata;
mod sidecar;

pub use index::{
    Identification, IndexedModel, LocalModelIndex, ModelFile, ScanItem, ScanOptions, ScanReport,
    UnidentifiedReason,
};
pub use metadata::{
    activation_text, apply_metadata, clean_description, normalize_base_model, preview_url,
    CompletionOptions, CompletionStatus, MetadataCompleter, ACTIVATION_TEXT_KEY,
    DESCRIPTION_KEY, SD_VERSION_KEY,
};
pub use sidecar::{FileRecord, HashCacheEntry, Sidecar};
