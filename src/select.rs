//! Image and server-type selection.
//!
//! Both algorithms are deterministic over their candidate lists: stable
//! sorts, no randomness, errors instead of guesses. Server-side filtering
//! (architecture, label selector) has already happened by the time these run.

use std::sync::LazyLock;

use regex::Regex;
use thiserror::Error;
use tracing::debug;

use crate::provider::{
    CloudProvider, ImageCandidate, ImageRef, ProviderError, ServerTypeCandidate,
};

/// Prefix marking an image selector as a label selector.
pub const LABEL_SELECTOR_PREFIX: &str = "label#";

/// Suffix selecting the newest image whose name contains the rest.
const LATEST_IMAGE_SUFFIX: &str = ":latest";

/// Sentinel server-type selector that triggers automatic selection.
pub const AUTO_SERVER_TYPE: &str = "auto";

/// CPU class automatic selection is restricted to.
const SHARED_CPU_KIND: &str = "shared";

static DIGIT_RUN: LazyLock<Regex> = LazyLock::new(|| {
    #[expect(clippy::expect_used, reason = "pattern is a compile-time constant")]
    Regex::new(r"\d+").expect("digit run pattern must compile")
});

/// Errors raised by the selection algorithms.
#[derive(Debug, Error)]
pub enum SelectError {
    /// No image survived filtering for the selector.
    #[error("no images found for selector {0:?}")]
    ImageNotFound(String),
    /// The explicitly named server type does not exist.
    #[error("server type {0:?} not found")]
    ServerTypeNotFound(String),
    /// No datacenter matches the requested location.
    #[error("no datacenters found for location {0}")]
    LocationNotFound(String),
    /// The matching datacenter offers no server types.
    #[error("no server types available in {0}")]
    NoServerTypes(String),
    /// No server type matches the architecture and CPU-class filters.
    #[error("no server type found for architecture {0:?}")]
    NoMatchingServerType(String),
    /// Catalog lookups failed.
    #[error(transparent)]
    Provider(#[from] ProviderError),
}

/// Returns whether `selector` uses the label-selector grammar.
#[must_use]
pub fn is_label_selector(selector: &str) -> bool {
    selector.starts_with(LABEL_SELECTOR_PREFIX)
}

/// Extracts the label expression from a label selector, when present.
#[must_use]
pub fn label_expression(selector: &str) -> Option<&str> {
    selector.strip_prefix(LABEL_SELECTOR_PREFIX)
}

/// Maps a provider architecture string to the tag used in requests and boot
/// configuration. Unknown values fall back to `amd64`; this never fails.
#[must_use]
pub fn architecture_tag(provider_architecture: &str) -> &'static str {
    match provider_architecture {
        "arm" => "arm64",
        _ => "amd64",
    }
}

/// Extracts the numeric classification from a server-type name: the first
/// run of digits, or the empty string when the name has none.
#[must_use]
pub fn classification(server_type_name: &str) -> &str {
    DIGIT_RUN
        .find(server_type_name)
        .map_or("", |found| found.as_str())
}

/// Selects one image from `candidates` according to `selector`.
///
/// Three mutually exclusive grammars, in priority order: label selector
/// (newest creation time wins), `:latest` suffix (name-contains filter,
/// highest OS-version string wins), exact name match.
///
/// # Errors
///
/// Returns [`SelectError::ImageNotFound`] when nothing survives filtering.
pub fn select_image(
    mut candidates: Vec<ImageCandidate>,
    selector: &str,
) -> Result<ImageRef, SelectError> {
    let filtered: Vec<ImageCandidate> = if is_label_selector(selector) {
        // Candidates arrive pre-filtered by label server-side.
        candidates.sort_by(|lhs, rhs| rhs.created.cmp(&lhs.created));
        candidates
    } else if let Some(name_prefix) = selector.strip_suffix(LATEST_IMAGE_SUFFIX) {
        let mut matching: Vec<ImageCandidate> = candidates
            .into_iter()
            .filter(|image| image.name.contains(name_prefix))
            .collect();
        matching.sort_by(|lhs, rhs| rhs.os_version.cmp(&lhs.os_version));
        matching
    } else {
        candidates
            .into_iter()
            .filter(|image| image.name == selector)
            .collect()
    };

    filtered
        .into_iter()
        .next()
        .map(|image| ImageRef {
            id: image.id,
            name: image.name,
        })
        .ok_or_else(|| SelectError::ImageNotFound(selector.to_owned()))
}

/// Automatically selects a server type for `architecture` in `location`:
/// shared-CPU offerings of the first matching datacenter, sorted descending
/// by classification, middle element picked (`len / 2`, integer division — a
/// deliberate mid-tier heuristic, preserved exactly).
///
/// # Errors
///
/// Returns [`SelectError`] when the location, its offerings, or a matching
/// candidate cannot be found.
pub async fn auto_server_type<P: CloudProvider + ?Sized>(
    provider: &P,
    architecture: &str,
    location: &str,
) -> Result<ServerTypeCandidate, SelectError> {
    let references = available_server_types_by_location(provider, location).await?;

    let mut resolved = Vec::with_capacity(references.len());
    for id in references {
        if let Some(server_type) = provider.server_type_by_id(id).await? {
            resolved.push(server_type);
        }
    }

    let mut candidates: Vec<ServerTypeCandidate> = resolved
        .into_iter()
        .filter(|server_type| {
            architecture_tag(&server_type.architecture) == architecture
                && server_type.cpu_kind == SHARED_CPU_KIND
        })
        .collect();
    if candidates.is_empty() {
        return Err(SelectError::NoMatchingServerType(architecture.to_owned()));
    }

    candidates.sort_by(|lhs, rhs| classification(&rhs.name).cmp(classification(&lhs.name)));
    debug!(
        candidates = ?candidates.iter().map(|c| c.name.clone()).collect::<Vec<_>>(),
        "automatic server type candidates"
    );

    #[expect(
        clippy::integer_division,
        reason = "the mid-tier heuristic is defined as floor(n/2)"
    )]
    let middle = candidates.len() / 2;
    candidates
        .into_iter()
        .nth(middle)
        .ok_or_else(|| SelectError::NoMatchingServerType(architecture.to_owned()))
}

async fn available_server_types_by_location<P: CloudProvider + ?Sized>(
    provider: &P,
    location: &str,
) -> Result<Vec<i64>, SelectError> {
    let datacenters = provider.list_datacenters().await?;
    let matching = datacenters
        .into_iter()
        .find(|datacenter| datacenter.location == location)
        .ok_or_else(|| SelectError::LocationNotFound(location.to_owned()))?;

    if matching.available_server_types.is_empty() {
        return Err(SelectError::NoServerTypes(location.to_owned()));
    }
    Ok(matching.available_server_types)
}
