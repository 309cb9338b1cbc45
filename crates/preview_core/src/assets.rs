//! Resolving configured asset paths.
//!
//! Asset paths in the configuration are relative to the session's base
//! location. Resolving one yields the file on disk (to watch it) and the URI
//! the rendering surface loads it from. A path that can not be resolved is
//! skipped, it never fails the whole asset set.

use crate::config::{ConfigScope, PreviewConfig};
use crate::watcher::{TargetKind, WatchTarget};
use percent_encoding::{utf8_percent_encode, AsciiSet, NON_ALPHANUMERIC};
use std::path::{Component, Path, PathBuf};

/// Characters kept verbatim in a URI path segment.
const SEGMENT: &AsciiSet = &NON_ALPHANUMERIC
    .remove(b'-')
    .remove(b'_')
    .remove(b'.')
    .remove(b'~');

/// Route prefix the browser surface serves local assets under.
pub const ASSET_ROUTE_PREFIX: &str = "/assets";

/// An asset path resolved against a base location.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedAsset {
    /// File on disk.
    pub path: PathBuf,
    /// URI the rendering surface loads the asset from.
    pub uri: String,
}

/// Maps a relative asset path to something the rendering surface can load.
///
/// Implementations must be pure: the same input always resolves the same way.
pub trait AssetResolver: Send + Sync + 'static {
    fn resolve(&self, base: &Path, relative: &str) -> Option<ResolvedAsset>;
}

/// Resolves assets to routes on the local preview server.
#[derive(Debug, Clone)]
pub struct LocalAssetResolver {
    prefix: String,
}

impl Default for LocalAssetResolver {
    fn default() -> Self {
        Self::new(ASSET_ROUTE_PREFIX)
    }
}

impl LocalAssetResolver {
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into().trim_end_matches('/').to_string(),
        }
    }
}

impl AssetResolver for LocalAssetResolver {
    fn resolve(&self, base: &Path, relative: &str) -> Option<ResolvedAsset> {
        let relative = normalize_relative(relative)?;
        let encoded = relative
            .components()
            .filter_map(|component| match component {
                Component::Normal(segment) => Some(segment.to_string_lossy()),
                _ => None,
            })
            .map(|segment| utf8_percent_encode(&segment, SEGMENT).to_string())
            .collect::<Vec<_>>()
            .join("/");
        Some(ResolvedAsset {
            path: base.join(&relative),
            uri: format!("{}/{encoded}", self.prefix),
        })
    }
}

/// Normalizes a relative asset path, rejecting anything that could escape
/// the base location.
///
/// # Examples
///
/// ```
/// use preview_core::assets::normalize_relative;
/// use std::path::PathBuf;
///
/// assert_eq!(normalize_relative("./css/a.css"), Some(PathBuf::from("css/a.css")));
/// assert_eq!(normalize_relative("../secret.css"), None);
/// assert_eq!(normalize_relative("/etc/passwd"), None);
/// ```
pub fn normalize_relative(relative: &str) -> Option<PathBuf> {
    let relative = relative.trim();
    if relative.is_empty() {
        return None;
    }
    let mut normalized = PathBuf::new();
    for component in Path::new(relative).components() {
        match component {
            Component::Normal(segment) => normalized.push(segment),
            Component::CurDir => {}
            Component::ParentDir | Component::RootDir | Component::Prefix(_) => return None,
        }
    }
    if normalized.as_os_str().is_empty() {
        None
    } else {
        Some(normalized)
    }
}

/// Files a session watches: the configuration file and every local asset.
pub fn watch_targets(
    scope: &ConfigScope,
    config: &PreviewConfig,
    resolver: &dyn AssetResolver,
) -> Vec<WatchTarget> {
    let mut targets = Vec::new();
    if let Some(config_file) = scope.config_file() {
        targets.push(WatchTarget::new(config_file, TargetKind::Config));
    }
    for relative in config.local_asset_paths() {
        match resolver.resolve(scope.base(), relative) {
            Some(asset) => targets.push(WatchTarget::new(asset.path, TargetKind::Asset)),
            None => tracing::debug!(relative, "Skipping unresolvable asset path"),
        }
    }
    targets
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::document::DocumentId;

    #[test]
    fn test_resolve_encodes_segments() {
        let resolver = LocalAssetResolver::default();
        let asset = resolver
            .resolve(Path::new("/work"), "styles/my theme.css")
            .unwrap();
        assert_eq!(asset.path, PathBuf::from("/work/styles/my theme.css"));
        assert_eq!(asset.uri, "/assets/styles/my%20theme.css");
    }

    #[test]
    fn test_resolve_rejects_escaping_paths() {
        let resolver = LocalAssetResolver::new("/files/");
        assert!(resolver.resolve(Path::new("/work"), "a/../../b.css").is_none());
        assert!(resolver.resolve(Path::new("/work"), "").is_none());
        assert!(resolver.resolve(Path::new("/work"), ".").is_none());
        assert_eq!(
            resolver.resolve(Path::new("/work"), "./a.js").unwrap().uri,
            "/files/a.js"
        );
    }

    #[test]
    fn test_watch_targets_skip_bad_paths() {
        let config = PreviewConfig::from_slice(
            br#"{"css": ["a.css", "../outside.css"], "js": ["b.js"], "initializer": "init.js"}"#,
        )
        .unwrap();
        let scope = ConfigScope::resolve(
            &DocumentId::new("/work/readme.md"),
            Some(Path::new("/work")),
            Path::new("cfg.json"),
        );
        let targets = watch_targets(&scope, &config, &LocalAssetResolver::default());
        assert_eq!(
            targets,
            vec![
                WatchTarget::new("/work/cfg.json", TargetKind::Config),
                WatchTarget::new("/work/a.css", TargetKind::Asset),
                WatchTarget::new("/work/b.js", TargetKind::Asset),
                WatchTarget::new("/work/init.js", TargetKind::Asset),
            ]
        );
    }

    #[test]
    fn test_no_config_target_outside_workspace() {
        let scope = ConfigScope::resolve(
            &DocumentId::new("/tmp/notes.md"),
            None,
            Path::new("cfg.json"),
        );
        let targets = watch_targets(
            &scope,
            &PreviewConfig::default(),
            &LocalAssetResolver::default(),
        );
        assert!(targets.is_empty());
    }
}
