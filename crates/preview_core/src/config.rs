//! Per-workspace preview configuration.
//!
//! The configuration is a JSON object stored at a fixed location under the
//! workspace root. A missing or malformed file is never an error for the
//! preview, it simply yields [`PreviewConfig::default`]. Keys holding a value
//! of the wrong JSON type are ignored one by one.

use crate::document::{DocumentId, DEFAULT_EXTENSIONS};
use crate::error::PreviewError;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Deserializer, Serialize};
use std::path::{Path, PathBuf};

/// Location of the configuration file relative to the workspace root.
pub const DEFAULT_CONFIG_FILE_NAME: &str = ".vscode/markdown-it-custom-preview.json";

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PreviewConfig {
    /// Single extension allowed besides markdown buffers.
    #[serde(default, deserialize_with = "lenient", skip_serializing_if = "Option::is_none")]
    pub file_extension: Option<String>,
    /// Allowed extensions, takes precedence over `file_extension`.
    #[serde(default, deserialize_with = "lenient", skip_serializing_if = "Option::is_none")]
    pub file_extensions: Option<Vec<String>>,
    /// Stylesheets relative to the base location.
    #[serde(default, deserialize_with = "lenient")]
    pub css: Vec<String>,
    /// Extra scripts relative to the base location.
    #[serde(default, deserialize_with = "lenient")]
    pub js: Vec<String>,
    /// External scripts injected verbatim.
    #[serde(default, deserialize_with = "lenient")]
    pub npm_urls: Vec<String>,
    /// External scripts injected as ES modules.
    #[serde(default, deserialize_with = "lenient")]
    pub module_urls: Vec<String>,
    /// Module invoked with the markdown-it instance once it is created.
    #[serde(default, deserialize_with = "lenient", skip_serializing_if = "Option::is_none")]
    pub initializer: Option<String>,
    /// Opaque options forwarded to markdown-it.
    #[serde(default, deserialize_with = "lenient", skip_serializing_if = "Option::is_none")]
    pub options: Option<serde_json::Value>,
}

/// Deserializes a field, falling back to its default on a type mismatch.
fn lenient<'de, D, T>(deserializer: D) -> Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: DeserializeOwned + Default,
{
    let value = serde_json::Value::deserialize(deserializer)?;
    Ok(serde_json::from_value(value).unwrap_or_default())
}

fn normalize_extension(ext: &str) -> String {
    let ext = ext.trim().to_ascii_lowercase();
    if ext.starts_with('.') {
        ext
    } else {
        format!(".{ext}")
    }
}

impl PreviewConfig {
    pub fn from_slice(bytes: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(bytes)
    }

    /// Lowercased extensions (with leading dot) eligible for preview.
    pub fn allowed_extensions(&self) -> Vec<String> {
        let configured: Vec<&str> = match (&self.file_extensions, &self.file_extension) {
            (Some(list), _) => list.iter().map(String::as_str).collect(),
            (None, Some(single)) => vec![single.as_str()],
            (None, None) => DEFAULT_EXTENSIONS.to_vec(),
        };
        configured.into_iter().map(normalize_extension).collect()
    }

    /// Whether the page is expected to load scripts from outside the workspace.
    pub fn has_external_urls(&self) -> bool {
        !self.npm_urls.is_empty() || !self.module_urls.is_empty()
    }

    /// Local asset paths the page loads: stylesheets, scripts and the initializer.
    pub fn local_asset_paths(&self) -> impl Iterator<Item = &str> {
        self.css
            .iter()
            .chain(self.js.iter())
            .chain(self.initializer.iter())
            .map(String::as_str)
    }

    /// Options serialized for the page, `{}` when none are configured.
    pub fn options_json(&self) -> String {
        match &self.options {
            Some(options) if !options.is_null() => options.to_string(),
            _ => "{}".to_string(),
        }
    }
}

/// Reads and parses a configuration file synchronously.
///
/// The session manager goes through [`crate::Workspace::read_file`] instead;
/// this is for one-shot commands.
pub fn read_config_file(path: &Path) -> Result<PreviewConfig, PreviewError> {
    let bytes = std::fs::read(path).map_err(|source| PreviewError::ReadFile {
        path: path.to_path_buf(),
        source,
    })?;
    Ok(PreviewConfig::from_slice(&bytes)?)
}

/// Where a document's configuration and assets are resolved from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConfigScope {
    base: PathBuf,
    config_file: Option<PathBuf>,
}

impl ConfigScope {
    /// Documents inside a workspace resolve against its root and read its
    /// configuration file, others resolve against their own directory and
    /// have no configuration.
    pub fn resolve(
        document: &DocumentId,
        workspace_root: Option<&Path>,
        config_file_name: &Path,
    ) -> Self {
        match workspace_root {
            Some(root) => Self {
                base: root.to_path_buf(),
                config_file: Some(root.join(config_file_name)),
            },
            None => Self {
                base: document.parent_dir(),
                config_file: None,
            },
        }
    }

    pub fn base(&self) -> &Path {
        &self.base
    }

    pub fn config_file(&self) -> Option<&Path> {
        self.config_file.as_deref()
    }
}
