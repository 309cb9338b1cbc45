//! Document identity and the preview acceptance rule.
//!
//! A document is identified by its absolute path. Whether it may be previewed
//! depends on its language id and, failing that, on its file extension checked
//! against the extensions allowed by the workspace configuration.

use crate::config::PreviewConfig;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Language id the editor reports for markdown buffers.
pub const MARKDOWN_LANGUAGE_ID: &str = "markdown";

/// Extensions previewed when the workspace configures none.
pub const DEFAULT_EXTENSIONS: &[&str] = &[".md", ".markdown"];

/// Stable identity of a text document.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DocumentId(PathBuf);

impl DocumentId {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self(path.into())
    }

    pub fn path(&self) -> &Path {
        &self.0
    }

    /// File name used in the view title, empty if the path has none.
    pub fn file_name(&self) -> String {
        self.0
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_default()
    }

    /// Directory containing the document, used as the asset base when the
    /// document lives outside any workspace.
    pub fn parent_dir(&self) -> PathBuf {
        self.0
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("."))
    }

    /// Lowercased extension including the leading dot.
    ///
    /// # Examples
    ///
    /// ```
    /// use preview_core::DocumentId;
    ///
    /// assert_eq!(DocumentId::new("/notes/README.MD").extension(), Some(".md".to_string()));
    /// assert_eq!(DocumentId::new("/notes/Makefile").extension(), None);
    /// ```
    pub fn extension(&self) -> Option<String> {
        self.0
            .extension()
            .and_then(|ext| ext.to_str())
            .filter(|ext| !ext.is_empty())
            .map(|ext| format!(".{}", ext.to_ascii_lowercase()))
    }
}

impl std::fmt::Display for DocumentId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0.display())
    }
}

/// A document as handed over by the editor: identity, language and full text.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Document {
    pub id: DocumentId,
    pub language_id: Option<String>,
    pub text: String,
}

impl Document {
    pub fn new(id: DocumentId, language_id: Option<String>, text: impl Into<String>) -> Self {
        Self {
            id,
            language_id,
            text: text.into(),
        }
    }

    /// Returns `true` if this document may be previewed under `config`.
    ///
    /// Markdown buffers are always accepted, anything else must carry one of
    /// the allowed extensions.
    pub fn is_eligible(&self, config: &PreviewConfig) -> bool {
        if self.language_id.as_deref() == Some(MARKDOWN_LANGUAGE_ID) {
            return true;
        }
        let Some(ext) = self.id.extension() else {
            return false;
        };
        config.allowed_extensions().iter().any(|allowed| *allowed == ext)
    }
}
