pub mod check;
pub mod scaffold;
pub mod serve;

use anyhow::{Context, Result};
use preview_core::config::read_config_file;
use preview_core::{ConfigScope, Document, DocumentId, PreviewConfig, PreviewError};
use std::path::{Path, PathBuf};

/// A document on disk together with the configuration it would be previewed with.
#[derive(Debug)]
struct DocumentContext {
    document: Document,
    scope: ConfigScope,
    config: PreviewConfig,
}

impl DocumentContext {
    fn load(file: &Path, workspace_root: Option<&Path>) -> Result<Self> {
        let path = file
            .canonicalize()
            .with_context(|| format!("{} not found", file.display()))?;
        let text = std::fs::read_to_string(&path)
            .with_context(|| format!("failed to read {}", path.display()))?;
        let document = Document::new(DocumentId::new(path), None, text);

        let workspace_root = workspace_root.map(canonical_or_given);
        let config_file_name = preview_config::config().preview.config_file_name();
        let scope = ConfigScope::resolve(&document.id, workspace_root.as_deref(), &config_file_name);

        let config = match scope.config_file() {
            Some(config_file) => match read_config_file(config_file) {
                Ok(config) => config,
                Err(PreviewError::ReadFile { source, .. })
                    if source.kind() == std::io::ErrorKind::NotFound =>
                {
                    PreviewConfig::default()
                }
                Err(err) => {
                    tracing::warn!(?err, "Using the default preview config");
                    PreviewConfig::default()
                }
            },
            None => PreviewConfig::default(),
        };

        Ok(Self {
            document,
            scope,
            config,
        })
    }
}

fn canonical_or_given(path: &Path) -> PathBuf {
    path.canonicalize().unwrap_or_else(|_| path.to_path_buf())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_load_document_context() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().canonicalize().unwrap();
        std::fs::create_dir_all(root.join(".vscode")).unwrap();
        std::fs::write(
            root.join(".vscode/markdown-it-custom-preview.json"),
            r#"{"fileExtension": ".mdx", "css": ["a.css"]}"#,
        )
        .unwrap();
        std::fs::write(root.join("notes.mdx"), "# notes").unwrap();

        let context = DocumentContext::load(&root.join("notes.mdx"), Some(&root)).unwrap();
        assert_eq!(context.document.text, "# notes");
        assert_eq!(context.scope.base(), root.as_path());
        assert!(context.document.is_eligible(&context.config));

        let context = DocumentContext::load(&root.join("notes.mdx"), None).unwrap();
        assert!(context.scope.config_file().is_none());
        assert!(!context.document.is_eligible(&context.config));

        assert!(DocumentContext::load(&root.join("missing.md"), None).is_err());
    }
}
