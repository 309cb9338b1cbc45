use crate::document::DocumentId;
use std::path::{Path, PathBuf};

/// Host primitives the session manager depends on.
///
/// Reads are asynchronous and are the only points where a session handler
/// yields, see [`crate::SessionManager`] for what that implies.
#[async_trait::async_trait]
pub trait Workspace: Send + Sync + 'static {
    /// Root of the workspace folder containing the document, if any.
    fn workspace_root(&self, document: &DocumentId) -> Option<PathBuf>;

    async fn read_file(&self, path: &Path) -> std::io::Result<Vec<u8>>;

    /// Current full text of the document, `None` if it can not be retrieved.
    async fn document_text(&self, document: &DocumentId) -> Option<String>;

    /// Shows an advisory warning to the user.
    fn show_warning(&self, message: &str);
}
