use parking_lot::{Mutex, RwLock};
use preview_core::{DocumentId, Workspace};
use rpc::RpcClient;
use serde_json::json;
use std::collections::HashMap;
use std::path::{Path, PathBuf};

/// [`Workspace`] backed by the editor on the other end of stdio.
///
/// The editor announces workspace folders and pushes the text of every open
/// document, so reading a document never needs a round trip.
#[derive(Debug)]
pub struct EditorWorkspace {
    client: RpcClient,
    roots: RwLock<Vec<PathBuf>>,
    texts: Mutex<HashMap<DocumentId, String>>,
}

impl EditorWorkspace {
    pub fn new(client: RpcClient) -> Self {
        Self {
            client,
            roots: RwLock::new(Vec::new()),
            texts: Mutex::new(HashMap::new()),
        }
    }

    pub fn add_root(&self, root: PathBuf) {
        let mut roots = self.roots.write();
        if !roots.contains(&root) {
            tracing::debug!(root = %root.display(), "Workspace folder added");
            roots.push(root);
        }
    }

    pub fn record_text(&self, document: DocumentId, text: String) {
        self.texts.lock().insert(document, text);
    }

    pub fn forget_text(&self, document: &DocumentId) {
        self.texts.lock().remove(document);
    }

    pub fn show_information(&self, message: &str) {
        if let Err(err) = self
            .client
            .notify("window/showInformation", json!({ "message": message }))
        {
            tracing::error!(?err, "Failed to notify the editor");
        }
    }
}

#[async_trait::async_trait]
impl Workspace for EditorWorkspace {
    fn workspace_root(&self, document: &DocumentId) -> Option<PathBuf> {
        // Nested folders: the innermost one owns the document.
        self.roots
            .read()
            .iter()
            .filter(|root| document.path().starts_with(root))
            .max_by_key(|root| root.components().count())
            .cloned()
    }

    async fn read_file(&self, path: &Path) -> std::io::Result<Vec<u8>> {
        tokio::fs::read(path).await
    }

    async fn document_text(&self, document: &DocumentId) -> Option<String> {
        let recorded = self.texts.lock().get(document).cloned();
        if recorded.is_some() {
            return recorded;
        }
        tokio::fs::read_to_string(document.path()).await.ok()
    }

    fn show_warning(&self, message: &str) {
        if let Err(err) = self
            .client
            .notify("window/showWarning", json!({ "message": message }))
        {
            tracing::error!(?err, "Failed to notify the editor");
        }
    }
}
