use super::*;
use crate::assets::LocalAssetResolver;
use crate::channel::RenderSurface;
use crate::error::ChannelError;
use crate::protocol::OutboundMessage;
use crate::watcher::{ChangeKind, TargetKind};
use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver};
use tokio::sync::oneshot;

#[derive(Debug)]
struct FakeView {
    options: ViewOptions,
    titles: Mutex<Vec<String>>,
    contents: Mutex<Vec<String>>,
    posted: Mutex<Vec<OutboundMessage>>,
    reveals: AtomicUsize,
    disposed: AtomicBool,
}

impl RenderSurface for Arc<FakeView> {
    fn set_title(&self, title: &str) {
        self.titles.lock().push(title.to_string());
    }
    fn set_resource_root(&self, _root: &Path) {}
    fn set_content(&self, html: String) -> ContentRevision {
        let mut contents = self.contents.lock();
        contents.push(html);
        contents.len() as ContentRevision
    }
    fn post_message(&self, message: &OutboundMessage) -> Result<(), ChannelError> {
        self.posted.lock().push(message.clone());
        Ok(())
    }
    fn reveal(&self) {
        self.reveals.fetch_add(1, Ordering::SeqCst);
    }
    fn dispose(&self) {
        self.disposed.store(true, Ordering::SeqCst);
    }
    fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::SeqCst)
    }
}

#[derive(Default)]
struct FakeViewFactory {
    views: Mutex<Vec<Arc<FakeView>>>,
}

impl FakeViewFactory {
    fn created(&self) -> usize {
        self.views.lock().len()
    }

    fn last(&self) -> Arc<FakeView> {
        self.views.lock().last().cloned().expect("No view created")
    }
}

impl ViewFactory for FakeViewFactory {
    fn create_view(
        &self,
        options: ViewOptions,
        _events: ViewEventSender,
    ) -> Result<Box<dyn RenderSurface>, ChannelError> {
        let view = Arc::new(FakeView {
            options,
            titles: Mutex::new(Vec::new()),
            contents: Mutex::new(Vec::new()),
            posted: Mutex::new(Vec::new()),
            reveals: AtomicUsize::new(0),
            disposed: AtomicBool::new(false),
        });
        self.views.lock().push(view.clone());
        Ok(Box::new(view))
    }
}

/// Holds the next `read_file` until released.
struct Gate {
    entered: oneshot::Sender<()>,
    release: oneshot::Receiver<()>,
}

#[derive(Default)]
struct FakeWorkspace {
    roots: Mutex<Vec<PathBuf>>,
    texts: Mutex<HashMap<DocumentId, String>>,
    warnings: Mutex<Vec<String>>,
    gate: Mutex<Option<Gate>>,
}

impl FakeWorkspace {
    /// Gates the next file read, returns the handles to observe and release it.
    fn gate_next_read(&self) -> (oneshot::Receiver<()>, oneshot::Sender<()>) {
        let (entered_tx, entered_rx) = oneshot::channel();
        let (release_tx, release_rx) = oneshot::channel();
        *self.gate.lock() = Some(Gate {
            entered: entered_tx,
            release: release_rx,
        });
        (entered_rx, release_tx)
    }
}

#[async_trait::async_trait]
impl Workspace for FakeWorkspace {
    fn workspace_root(&self, document: &DocumentId) -> Option<PathBuf> {
        self.roots
            .lock()
            .iter()
            .find(|root| document.path().starts_with(root))
            .cloned()
    }

    async fn read_file(&self, path: &Path) -> std::io::Result<Vec<u8>> {
        let gate = self.gate.lock().take();
        if let Some(Gate { entered, release }) = gate {
            let _ = entered.send(());
            let _ = release.await;
        }
        tokio::fs::read(path).await
    }

    async fn document_text(&self, document: &DocumentId) -> Option<String> {
        self.texts.lock().get(document).cloned()
    }

    fn show_warning(&self, message: &str) {
        self.warnings.lock().push(message.to_string());
    }
}

struct Harness {
    manager: SessionManager,
    workspace: Arc<FakeWorkspace>,
    views: Arc<FakeViewFactory>,
    _watch_rx: UnboundedReceiver<WatchEvent>,
    _view_rx: UnboundedReceiver<(SessionId, ViewEvent)>,
}

impl Harness {
    fn new() -> Self {
        let workspace = Arc::new(FakeWorkspace::default());
        let views = Arc::new(FakeViewFactory::default());
        let (watch_tx, watch_rx) = unbounded_channel();
        let (view_tx, view_rx) = unbounded_channel();
        let manager = SessionManager::new(
            Collaborators {
                workspace: workspace.clone(),
                views: views.clone(),
                resolver: Arc::new(LocalAssetResolver::default()),
            },
            WatcherRegistry::new(watch_tx),
            view_tx,
            ManagerOptions::default(),
        );
        Self {
            manager,
            workspace,
            views,
            _watch_rx: watch_rx,
            _view_rx: view_rx,
        }
    }

    fn add_root(&self, root: &Path) {
        self.workspace.roots.lock().push(root.to_path_buf());
    }

    async fn open(&self, path: &Path, text: &str) {
        self.manager
            .request_preview(markdown(path, text), PreviewMode::Open)
            .await;
    }

    fn session(&self) -> SessionSnapshot {
        self.manager.snapshot().expect("No active session")
    }

    /// Reports ready for the content the view currently shows.
    fn ready(&self) {
        let session = self.session();
        let revision = session.content_revision.expect("No content loaded");
        self.manager
            .on_inbound_message(session.id, revision, InboundMessage::Ready);
    }

    fn live_handles(&self) -> usize {
        self.manager.registry().live_handles()
    }
}

fn markdown(path: &Path, text: &str) -> Document {
    Document::new(DocumentId::new(path), Some("markdown".into()), text)
}

fn update(text: &str) -> OutboundMessage {
    OutboundMessage::Update { text: text.into() }
}

/// Creates a workspace root with a configuration file and the assets it names.
fn workspace_with_config(config: &str, assets: &[&str]) -> tempfile::TempDir {
    let root = tempfile::tempdir().unwrap();
    let config_path = root.path().join(DEFAULT_CONFIG_FILE_NAME);
    std::fs::create_dir_all(config_path.parent().unwrap()).unwrap();
    std::fs::write(&config_path, config).unwrap();
    for asset in assets {
        std::fs::write(root.path().join(asset), "/* asset */").unwrap();
    }
    root
}

fn config_event(snapshot: &SessionSnapshot, root: &Path) -> WatchEvent {
    WatchEvent {
        set_id: snapshot.watch_set_id.unwrap(),
        path: root.join(DEFAULT_CONFIG_FILE_NAME),
        target: TargetKind::Config,
        change: ChangeKind::Modified,
    }
}

#[tokio::test]
async fn test_single_session_is_reused() {
    let harness = Harness::new();
    let dir = tempfile::tempdir().unwrap();

    harness.open(&dir.path().join("a.md"), "a").await;
    harness.open(&dir.path().join("b.md"), "b").await;
    harness
        .manager
        .request_preview(markdown(&dir.path().join("c.md"), "c"), PreviewMode::Follow)
        .await;

    assert_eq!(harness.views.created(), 1);
    let view = harness.views.last();
    assert_eq!(view.options.title, "Markdown-it Preview: a.md");
    assert_eq!(
        *view.titles.lock(),
        vec![
            "Markdown-it Preview: b.md".to_string(),
            "Markdown-it Preview: c.md".to_string()
        ]
    );
    assert_eq!(view.contents.lock().len(), 3);
    assert_eq!(harness.session().document, DocumentId::new(dir.path().join("c.md")));
}

#[tokio::test]
async fn test_follow_without_session_does_nothing() {
    let harness = Harness::new();
    harness
        .manager
        .request_preview(markdown(Path::new("/w/a.md"), "a"), PreviewMode::Follow)
        .await;
    assert_eq!(harness.views.created(), 0);
    assert!(harness.manager.snapshot().is_none());
}

#[tokio::test]
async fn test_only_latest_edit_is_sent_on_ready() {
    let harness = Harness::new();
    let path = Path::new("/w/a.md");
    harness.open(path, "initial").await;

    let id = DocumentId::new(path);
    harness.manager.on_document_changed(&id, "E1".into());
    harness.manager.on_document_changed(&id, "E2".into());
    harness.manager.on_document_changed(&id, "E3".into());
    assert_eq!(harness.session().pending_text.as_deref(), Some("E3"));

    harness.ready();

    assert_eq!(*harness.views.last().posted.lock(), vec![update("E3")]);
    assert_eq!(harness.session().pending_text, None);
}

#[tokio::test]
async fn test_ready_flushes_pending_text_exactly_once() {
    let harness = Harness::new();
    let path = Path::new("/w/a.md");
    harness.open(path, "").await;
    harness
        .manager
        .on_document_changed(&DocumentId::new(path), "# hi".into());

    harness.ready();
    harness.ready();

    let session = harness.session();
    assert_eq!(session.state, SessionState::Active { ready: true });
    assert_eq!(session.pending_text, None);
    assert_eq!(*harness.views.last().posted.lock(), vec![update("# hi")]);
    assert_eq!(
        serde_json::to_string(&update("# hi")).unwrap(),
        r##"{"type":"update","text":"# hi"}"##
    );
}

#[tokio::test]
async fn test_edits_after_ready_are_sent_immediately() {
    let harness = Harness::new();
    let path = Path::new("/w/a.md");
    harness.open(path, "").await;
    harness.ready();

    let id = DocumentId::new(path);
    harness.manager.on_document_changed(&id, "one".into());
    harness
        .manager
        .on_document_changed(&DocumentId::new("/w/other.md"), "ignored".into());
    harness.manager.on_document_changed(&id, "two".into());

    assert_eq!(
        *harness.views.last().posted.lock(),
        vec![update("one"), update("two")]
    );
}

#[tokio::test]
async fn test_retarget_replaces_watch_set() {
    let harness = Harness::new();
    let root_a = workspace_with_config(r#"{"css": ["a.css"]}"#, &["a.css"]);
    let root_b = workspace_with_config(
        r#"{"css": ["x.css", "y.css"], "js": ["z.js"]}"#,
        &["x.css", "y.css", "z.js"],
    );
    harness.add_root(root_a.path());
    harness.add_root(root_b.path());

    let doc_a = root_a.path().join("a.md");
    let doc_b = root_b.path().join("b.md");

    harness.open(&doc_a, "a").await;
    let before = harness.session();
    assert_eq!(before.watch_targets.len(), 2);
    assert_eq!(harness.live_handles(), 2);
    assert_eq!(before.base, root_a.path());

    harness.manager.on_document_changed(&DocumentId::new(&doc_a), "stale".into());
    harness.open(&doc_b, "b").await;

    let after = harness.session();
    assert_eq!(after.id, before.id);
    assert_ne!(after.watch_set_id, before.watch_set_id);
    assert_eq!(after.watch_targets.len(), 4);
    assert_eq!(harness.live_handles(), 4);
    assert_eq!(after.base, root_b.path());
    assert_eq!(after.state, SessionState::Active { ready: false });
    assert_eq!(after.pending_text, None);
    assert!(after.generation > before.generation);

    harness.ready();
    harness.manager.on_document_changed(&DocumentId::new(&doc_a), "from a".into());
    harness.manager.on_document_changed(&DocumentId::new(&doc_b), "from b".into());
    assert_eq!(*harness.views.last().posted.lock(), vec![update("from b")]);
}

#[tokio::test]
async fn test_focus_on_same_document_only_reveals() {
    let harness = Harness::new();
    let path = Path::new("/w/a.md");
    harness.open(path, "a").await;
    harness.ready();
    let before = harness.session();
    let view = harness.views.last();
    let reveals = view.reveals.load(Ordering::SeqCst);

    harness.open(path, "a").await;

    assert_eq!(harness.session(), before);
    assert_eq!(view.reveals.load(Ordering::SeqCst), reveals + 1);
    assert_eq!(view.contents.lock().len(), 1);
    assert_eq!(harness.views.created(), 1);
}

#[tokio::test]
async fn test_ineligible_document_is_ignored() {
    let harness = Harness::new();
    let notes = Document::new(DocumentId::new("/w/notes.txt"), Some("plaintext".into()), "x");
    harness.manager.request_preview(notes, PreviewMode::Open).await;

    assert_eq!(harness.views.created(), 0);
    assert!(harness.manager.snapshot().is_none());
    assert_eq!(harness.live_handles(), 0);
}

#[tokio::test]
async fn test_configured_extension_is_accepted() {
    let harness = Harness::new();
    let root = workspace_with_config(r#"{"fileExtensions": ["txt"]}"#, &[]);
    harness.add_root(root.path());

    let notes = Document::new(
        DocumentId::new(root.path().join("notes.txt")),
        Some("plaintext".into()),
        "x",
    );
    harness.manager.request_preview(notes, PreviewMode::Open).await;

    assert_eq!(harness.views.created(), 1);
}

#[tokio::test]
async fn test_view_closed_disposes_session() {
    let harness = Harness::new();
    let root = workspace_with_config(r#"{"css": ["a.css"]}"#, &["a.css"]);
    harness.add_root(root.path());
    harness.open(&root.path().join("a.md"), "a").await;
    let session = harness.session();
    assert_eq!(harness.live_handles(), 2);

    harness.manager.on_view_closed(session.id);

    assert!(harness.manager.snapshot().is_none());
    assert_eq!(harness.live_handles(), 0);
    assert!(harness.views.last().is_disposed());

    // A new request creates a fresh session with a new identity.
    harness.open(&root.path().join("a.md"), "a").await;
    assert_eq!(harness.views.created(), 2);
    assert!(harness.session().id > session.id);
}

#[tokio::test]
async fn test_events_of_stale_sessions_are_ignored() {
    let harness = Harness::new();
    let path = Path::new("/w/a.md");
    harness.open(path, "a").await;
    let first = harness.session().id;
    harness.manager.on_view_closed(first);
    harness.open(path, "a").await;
    let second = harness.session();

    harness
        .manager
        .on_inbound_message(first, 1, InboundMessage::Ready);
    harness.manager.on_view_closed(first);

    assert_eq!(harness.session(), second);
    assert_eq!(second.state, SessionState::Active { ready: false });
}

#[tokio::test]
async fn test_refresh_reloads_config_and_restarts_handshake() {
    let harness = Harness::new();
    let root = workspace_with_config(r#"{"css": ["a.css"]}"#, &["a.css", "b.css"]);
    harness.add_root(root.path());
    let path = root.path().join("a.md");
    let id = DocumentId::new(&path);
    harness.workspace.texts.lock().insert(id.clone(), "latest".into());

    harness.open(&path, "a").await;
    harness.ready();
    let before = harness.session();

    std::fs::write(
        root.path().join(DEFAULT_CONFIG_FILE_NAME),
        r#"{"css": ["a.css", "b.css"]}"#,
    )
    .unwrap();
    harness
        .manager
        .on_config_or_asset_event(config_event(&before, root.path()))
        .await;

    let after = harness.session();
    assert_eq!(after.state, SessionState::Active { ready: false });
    assert_ne!(after.watch_set_id, before.watch_set_id);
    assert_eq!(after.watch_targets.len(), 3);
    assert_eq!(harness.live_handles(), 3);

    let view = harness.views.last();
    let contents = view.contents.lock();
    assert_eq!(contents.len(), 2);
    assert!(contents[1].contains("/assets/b.css"));
    assert!(contents[1].contains("latest"));

    // Edits during the new handshake are buffered again.
    drop(contents);
    harness.manager.on_document_changed(&id, "typed".into());
    assert!(view.posted.lock().is_empty());
}

#[tokio::test]
async fn test_ready_queued_before_refresh_does_not_complete_new_handshake() {
    let harness = Harness::new();
    let root = workspace_with_config(r#"{"css": ["a.css"]}"#, &["a.css"]);
    harness.add_root(root.path());
    let path = root.path().join("a.md");
    let id = DocumentId::new(&path);

    harness.open(&path, "a").await;
    harness.ready();
    let before = harness.session();
    let stale_revision = before.content_revision.unwrap();

    harness
        .manager
        .on_config_or_asset_event(config_event(&before, root.path()))
        .await;
    let after = harness.session();
    assert_ne!(after.content_revision, before.content_revision);

    // The page of the replaced content reported ready before it was replaced.
    harness
        .manager
        .on_inbound_message(after.id, stale_revision, InboundMessage::Ready);
    assert_eq!(harness.session().state, SessionState::Active { ready: false });

    let view = harness.views.last();
    harness.manager.on_document_changed(&id, "typed".into());
    assert!(view.posted.lock().is_empty());
    assert_eq!(harness.session().pending_text.as_deref(), Some("typed"));

    harness.ready();
    assert_eq!(*view.posted.lock(), vec![update("typed")]);
}

#[tokio::test]
async fn test_asset_change_keeps_unchanged_watch_set() {
    let harness = Harness::new();
    let root = workspace_with_config(r#"{"css": ["a.css"]}"#, &["a.css"]);
    harness.add_root(root.path());
    harness.open(&root.path().join("a.md"), "a").await;
    let before = harness.session();

    let event = WatchEvent {
        set_id: before.watch_set_id.unwrap(),
        path: root.path().join("a.css"),
        target: TargetKind::Asset,
        change: ChangeKind::Modified,
    };
    harness.manager.on_config_or_asset_event(event).await;

    let after = harness.session();
    assert_eq!(after.watch_set_id, before.watch_set_id);
    assert_eq!(harness.views.last().contents.lock().len(), 2);
}

#[tokio::test]
async fn test_events_of_replaced_watch_sets_are_ignored() {
    let harness = Harness::new();
    let root = workspace_with_config("{}", &[]);
    harness.add_root(root.path());
    harness.open(&root.path().join("a.md"), "a").await;
    let session = harness.session();

    let mut event = config_event(&session, root.path());
    event.set_id += 100;
    harness.manager.on_config_or_asset_event(event).await;

    assert_eq!(harness.views.last().contents.lock().len(), 1);
}

#[tokio::test]
async fn test_dispose_during_refresh_config_read() {
    let harness = Harness::new();
    let root = workspace_with_config(r#"{"css": ["a.css"]}"#, &["a.css"]);
    harness.add_root(root.path());
    harness.open(&root.path().join("a.md"), "a").await;
    let session = harness.session();
    let view = harness.views.last();

    let (entered, release) = harness.workspace.gate_next_read();
    let manager = harness.manager.clone();
    let event = WatchEvent {
        set_id: session.watch_set_id.unwrap(),
        path: root.path().join("a.css"),
        target: TargetKind::Asset,
        change: ChangeKind::Modified,
    };
    let refresh = tokio::spawn(async move { manager.on_config_or_asset_event(event).await });

    entered.await.unwrap();
    harness.manager.on_view_closed(session.id);
    release.send(()).unwrap();
    refresh.await.unwrap();

    assert!(harness.manager.snapshot().is_none());
    assert_eq!(harness.live_handles(), 0);
    assert_eq!(view.contents.lock().len(), 1);
    assert!(view.posted.lock().is_empty());
}

#[tokio::test]
async fn test_slow_request_is_superseded_by_newer_one() {
    let harness = Harness::new();
    let root = workspace_with_config("{}", &[]);
    harness.add_root(root.path());

    let (entered, release) = harness.workspace.gate_next_read();
    let manager = harness.manager.clone();
    let slow_doc = root.path().join("slow.md");
    let slow = tokio::spawn(async move {
        manager
            .request_preview(markdown(&slow_doc, "slow"), PreviewMode::Open)
            .await
    });

    entered.await.unwrap();
    harness.open(&root.path().join("fast.md"), "fast").await;
    release.send(()).unwrap();
    slow.await.unwrap();

    assert_eq!(harness.views.created(), 1);
    assert_eq!(
        harness.session().document,
        DocumentId::new(root.path().join("fast.md"))
    );
    assert_eq!(harness.views.last().contents.lock().len(), 1);
}

#[tokio::test]
async fn test_edit_during_open_config_read_reaches_first_content() {
    let harness = Harness::new();
    let root = workspace_with_config("{}", &[]);
    harness.add_root(root.path());
    let path = root.path().join("a.md");
    let id = DocumentId::new(&path);

    let (entered, release) = harness.workspace.gate_next_read();
    let manager = harness.manager.clone();
    let doc = path.clone();
    let open = tokio::spawn(async move {
        manager
            .request_preview(markdown(&doc, "OLD_TEXT"), PreviewMode::Open)
            .await
    });

    entered.await.unwrap();
    harness.workspace.texts.lock().insert(id.clone(), "NEW_TEXT".into());
    harness.manager.on_document_changed(&id, "NEW_TEXT".into());
    release.send(()).unwrap();
    open.await.unwrap();

    let view = harness.views.last();
    {
        let contents = view.contents.lock();
        assert_eq!(contents.len(), 1);
        assert!(contents[0].contains("NEW_TEXT"));
        assert!(!contents[0].contains("OLD_TEXT"));
    }

    harness.ready();
    assert!(view.posted.lock().is_empty());
}

#[tokio::test]
async fn test_missing_external_scripts_warn() {
    let harness = Harness::new();
    let root = workspace_with_config(r#"{"npmUrls": ["https://cdn.example.com/x.js"]}"#, &[]);
    harness.add_root(root.path());
    harness.open(&root.path().join("a.md"), "a").await;
    let id = harness.session().id;
    let revision = harness.session().content_revision.unwrap();

    let globals = |loaded: bool| InboundMessage::Globals {
        globals: BTreeMap::from([("x".to_string(), serde_json::Value::Bool(loaded))]),
    };

    harness.manager.on_inbound_message(id, revision, globals(false));
    assert_eq!(harness.workspace.warnings.lock().len(), 1);

    harness.manager.on_inbound_message(id, revision, globals(true));
    assert_eq!(harness.workspace.warnings.lock().len(), 1);
}

#[tokio::test]
async fn test_no_warning_without_external_scripts() {
    let harness = Harness::new();
    harness.open(Path::new("/w/a.md"), "a").await;
    let id = harness.session().id;

    harness.manager.on_inbound_message(
        id,
        1,
        InboundMessage::Globals {
            globals: BTreeMap::new(),
        },
    );
    harness.manager.on_inbound_message(
        id,
        1,
        InboundMessage::Log {
            level: "warn".into(),
            message: "from page".into(),
        },
    );
    assert!(harness.workspace.warnings.lock().is_empty());
}

#[tokio::test]
async fn test_should_open_on_open() {
    let harness = Harness::new();
    let root = workspace_with_config(r#"{"fileExtension": ".mdx"}"#, &[]);
    harness.add_root(root.path());

    let mdx = Document::new(DocumentId::new(root.path().join("page.mdx")), None, "");
    let md = Document::new(DocumentId::new(root.path().join("page.md")), None, "");
    let outside = markdown(Path::new("/elsewhere/readme.md"), "");

    assert!(harness.manager.should_open_on_open(&mdx).await);
    assert!(!harness.manager.should_open_on_open(&md).await);
    assert!(!harness.manager.should_open_on_open(&outside).await);
}

#[tokio::test]
async fn test_shutdown_releases_session() {
    let harness = Harness::new();
    let root = workspace_with_config(r#"{"js": ["a.js"]}"#, &["a.js"]);
    harness.add_root(root.path());
    harness.open(&root.path().join("a.md"), "a").await;
    assert_eq!(harness.live_handles(), 2);

    harness.manager.shutdown();

    assert!(harness.manager.snapshot().is_none());
    assert_eq!(harness.live_handles(), 0);
    assert!(harness.views.last().is_disposed());
}
