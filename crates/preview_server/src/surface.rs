//! Rendering surface backed by a browser page.
//!
//! Each view runs its own local HTTP server. The page is served at
//! `/r/<revision>/`, where the revision is bumped on every content
//! replacement; connected pages are told to reload and anything a page of an
//! older revision posts is dropped. The page reaches the host over a websocket
//! at `/r/<revision>/ws` and loads local assets from `/assets/`, served from
//! the view's resource root only.

use axum::extract::ws::{Message as WsMessage, WebSocket, WebSocketUpgrade};
use axum::extract::{Path as UrlPath, State};
use axum::http::{header, StatusCode};
use axum::response::{Html, IntoResponse, Redirect, Response};
use axum::routing::get;
use axum::Router;
use futures::stream::SplitSink;
use futures::{SinkExt, StreamExt};
use parking_lot::Mutex;
use preview_core::assets::normalize_relative;
use preview_core::{
    ChannelError, ContentRevision, InboundMessage, OutboundMessage, RenderSurface, ViewEvent,
    ViewEventSender, ViewFactory, ViewOptions,
};
use serde::Serialize;
use std::net::{Ipv4Addr, SocketAddr};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::sync::{broadcast, oneshot};

/// Frames pushed to connected pages.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "camelCase")]
enum Frame {
    Update { text: String },
    Reload,
    Focus,
    Title { title: String },
}

#[derive(Debug, Clone)]
pub struct SurfaceOptions {
    /// Port of the preview server, `0` picks a free one.
    pub port: u16,
    pub open_browser: bool,
    /// How long no page may be connected before the view counts as closed.
    pub close_grace: Duration,
}

impl From<&preview_config::PreviewSettings> for SurfaceOptions {
    fn from(settings: &preview_config::PreviewSettings) -> Self {
        Self {
            port: settings.port,
            open_browser: settings.open_browser,
            close_grace: settings.close_grace(),
        }
    }
}

#[derive(Debug)]
struct PageContent {
    revision: ContentRevision,
    html: String,
    title: String,
    resource_root: PathBuf,
}

/// State shared by the view and the HTTP handlers.
#[derive(Debug)]
struct Page {
    content: Mutex<PageContent>,
    /// Taken on dispose, which ends every websocket.
    frames: Mutex<Option<broadcast::Sender<Frame>>>,
    events: ViewEventSender,
    close_grace: Duration,
    connected: AtomicUsize,
    /// Total number of connections ever made.
    connections: AtomicU64,
    disposed: AtomicBool,
}

impl Page {
    fn new(options: ViewOptions, events: ViewEventSender, close_grace: Duration) -> Self {
        let (frames, _) = broadcast::channel(64);
        Self {
            content: Mutex::new(PageContent {
                revision: 0,
                html: String::new(),
                title: options.title,
                resource_root: options.resource_root,
            }),
            frames: Mutex::new(Some(frames)),
            events,
            close_grace,
            connected: AtomicUsize::new(0),
            connections: AtomicU64::new(0),
            disposed: AtomicBool::new(false),
        }
    }

    fn revision(&self) -> ContentRevision {
        self.content.lock().revision
    }

    fn title(&self) -> String {
        self.content.lock().title.clone()
    }

    fn resource_root(&self) -> PathBuf {
        self.content.lock().resource_root.clone()
    }

    /// Stores new content, returns its revision.
    fn replace_content(&self, html: String) -> ContentRevision {
        let mut content = self.content.lock();
        content.revision += 1;
        content.html = html;
        content.revision
    }

    fn subscribe(&self) -> Option<broadcast::Receiver<Frame>> {
        self.frames.lock().as_ref().map(broadcast::Sender::subscribe)
    }

    /// Returns the number of pages the frame was queued for.
    fn broadcast(&self, frame: Frame) -> Result<usize, ChannelError> {
        let frames = self.frames.lock();
        let sender = frames.as_ref().ok_or(ChannelError::Disposed)?;
        sender.send(frame).map_err(|_| ChannelError::NotConnected)
    }

    fn on_page_message(&self, revision: ContentRevision, raw: &str) {
        let current = self.revision();
        if revision != current {
            tracing::trace!(revision, current, "Dropping message of a replaced page");
            return;
        }
        match InboundMessage::parse(raw) {
            Ok(message) => {
                self.events.send(ViewEvent::Message { revision, message });
            }
            Err(err) => {
                tracing::debug!(?err, raw, "Ignoring unknown page message");
            }
        }
    }

    fn on_connect(&self) {
        self.connected.fetch_add(1, Ordering::SeqCst);
        self.connections.fetch_add(1, Ordering::SeqCst);
    }

    /// Reports the view as closed if no page reconnects within the grace period.
    fn on_disconnect(self: &Arc<Self>) {
        let remaining = self.connected.fetch_sub(1, Ordering::SeqCst).saturating_sub(1);
        if remaining > 0 || self.disposed.load(Ordering::SeqCst) {
            return;
        }

        let epoch = self.connections.load(Ordering::SeqCst);
        let page = self.clone();
        tokio::spawn(async move {
            tokio::time::sleep(page.close_grace).await;
            if page.connected.load(Ordering::SeqCst) == 0
                && page.connections.load(Ordering::SeqCst) == epoch
                && !page.disposed.load(Ordering::SeqCst)
            {
                tracing::debug!(session_id = page.events.session_id(), "No page connected, preview closed");
                page.events.send(ViewEvent::Closed);
            }
        });
    }

    fn dispose(&self) {
        self.disposed.store(true, Ordering::SeqCst);
        self.frames.lock().take();
    }
}

fn router(page: Arc<Page>) -> Router {
    Router::new()
        .route("/", get(index))
        .route("/r/:revision/", get(page_html))
        .route("/r/:revision/ws", get(ws_handler))
        .route("/assets/*path", get(asset))
        .with_state(page)
}

async fn index(State(page): State<Arc<Page>>) -> Redirect {
    Redirect::temporary(&format!("/r/{}/", page.revision()))
}

async fn page_html(State(page): State<Arc<Page>>, UrlPath(revision): UrlPath<u64>) -> Response {
    let html = {
        let content = page.content.lock();
        (content.revision == revision).then(|| content.html.clone())
    };
    match html {
        Some(html) => ([(header::CACHE_CONTROL, "no-store")], Html(html)).into_response(),
        None => Redirect::temporary("/").into_response(),
    }
}

async fn ws_handler(
    ws: WebSocketUpgrade,
    State(page): State<Arc<Page>>,
    UrlPath(revision): UrlPath<u64>,
) -> Response {
    ws.on_upgrade(move |socket| handle_socket(socket, revision, page))
}

async fn asset(State(page): State<Arc<Page>>, UrlPath(path): UrlPath<String>) -> Response {
    let Some(relative) = normalize_relative(path.trim_start_matches('/')) else {
        tracing::debug!(path, "Rejected asset path");
        return StatusCode::NOT_FOUND.into_response();
    };
    let file = page.resource_root().join(relative);
    match tokio::fs::read(&file).await {
        Ok(bytes) => (
            [
                (header::CONTENT_TYPE, content_type(&file)),
                (header::CACHE_CONTROL, "no-store"),
            ],
            bytes,
        )
            .into_response(),
        Err(err) => {
            tracing::debug!(?err, file = %file.display(), "Asset not readable");
            StatusCode::NOT_FOUND.into_response()
        }
    }
}

fn content_type(path: &Path) -> &'static str {
    let ext = path
        .extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| ext.to_ascii_lowercase());
    match ext.as_deref() {
        Some("css") => "text/css; charset=utf-8",
        Some("js" | "mjs") => "text/javascript; charset=utf-8",
        Some("json") => "application/json",
        Some("html" | "htm") => "text/html; charset=utf-8",
        Some("svg") => "image/svg+xml",
        Some("png") => "image/png",
        Some("jpg" | "jpeg") => "image/jpeg",
        Some("gif") => "image/gif",
        Some("woff") => "font/woff",
        Some("woff2") => "font/woff2",
        Some("ttf") => "font/ttf",
        _ => "application/octet-stream",
    }
}

async fn send_frame(
    sink: &mut SplitSink<WebSocket, WsMessage>,
    frame: &Frame,
) -> Result<(), axum::Error> {
    let text = serde_json::to_string(frame).map_err(axum::Error::new)?;
    sink.send(WsMessage::Text(text)).await
}

async fn handle_socket(socket: WebSocket, revision: ContentRevision, page: Arc<Page>) {
    let Some(mut frames) = page.subscribe() else {
        return;
    };

    page.on_connect();
    tracing::debug!(revision, "Page connected");

    let (mut sink, mut stream) = socket.split();

    let title = Frame::Title { title: page.title() };
    if send_frame(&mut sink, &title).await.is_ok() {
        loop {
            tokio::select! {
                frame = frames.recv() => match frame {
                    Ok(frame) => {
                        if matches!(frame, Frame::Update { .. }) && page.revision() != revision {
                            continue;
                        }
                        if send_frame(&mut sink, &frame).await.is_err() {
                            break;
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        tracing::warn!(revision, "Page lagged by {n} frames");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                },
                incoming = stream.next() => match incoming {
                    Some(Ok(WsMessage::Text(text))) => page.on_page_message(revision, &text),
                    Some(Ok(WsMessage::Close(_))) | None => break,
                    Some(Ok(_)) => {}
                    Some(Err(err)) => {
                        tracing::debug!(?err, "Websocket error");
                        break;
                    }
                },
            }
        }
    }

    let _ = sink.send(WsMessage::Close(None)).await;
    tracing::debug!(revision, "Page disconnected");
    page.on_disconnect();
}

/// A preview view shown in the browser.
pub struct BrowserView {
    page: Arc<Page>,
    addr: SocketAddr,
    handle: Handle,
    open_browser: AtomicBool,
    shutdown_tx: Mutex<Option<oneshot::Sender<()>>>,
}

impl BrowserView {
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    fn open_in_browser(&self) {
        let url = format!("http://{}/", self.addr);
        self.handle.spawn_blocking(move || {
            if let Err(err) = webbrowser::open(&url) {
                tracing::error!(?err, url, "Failed to open the preview in the browser");
            }
        });
    }
}

impl RenderSurface for BrowserView {
    fn set_title(&self, title: &str) {
        self.page.content.lock().title = title.to_string();
        let _ = self.page.broadcast(Frame::Title {
            title: title.to_string(),
        });
    }

    fn set_resource_root(&self, root: &Path) {
        self.page.content.lock().resource_root = root.to_path_buf();
    }

    fn set_content(&self, html: String) -> ContentRevision {
        let revision = self.page.replace_content(html);
        tracing::debug!(revision, addr = %self.addr, "Preview content replaced");
        let _ = self.page.broadcast(Frame::Reload);

        // Only open the page once it has something to show.
        if self.open_browser.swap(false, Ordering::SeqCst) {
            self.open_in_browser();
        }

        revision
    }

    fn post_message(&self, message: &OutboundMessage) -> Result<(), ChannelError> {
        if self.page.disposed.load(Ordering::SeqCst) {
            return Err(ChannelError::Disposed);
        }
        let frame = match message {
            OutboundMessage::Update { text } => Frame::Update { text: text.clone() },
        };
        self.page.broadcast(frame).map(|_| ())
    }

    fn reveal(&self) {
        let _ = self.page.broadcast(Frame::Focus);
    }

    fn dispose(&self) {
        self.page.dispose();
        if let Some(shutdown_tx) = self.shutdown_tx.lock().take() {
            let _ = shutdown_tx.send(());
            tracing::debug!(addr = %self.addr, "Sent shutdown signal to preview server");
        }
    }

    fn is_disposed(&self) -> bool {
        self.page.disposed.load(Ordering::SeqCst)
    }
}

/// Creates a [`BrowserView`] per preview session.
#[derive(Debug, Clone)]
pub struct BrowserViewFactory {
    options: SurfaceOptions,
    handle: Handle,
}

impl BrowserViewFactory {
    pub fn new(options: SurfaceOptions, handle: Handle) -> Self {
        Self { options, handle }
    }

    pub fn create_browser_view(
        &self,
        options: ViewOptions,
        events: ViewEventSender,
    ) -> Result<BrowserView, ChannelError> {
        let listener = std::net::TcpListener::bind((Ipv4Addr::LOCALHOST, self.options.port))
            .map_err(ChannelError::Bind)?;
        listener.set_nonblocking(true).map_err(ChannelError::Bind)?;
        let addr = listener.local_addr().map_err(ChannelError::Bind)?;

        let listener = {
            let _guard = self.handle.enter();
            tokio::net::TcpListener::from_std(listener).map_err(ChannelError::Bind)?
        };

        let session_id = events.session_id();
        let page = Arc::new(Page::new(options, events, self.options.close_grace));
        let app = router(page.clone());
        let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();

        self.handle.spawn(async move {
            tracing::debug!(session_id, %addr, "Preview server listening");
            let server = axum::serve(listener, app.into_make_service()).with_graceful_shutdown(
                async move {
                    let _ = shutdown_rx.await;
                },
            );
            if let Err(err) = server.await {
                tracing::error!(?err, session_id, "Preview server failed");
            }
            tracing::debug!(session_id, "Preview server exited");
        });

        Ok(BrowserView {
            page,
            addr,
            handle: self.handle.clone(),
            open_browser: AtomicBool::new(self.options.open_browser),
            shutdown_tx: Mutex::new(Some(shutdown_tx)),
        })
    }
}

impl ViewFactory for BrowserViewFactory {
    fn create_view(
        &self,
        options: ViewOptions,
        events: ViewEventSender,
    ) -> Result<Box<dyn RenderSurface>, ChannelError> {
        Ok(Box::new(self.create_browser_view(options, events)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::Request;
    use preview_core::SessionId;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver};
    use tower::ServiceExt;

    fn new_page(
        root: &Path,
        close_grace: Duration,
    ) -> (Arc<Page>, UnboundedReceiver<(SessionId, ViewEvent)>) {
        let (tx, rx) = unbounded_channel();
        let page = Page::new(
            ViewOptions {
                title: "Markdown-it Preview: a.md".into(),
                resource_root: root.to_path_buf(),
            },
            ViewEventSender::new(3, tx),
            close_grace,
        );
        (Arc::new(page), rx)
    }

    async fn fetch(app: Router, uri: &str) -> Response {
        app.oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
            .await
            .unwrap()
    }

    async fn body_string(response: Response) -> String {
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        String::from_utf8(bytes.to_vec()).unwrap()
    }

    #[tokio::test]
    async fn test_index_redirects_to_current_revision() {
        let dir = tempfile::tempdir().unwrap();
        let (page, _rx) = new_page(dir.path(), Duration::from_secs(3));
        page.replace_content("<p>one</p>".into());
        page.replace_content("<p>two</p>".into());

        let response = fetch(router(page.clone()), "/").await;
        assert_eq!(response.status(), StatusCode::TEMPORARY_REDIRECT);
        assert_eq!(response.headers()[header::LOCATION], "/r/2/");

        let response = fetch(router(page.clone()), "/r/2/").await;
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body_string(response).await, "<p>two</p>");

        let response = fetch(router(page), "/r/1/").await;
        assert_eq!(response.status(), StatusCode::TEMPORARY_REDIRECT);
        assert_eq!(response.headers()[header::LOCATION], "/");
    }

    #[tokio::test]
    async fn test_assets_are_served_from_resource_root_only() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().join("root");
        std::fs::create_dir_all(root.join("styles")).unwrap();
        std::fs::write(root.join("styles/my theme.css"), "body {}").unwrap();
        std::fs::write(dir.path().join("secret.txt"), "secret").unwrap();
        let (page, _rx) = new_page(&root, Duration::from_secs(3));

        let response = fetch(router(page.clone()), "/assets/styles/my%20theme.css").await;
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            response.headers()[header::CONTENT_TYPE],
            "text/css; charset=utf-8"
        );
        assert_eq!(body_string(response).await, "body {}");

        let response = fetch(router(page.clone()), "/assets/..%2Fsecret.txt").await;
        assert_eq!(response.status(), StatusCode::NOT_FOUND);

        let response = fetch(router(page), "/assets/missing.js").await;
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_messages_of_replaced_pages_are_dropped() {
        let dir = tempfile::tempdir().unwrap();
        let (page, mut rx) = new_page(dir.path(), Duration::from_secs(3));
        page.replace_content("one".into());
        page.replace_content("two".into());

        page.on_page_message(1, r#"{"type": "ready"}"#);
        page.on_page_message(2, r#"{"type": "scroll", "top": 3}"#);
        page.on_page_message(2, r#"{"type": "ready"}"#);

        assert_eq!(
            rx.recv().await,
            Some((
                3,
                ViewEvent::Message {
                    revision: 2,
                    message: InboundMessage::Ready
                }
            ))
        );
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_closed_after_grace_period_without_pages() {
        let dir = tempfile::tempdir().unwrap();
        let (page, mut rx) = new_page(dir.path(), Duration::from_millis(20));

        page.on_connect();
        page.on_disconnect();

        let event = tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .expect("Timed out waiting for closure");
        assert_eq!(event, Some((3, ViewEvent::Closed)));
    }

    #[tokio::test]
    async fn test_reconnect_within_grace_period_keeps_view_open() {
        let dir = tempfile::tempdir().unwrap();
        let (page, mut rx) = new_page(dir.path(), Duration::from_millis(50));

        page.on_connect();
        page.on_disconnect();
        page.on_connect();

        let waited = tokio::time::timeout(Duration::from_millis(300), rx.recv()).await;
        assert!(waited.is_err());
    }

    #[test]
    fn test_frames_match_page_protocol() {
        assert_eq!(
            serde_json::to_string(&Frame::Update {
                text: "# hi".into()
            })
            .unwrap(),
            r##"{"type":"update","text":"# hi"}"##
        );
        assert_eq!(
            serde_json::to_string(&Frame::Reload).unwrap(),
            r#"{"type":"reload"}"#
        );
    }

    #[tokio::test]
    async fn test_browser_view_lifecycle() {
        let dir = tempfile::tempdir().unwrap();
        let factory = BrowserViewFactory::new(
            SurfaceOptions {
                port: 0,
                open_browser: false,
                close_grace: Duration::from_secs(3),
            },
            Handle::current(),
        );
        let (tx, _rx) = unbounded_channel();
        let view = factory
            .create_browser_view(
                ViewOptions {
                    title: "Markdown-it Preview: a.md".into(),
                    resource_root: dir.path().to_path_buf(),
                },
                ViewEventSender::new(1, tx),
            )
            .unwrap();

        view.set_content("<p>hello</p>".into());

        let update = OutboundMessage::Update { text: "x".into() };
        assert!(matches!(
            view.post_message(&update),
            Err(ChannelError::NotConnected)
        ));

        let mut stream = tokio::net::TcpStream::connect(view.addr()).await.unwrap();
        stream
            .write_all(b"GET / HTTP/1.1\r\nHost: localhost\r\n\r\n")
            .await
            .unwrap();
        let mut response = Vec::new();
        let mut buf = [0u8; 1024];
        while !response.windows(4).any(|w| w == b"\r\n\r\n") {
            let n = tokio::time::timeout(Duration::from_secs(5), stream.read(&mut buf))
                .await
                .unwrap()
                .unwrap();
            assert!(n > 0, "Connection closed before the response headers");
            response.extend_from_slice(&buf[..n]);
        }
        let response = String::from_utf8_lossy(&response).to_ascii_lowercase();
        assert!(response.starts_with("http/1.1 307"));
        assert!(response.contains("location: /r/1/"));

        view.dispose();
        assert!(view.is_disposed());
        assert!(matches!(
            view.post_message(&update),
            Err(ChannelError::Disposed)
        ));
    }
}
