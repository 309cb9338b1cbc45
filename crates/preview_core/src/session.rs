//! The preview session state machine.
//!
//! A session binds one document to one rendering surface. It moves from
//! [`SessionState::Initializing`] to [`SessionState::Active`] once the view
//! got its first content and ends in [`SessionState::Disposed`]. Every full
//! content replacement (first load, re-target, refresh) restarts the
//! readiness handshake: until the page reports `ready`, edits are buffered in
//! a single slot where the latest text wins. Only a `ready` of the content
//! currently shown completes the handshake.
//!
//! All methods are synchronous; the [`crate::SessionManager`] calls them with
//! the session validated and never across an await point.

use crate::channel::{ContentRevision, MessageChannel, SessionId};
use crate::config::{ConfigScope, PreviewConfig};
use crate::document::DocumentId;
use crate::protocol::OutboundMessage;
use crate::watcher::{WatchSet, WatchSetId, WatchTarget, WatcherRegistry};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// The view exists but has no content yet.
    Initializing,
    /// The view shows the document; `ready` once the page finished its handshake.
    Active { ready: bool },
    Disposed,
}

/// Routes edits of exactly one document to the session.
#[derive(Debug)]
pub struct DocumentSubscription {
    document: DocumentId,
}

impl DocumentSubscription {
    fn new(document: DocumentId) -> Self {
        tracing::trace!(%document, "Subscribed to document changes");
        Self { document }
    }

    pub fn matches(&self, document: &DocumentId) -> bool {
        self.document == *document
    }
}

impl Drop for DocumentSubscription {
    fn drop(&mut self) {
        tracing::trace!(document = %self.document, "Disposed document subscription");
    }
}

/// Content and watch set a session switches to on a re-target.
pub struct Retarget {
    pub document: DocumentId,
    pub scope: ConfigScope,
    pub config: PreviewConfig,
    pub title: String,
    pub html: String,
    pub targets: Vec<WatchTarget>,
}

#[derive(Debug)]
pub struct PreviewSession {
    id: SessionId,
    channel: MessageChannel,
    document: DocumentId,
    scope: ConfigScope,
    config: PreviewConfig,
    state: SessionState,
    content_revision: Option<ContentRevision>,
    pending_text: Option<String>,
    watchers: Option<WatchSet>,
    subscription: Option<DocumentSubscription>,
}

impl PreviewSession {
    pub fn new(
        id: SessionId,
        channel: MessageChannel,
        document: DocumentId,
        scope: ConfigScope,
        config: PreviewConfig,
    ) -> Self {
        Self {
            id,
            channel,
            document,
            scope,
            config,
            state: SessionState::Initializing,
            content_revision: None,
            pending_text: None,
            watchers: None,
            subscription: None,
        }
    }

    pub fn id(&self) -> SessionId {
        self.id
    }

    pub fn document(&self) -> &DocumentId {
        &self.document
    }

    pub fn scope(&self) -> &ConfigScope {
        &self.scope
    }

    pub fn config(&self) -> &PreviewConfig {
        &self.config
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn is_ready(&self) -> bool {
        matches!(self.state, SessionState::Active { ready: true })
    }

    /// Revision of the content last handed to the view.
    pub fn content_revision(&self) -> Option<ContentRevision> {
        self.content_revision
    }

    pub fn pending_text(&self) -> Option<&str> {
        self.pending_text.as_deref()
    }

    pub fn watch_set_id(&self) -> Option<WatchSetId> {
        self.watchers.as_ref().map(WatchSet::id)
    }

    pub fn watch_targets(&self) -> Vec<WatchTarget> {
        self.watchers
            .iter()
            .flat_map(|set| set.targets().cloned())
            .collect()
    }

    pub fn reveal(&self) {
        self.channel.reveal();
    }

    /// Sends a full content replacement and restarts the handshake.
    pub fn load_content(&mut self, html: String) {
        if self.state == SessionState::Disposed {
            return;
        }
        self.content_revision = self.channel.replace_content(html);
        self.state = SessionState::Active { ready: false };
        self.pending_text = None;
    }

    /// Replaces the watch set, disposing the previous one first.
    pub fn install_watchers(&mut self, registry: &WatcherRegistry, targets: Vec<WatchTarget>) {
        if let Some(previous) = self.watchers.take() {
            registry.dispose_all(previous);
        }
        self.watchers = Some(registry.install(targets));
    }

    pub fn subscribe(&mut self) {
        self.subscription.take();
        self.subscription = Some(DocumentSubscription::new(self.document.clone()));
    }

    pub fn is_subscribed_to(&self, document: &DocumentId) -> bool {
        self.subscription
            .as_ref()
            .is_some_and(|subscription| subscription.matches(document))
    }

    /// Switches the session to another document.
    ///
    /// The old subscription and watch set go first, then the view gets the
    /// new document as full content, then the new watch set and subscription
    /// are installed. Text buffered for the old document is discarded.
    pub fn retarget(&mut self, registry: &WatcherRegistry, retarget: Retarget) {
        let Retarget {
            document,
            scope,
            config,
            title,
            html,
            targets,
        } = retarget;

        tracing::debug!(
            session_id = self.id,
            from = %self.document,
            to = %document,
            "Re-targeting preview session"
        );

        self.subscription.take();
        if let Some(previous) = self.watchers.take() {
            registry.dispose_all(previous);
        }

        self.document = document;
        self.config = config;
        self.scope = scope;
        self.channel.retitle(&title, self.scope.base());
        self.load_content(html);

        self.install_watchers(registry, targets);
        self.subscribe();
    }

    /// Re-sends the full content of the same document.
    ///
    /// With a reloaded configuration the watch set is replaced when the
    /// derived targets differ from the installed ones.
    pub fn refresh(
        &mut self,
        registry: &WatcherRegistry,
        html: String,
        reloaded: Option<(PreviewConfig, Vec<WatchTarget>)>,
    ) {
        tracing::debug!(session_id = self.id, document = %self.document, "Refreshing preview content");

        let new_targets = match reloaded {
            Some((config, targets)) => {
                self.config = config;
                (targets != self.watch_targets()).then_some(targets)
            }
            None => None,
        };

        self.load_content(html);

        if let Some(targets) = new_targets {
            self.install_watchers(registry, targets);
        }
    }

    /// Handles a text change of `document`.
    ///
    /// Returns `true` if an update was sent right away.
    pub fn on_edit(&mut self, document: &DocumentId, text: String) -> bool {
        if !self.is_subscribed_to(document) {
            return false;
        }
        match self.state {
            SessionState::Active { ready: true } => {
                self.channel.post(OutboundMessage::Update { text })
            }
            SessionState::Initializing | SessionState::Active { ready: false } => {
                tracing::trace!(session_id = self.id, "View not ready, buffered update");
                self.pending_text = Some(text);
                false
            }
            SessionState::Disposed => false,
        }
    }

    /// Completes the handshake of content `revision`, flushing the buffered
    /// text if any.
    ///
    /// A ready of replaced content is ignored.
    pub fn mark_ready(&mut self, revision: ContentRevision) {
        let SessionState::Active { ready } = self.state else {
            tracing::debug!(session_id = self.id, state = ?self.state, "Ignoring ready outside active state");
            return;
        };
        if self.content_revision != Some(revision) {
            tracing::debug!(
                session_id = self.id,
                revision,
                current = ?self.content_revision,
                "Ignoring ready of replaced content"
            );
            return;
        }
        if ready {
            tracing::debug!(session_id = self.id, "View reported ready twice");
        }
        self.state = SessionState::Active { ready: true };
        if let Some(text) = self.pending_text.take() {
            self.channel.post(OutboundMessage::Update { text });
        }
    }

    /// Releases the subscription, the watch set and the view.
    pub fn dispose(&mut self, registry: &WatcherRegistry) {
        if self.state == SessionState::Disposed {
            return;
        }
        self.subscription.take();
        if let Some(watchers) = self.watchers.take() {
            registry.dispose_all(watchers);
        }
        self.pending_text = None;
        self.channel.close();
        self.state = SessionState::Disposed;
    }
}
