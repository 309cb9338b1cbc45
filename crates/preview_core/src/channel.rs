//! Rendering surface abstraction and the message channel on top of it.
//!
//! A [`RenderSurface`] is the sandboxed, script-capable view showing the
//! preview. The host reaches it by replacing its content or posting
//! [`OutboundMessage`]s, the view answers asynchronously through
//! [`ViewEvent`]s tagged with the session that owns it. Page messages also
//! carry the revision of the content that posted them. Delivery is ordered
//! within each direction and best effort: a failed post is logged and
//! forgotten.

use crate::error::ChannelError;
use crate::protocol::{InboundMessage, OutboundMessage};
use std::path::{Path, PathBuf};
use tokio::sync::mpsc::UnboundedSender;

/// Identity of a preview session, never reused within a process.
pub type SessionId = u64;

/// Identifies one content of a view, increasing with every replacement.
pub type ContentRevision = u64;

/// Events a rendering surface reports back to the host.
#[derive(Debug, Clone, PartialEq)]
pub enum ViewEvent {
    /// A message posted by the page showing content `revision`.
    Message {
        revision: ContentRevision,
        message: InboundMessage,
    },
    /// The view was closed by the user.
    Closed,
}

/// Sender handed to a view so it can report back to the session owning it.
#[derive(Debug, Clone)]
pub struct ViewEventSender {
    session_id: SessionId,
    tx: UnboundedSender<(SessionId, ViewEvent)>,
}

impl ViewEventSender {
    pub fn new(session_id: SessionId, tx: UnboundedSender<(SessionId, ViewEvent)>) -> Self {
        Self { session_id, tx }
    }

    pub fn session_id(&self) -> SessionId {
        self.session_id
    }

    /// Returns `false` if the host is no longer listening.
    pub fn send(&self, event: ViewEvent) -> bool {
        if let Err(err) = self.tx.send((self.session_id, event)) {
            tracing::debug!(session_id = self.session_id, ?err, "Host dropped view event");
            return false;
        }
        true
    }
}

/// Options a view is created with.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ViewOptions {
    pub title: String,
    /// The only directory local assets may be loaded from.
    pub resource_root: PathBuf,
}

/// The sandboxed view displaying the preview.
pub trait RenderSurface: Send + Sync {
    fn set_title(&self, title: &str);

    fn set_resource_root(&self, root: &Path);

    /// Replaces the whole content of the view.
    ///
    /// Whatever handshake the previous content performed is void afterwards,
    /// the new content starts its own. Returns the revision the new content's
    /// messages are reported with.
    fn set_content(&self, html: String) -> ContentRevision;

    fn post_message(&self, message: &OutboundMessage) -> Result<(), ChannelError>;

    /// Brings the view to the foreground without taking focus.
    fn reveal(&self);

    fn dispose(&self);

    fn is_disposed(&self) -> bool;
}

/// Creates rendering surfaces.
pub trait ViewFactory: Send + Sync + 'static {
    fn create_view(
        &self,
        options: ViewOptions,
        events: ViewEventSender,
    ) -> Result<Box<dyn RenderSurface>, ChannelError>;
}

/// The session's end of the channel to its view.
pub struct MessageChannel {
    session_id: SessionId,
    view: Box<dyn RenderSurface>,
}

impl std::fmt::Debug for MessageChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MessageChannel")
            .field("session_id", &self.session_id)
            .field("disposed", &self.view.is_disposed())
            .finish()
    }
}

impl MessageChannel {
    pub fn new(session_id: SessionId, view: Box<dyn RenderSurface>) -> Self {
        Self { session_id, view }
    }

    /// Posts a message, returns whether the view accepted it.
    ///
    /// Never fails from the caller's perspective: posting to a disposed view
    /// or a view nobody listens to is only logged.
    pub fn post(&self, message: OutboundMessage) -> bool {
        if self.view.is_disposed() {
            tracing::debug!(session_id = self.session_id, "Dropping message to disposed view");
            return false;
        }
        match self.view.post_message(&message) {
            Ok(()) => true,
            Err(err) => {
                tracing::warn!(session_id = self.session_id, ?err, "Failed to post message to view");
                false
            }
        }
    }

    /// Returns the revision of the new content, `None` if the view is gone.
    pub fn replace_content(&self, html: String) -> Option<ContentRevision> {
        if self.view.is_disposed() {
            tracing::debug!(session_id = self.session_id, "Dropping content for disposed view");
            return None;
        }
        tracing::debug!(session_id = self.session_id, len = html.len(), "Replacing view content");
        Some(self.view.set_content(html))
    }

    pub fn retitle(&self, title: &str, resource_root: &Path) {
        if self.view.is_disposed() {
            return;
        }
        self.view.set_title(title);
        self.view.set_resource_root(resource_root);
    }

    pub fn reveal(&self) {
        if !self.view.is_disposed() {
            self.view.reveal();
        }
    }

    pub fn close(&self) {
        if !self.view.is_disposed() {
            self.view.dispose();
        }
    }
}

impl Drop for MessageChannel {
    fn drop(&mut self) {
        self.close();
    }
}
