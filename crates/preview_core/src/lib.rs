//! Core library of the markdown-it live preview.
//!
//! This crate keeps a single preview session in sync with the document being
//! edited and the sandboxed page rendering it, while tracking the stylesheets,
//! scripts and workspace configuration file the page depends on.
//!
//! # Modules
//!
//! - [`config`] - Per-workspace preview configuration and where it lives
//! - [`document`] - Document identity and the preview acceptance rule
//! - [`assets`] - Resolving configured asset paths to page URIs and watch targets
//! - [`template`] - Generating the page scaffold sent to the rendering surface
//! - [`protocol`] - Messages exchanged with the rendering surface
//! - [`channel`] - Rendering surface abstraction and the best-effort message channel
//! - [`watcher`] - Filesystem watch sets tied to a session's asset set
//! - [`workspace`] - Host primitives the session manager depends on
//! - [`session`] - The preview session state machine
//! - [`manager`] - The session manager owning at most one session

pub mod assets;
pub mod channel;
pub mod config;
pub mod document;
pub mod manager;
pub mod protocol;
pub mod session;
pub mod template;
pub mod watcher;
pub mod workspace;

mod error;

// Re-export commonly used types at crate root
pub use assets::{AssetResolver, LocalAssetResolver, ResolvedAsset};
pub use channel::{
    ContentRevision, MessageChannel, RenderSurface, SessionId, ViewEvent, ViewEventSender,
    ViewFactory, ViewOptions,
};
pub use config::{ConfigScope, PreviewConfig, DEFAULT_CONFIG_FILE_NAME};
pub use document::{Document, DocumentId};
pub use error::{ChannelError, PreviewError};
pub use manager::{Collaborators, ManagerOptions, PreviewMode, SessionManager, SessionSnapshot};
pub use protocol::{InboundMessage, OutboundMessage};
pub use session::SessionState;
pub use watcher::{ChangeKind, TargetKind, WatchEvent, WatchSet, WatchTarget, WatcherRegistry};
pub use workspace::Workspace;
