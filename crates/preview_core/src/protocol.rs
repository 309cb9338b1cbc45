//! Protocol message types exchanged with the rendering surface.
//!
//! The page rendering the preview reports back through [`InboundMessage`],
//! the host drives it through [`OutboundMessage`]. Both directions are JSON
//! objects tagged by a `type` field.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Messages sent from the rendering surface to the host.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum InboundMessage {
    /// The page finished loading and can process updates.
    Ready,

    /// The page rendered the document.
    Rendered {
        #[serde(default)]
        html: String,
    },

    /// Rendering the document failed inside the page.
    RenderError {
        #[serde(default)]
        error: String,
    },

    /// Which expected external symbols the page found after loading its scripts.
    Globals {
        #[serde(default)]
        globals: BTreeMap<String, serde_json::Value>,
    },

    /// Diagnostic forwarded from the page console.
    Log {
        #[serde(default)]
        level: String,
        #[serde(default)]
        message: String,
    },
}

impl InboundMessage {
    pub fn parse(raw: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(raw)
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Self::Ready => "ready",
            Self::Rendered { .. } => "rendered",
            Self::RenderError { .. } => "renderError",
            Self::Globals { .. } => "globals",
            Self::Log { .. } => "log",
        }
    }
}

/// Messages sent from the host to the rendering surface.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum OutboundMessage {
    /// Replace the raw document text, the page re-renders it.
    Update { text: String },
}

/// Returns `true` if any reported global is exactly `true`.
pub fn any_global_loaded(globals: &BTreeMap<String, serde_json::Value>) -> bool {
    globals
        .values()
        .any(|value| matches!(value, serde_json::Value::Bool(true)))
}
