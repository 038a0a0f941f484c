//! The widget's rendering surface and how the relay finds it.

use std::{
    collections::HashMap,
    fmt,
    sync::{Arc, RwLock},
};

use {
    embed_relay_protocol::{Dialect, Outbound},
    serde::Serialize,
    serde_json::Value,
    tokio::sync::mpsc,
    tracing::{debug, trace},
};

/// A frame that can receive posted messages.
///
/// Implementations must not synchronously dispatch back into the relay's
/// [`MessageChannel`](crate::MessageChannel); hand the message off instead.
pub trait FrameWindow: Send + Sync {
    fn post_message(&self, message: Value, target_origin: &str);
}

/// Resolves frames by element id.
pub trait FrameLookup: Send + Sync {
    fn frame_by_id(&self, id: &str) -> Option<Arc<dyn FrameWindow>>;
}

/// A fixed table of frames keyed by element id.
#[derive(Default)]
pub struct StaticDocument {
    frames: RwLock<HashMap<String, Arc<dyn FrameWindow>>>,
}

impl StaticDocument {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert_frame(&self, id: impl Into<String>, frame: Arc<dyn FrameWindow>) {
        self.frames
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(id.into(), frame);
    }

    pub fn remove_frame(&self, id: &str) -> Option<Arc<dyn FrameWindow>> {
        self.frames
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .remove(id)
    }
}

impl FrameLookup for StaticDocument {
    fn frame_by_id(&self, id: &str) -> Option<Arc<dyn FrameWindow>> {
        self.frames
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(id)
            .cloned()
    }
}

impl fmt::Debug for StaticDocument {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let frames = self.frames.read().unwrap_or_else(|e| e.into_inner());
        f.debug_struct("StaticDocument")
            .field("frames", &frames.keys().collect::<Vec<_>>())
            .finish()
    }
}

/// A message as it was posted into a frame.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PostedMessage {
    pub target_origin: String,
    pub message: Value,
}

/// Frame that forwards every post onto an unbounded channel.
#[derive(Debug, Clone)]
pub struct ForwardingFrame {
    tx: mpsc::UnboundedSender<PostedMessage>,
}

impl ForwardingFrame {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<PostedMessage>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

impl FrameWindow for ForwardingFrame {
    fn post_message(&self, message: Value, target_origin: &str) {
        let posted = PostedMessage {
            target_origin: target_origin.to_string(),
            message,
        };
        if self.tx.send(posted).is_err() {
            trace!("frame receiver dropped, post discarded");
        }
    }
}

/// Where responses for one inbound message go.
///
/// Resolved once per message; a missing frame turns every post into a no-op.
#[derive(Clone)]
pub struct FrameTarget {
    frame: Option<Arc<dyn FrameWindow>>,
    origin: String,
    dialect: Dialect,
}

impl FrameTarget {
    pub fn new(frame: Option<Arc<dyn FrameWindow>>, origin: impl Into<String>, dialect: Dialect) -> Self {
        Self {
            frame,
            origin: origin.into(),
            dialect,
        }
    }

    pub fn is_attached(&self) -> bool {
        self.frame.is_some()
    }

    /// Encode and post a message. Returns `false` if there was no frame.
    pub fn post(&self, message: &Outbound) -> bool {
        let Some(frame) = &self.frame else {
            debug!(kind = ?message.kind(), "no target frame, post skipped");
            return false;
        };
        frame.post_message(self.dialect.encode(message), &self.origin);
        true
    }
}

impl fmt::Debug for FrameTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FrameTarget")
            .field("attached", &self.is_attached())
            .field("origin", &self.origin)
            .field("dialect", &self.dialect)
            .finish()
    }
}
