//! Newline-delimited JSON protocol spoken between the pool and `rasterd-worker`.
//!
//! Every message is a single JSON object on its own line. The worker writes one
//! [`WorkerEvent`] after startup, then answers each [`WorkerRequest`] with
//! exactly one [`WorkerReply`] carrying the same `id`. Binary payloads travel
//! as standard base64.

use base64::{Engine as _, engine::general_purpose::STANDARD};
use serde::{Deserialize, Serialize};

/// Startup announcement written by the worker before it reads any request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum WorkerEvent {
    Ready { pid: u32 },
    StartupFailed { message: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerRequest {
    pub id: u64,
    pub op: Operation,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Operation {
    /// Load a document, replacing any document the worker already holds.
    OpenDocument { document: String },
    RenderPage {
        document: u32,
        page_index: u32,
        dpi: u32,
        quality: u8,
    },
    CloseDocument { document: u32 },
}

impl Operation {
    pub fn open_document(bytes: &[u8]) -> Self {
        Self::OpenDocument {
            document: encode_payload(bytes),
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Operation::OpenDocument { .. } => "open_document",
            Operation::RenderPage { .. } => "render_page",
            Operation::CloseDocument { .. } => "close_document",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerReply {
    pub id: u64,
    pub outcome: Outcome,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum Outcome {
    DocumentOpened {
        document: u32,
        page_count: u32,
    },
    PageRendered {
        image: String,
        width: u32,
        height: u32,
    },
    DocumentClosed,
    Failed {
        kind: FailureKind,
        message: String,
    },
}

impl Outcome {
    pub fn failed(kind: FailureKind, message: impl Into<String>) -> Self {
        Self::Failed {
            kind,
            message: message.into(),
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Outcome::DocumentOpened { .. } => "document_opened",
            Outcome::PageRendered { .. } => "page_rendered",
            Outcome::DocumentClosed => "document_closed",
            Outcome::Failed { .. } => "failed",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    Open,
    Render,
    InvalidRequest,
}

pub fn encode_payload(bytes: &[u8]) -> String {
    STANDARD.encode(bytes)
}

pub fn decode_payload(encoded: &str) -> Result<Vec<u8>, base64::DecodeError> {
    STANDARD.decode(encoded)
}
