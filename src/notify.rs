//! Fire-and-forget notifications towards the user interface.

use serde::Serialize;
use std::sync::Arc;

use crate::error::Result;
use crate::kb::model::{Document, KnowledgeBaseNode, LoadState};

/// Events pushed to the UI
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum UiEvent {
    NodeAdded { node: KnowledgeBaseNode },
    DocumentAdded { document: Document },
    DocumentState { id: String, state: LoadState },
    KbState { id: String, state: LoadState },
    PendingCount { count: i64 },
    ScanStarted,
    ScanStopped,
}

/// Sink for UI events. Implementations may fail; callers never see the failure.
pub trait UiNotifier: Send + Sync {
    fn notify(&self, event: &UiEvent) -> Result<()>;
}

/// Writes each event as a JSON line to the log.
pub struct LogNotifier;

impl UiNotifier for LogNotifier {
    fn notify(&self, event: &UiEvent) -> Result<()> {
        let json = serde_json::to_string(event)
            .map_err(|e| crate::error::KbError::InvalidInput(e.to_string()))?;
        log::info!("ui {}", json);
        Ok(())
    }
}

/// Shared handle that swallows and logs sink failures.
#[derive(Clone)]
pub struct Notifier {
    sink: Arc<dyn UiNotifier>,
}

impl Notifier {
    pub fn new(sink: Arc<dyn UiNotifier>) -> Self {
        Self { sink }
    }

    pub fn log() -> Self {
        Self::new(Arc::new(LogNotifier))
    }

    pub fn emit(&self, event: UiEvent) {
        if let Err(e) = self.sink.notify(&event) {
            log::warn!("UI notification failed: {}", e);
        }
    }

    pub fn node_added(&self, node: &KnowledgeBaseNode) {
        self.emit(UiEvent::NodeAdded { node: node.clone() });
    }

    pub fn document_added(&self, document: &Document) {
        self.emit(UiEvent::DocumentAdded {
            document: document.clone(),
        });
    }

    pub fn document_state(&self, id: &str, state: LoadState) {
        self.emit(UiEvent::DocumentState {
            id: id.to_string(),
            state,
        });
    }

    pub fn kb_state(&self, id: &str, state: LoadState) {
        self.emit(UiEvent::KbState {
            id: id.to_string(),
            state,
        });
    }

    pub fn pending_count(&self, count: i64) {
        self.emit(UiEvent::PendingCount { count });
    }

    pub fn scan_started(&self) {
        self.emit(UiEvent::ScanStarted);
    }

    pub fn scan_stopped(&self) {
        self.emit(UiEvent::ScanStopped);
    }
}
