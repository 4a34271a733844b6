use serde::Serialize;
use std::fmt;

/// `parent_id` of a root knowledge base.
pub const ROOT_PARENT_ID: &str = "0";

/// Lifecycle tag stored in `load_state` for nodes and documents.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum LoadState {
    AddedPending,
    ModifiedPending,
    Deleted,
    Complete,
    Unsupported,
    LoadFailed,
}

impl LoadState {
    pub const ALL: [LoadState; 6] = [
        LoadState::AddedPending,
        LoadState::ModifiedPending,
        LoadState::Deleted,
        LoadState::Complete,
        LoadState::Unsupported,
        LoadState::LoadFailed,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            LoadState::AddedPending => "Added,PendingLoad",
            LoadState::ModifiedPending => "Modified,PendingLoad",
            LoadState::Deleted => "Deleted",
            LoadState::Complete => "Complete",
            LoadState::Unsupported => "Unsupported",
            LoadState::LoadFailed => "LoadFailed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "Added,PendingLoad" => Some(LoadState::AddedPending),
            "Modified,PendingLoad" => Some(LoadState::ModifiedPending),
            "Deleted" => Some(LoadState::Deleted),
            "Complete" => Some(LoadState::Complete),
            "Unsupported" => Some(LoadState::Unsupported),
            "LoadFailed" => Some(LoadState::LoadFailed),
            _ => None,
        }
    }

    pub fn is_pending(&self) -> bool {
        matches!(self, LoadState::AddedPending | LoadState::ModifiedPending)
    }

    /// Pending or deleted: the scheduler still has work to do for this row.
    pub fn awaits_processing(&self) -> bool {
        self.is_pending() || *self == LoadState::Deleted
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            LoadState::Complete | LoadState::Unsupported | LoadState::LoadFailed
        )
    }

    /// Whether `self -> next` is a legal transition.
    ///
    /// A deleted row comes back as ModifiedPending (documents) or
    /// AddedPending (knowledge base nodes) when its path reappears.
    pub fn can_transition_to(&self, next: LoadState) -> bool {
        use LoadState::*;
        match (self, next) {
            (a, b) if a.is_pending() => {
                b.is_terminal() || b == Deleted || b == ModifiedPending
            }
            (a, b) if a.is_terminal() => b == ModifiedPending || b == Deleted,
            (Deleted, b) => b.is_pending(),
            _ => false,
        }
    }

    /// States from which `next` may be entered.
    pub fn predecessors(next: LoadState) -> Vec<LoadState> {
        Self::ALL
            .into_iter()
            .filter(|s| s.can_transition_to(next))
            .collect()
    }
}

impl fmt::Display for LoadState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(self.as_str())
    }
}

/// A monitored directory. Roots have `parent_id == ROOT_PARENT_ID`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct KnowledgeBaseNode {
    pub id: String,
    pub parent_id: String,
    pub name: String,
    pub location_path: String,
    pub load_state: LoadState,
}

impl KnowledgeBaseNode {
    pub fn is_root(&self) -> bool {
        self.parent_id == ROOT_PARENT_ID
    }
}

/// A file inside a knowledge base directory.
///
/// `content` and the chunk lists are only populated when a document is read
/// back with its body; metadata queries leave them empty.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Document {
    pub id: String,
    pub kb_id: String,
    pub file_name: String,
    pub file_type: String,
    pub location_path: String,
    pub size: i64,
    pub mtime: i64,
    pub content: Option<String>,
    pub content_chunks: Vec<String>,
    #[serde(skip)]
    pub content_chunk_vectors: Vec<Vec<f32>>,
    #[serde(skip)]
    pub file_name_vector: Option<Vec<f32>>,
    pub load_state: LoadState,
    pub order_no: i64,
    pub created_at: String,
}

/// State of the background scan-and-load loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ScanState {
    Stopped,
    Running,
    ScanOnly,
}

impl ScanState {
    pub(crate) fn as_u8(self) -> u8 {
        match self {
            ScanState::Stopped => 0,
            ScanState::Running => 1,
            ScanState::ScanOnly => 2,
        }
    }

    pub(crate) fn from_u8(v: u8) -> Self {
        match v {
            1 => ScanState::Running,
            2 => ScanState::ScanOnly,
            _ => ScanState::Stopped,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_strings_round_trip() {
        for state in [
            LoadState::AddedPending,
            LoadState::ModifiedPending,
            LoadState::Deleted,
            LoadState::Complete,
            LoadState::Unsupported,
            LoadState::LoadFailed,
        ] {
            assert_eq!(LoadState::parse(state.as_str()), Some(state));
        }
        assert_eq!(LoadState::parse("Pending"), None);
    }

    #[test]
    fn test_transitions() {
        use LoadState::*;
        assert!(AddedPending.can_transition_to(Complete));
        assert!(AddedPending.can_transition_to(LoadFailed));
        assert!(Complete.can_transition_to(ModifiedPending));
        assert!(Complete.can_transition_to(Deleted));
        assert!(Deleted.can_transition_to(ModifiedPending));
        assert!(Deleted.can_transition_to(AddedPending));
        assert!(!Deleted.can_transition_to(Complete));
        assert!(!Deleted.can_transition_to(Deleted));
        assert!(!Complete.can_transition_to(AddedPending));
        assert!(!Unsupported.can_transition_to(Complete));
    }

    #[test]
    fn test_predecessors() {
        use LoadState::*;
        assert_eq!(LoadState::predecessors(Complete), vec![AddedPending, ModifiedPending]);
        assert_eq!(LoadState::predecessors(AddedPending), vec![Deleted]);
        assert_eq!(LoadState::predecessors(ModifiedPending).len(), LoadState::ALL.len());
    }

    #[test]
    fn test_pending_flags() {
        assert!(LoadState::AddedPending.is_pending());
        assert!(LoadState::Deleted.awaits_processing());
        assert!(!LoadState::Complete.awaits_processing());
    }
}
