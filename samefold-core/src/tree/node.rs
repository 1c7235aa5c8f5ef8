use crate::fingerprint::FileFingerprint;

/// Unique identifier for a folder in the arena
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FolderId(pub usize);

impl FolderId {
    pub const ROOT: FolderId = FolderId(0);

    pub fn index(&self) -> usize {
        self.0
    }
}

/// A folder observed during the walk, with its direct files attached.
/// Roll-ups over the subtree happen later, in the aggregator.
#[derive(Debug)]
pub struct FolderNode {
    pub id: FolderId,
    pub name: String,
    /// NFC, `/`-separated; `"."` for the root.
    pub relative_path: String,
    /// Parent folder (None for root)
    pub parent: Option<FolderId>,
    pub children: Vec<FolderId>,
    /// Depth in tree (0 for root)
    pub depth: u16,
    /// Direct (non-recursive) file fingerprints.
    pub files: Vec<FileFingerprint>,
    /// Set when a direct file drifted during hashing.
    pub unstable: bool,
}

impl FolderNode {
    pub fn new(
        id: FolderId,
        name: String,
        relative_path: String,
        parent: Option<FolderId>,
        depth: u16,
    ) -> Self {
        Self {
            id,
            name,
            relative_path,
            parent,
            children: Vec::new(),
            depth,
            files: Vec::new(),
            unstable: false,
        }
    }
}
