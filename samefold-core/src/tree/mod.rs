mod arena;
mod node;

pub use arena::FolderArena;
pub use node::{FolderId, FolderNode};
