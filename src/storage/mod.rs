mod blobs;
mod index;

pub use blobs::{sha256_hex, MessageStore};
pub use index::{FolderStats, Index, INDEX_FILE_NAME};
