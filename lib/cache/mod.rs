/// Directory entry indexes.
pub mod dirents;
/// Cached objects and the handles that pin them.
pub mod entry;
/// Cache eviction policies.
pub mod eviction;
mod gc;
mod key;
mod table;

pub use dirents::{DirIndex, Dirent};
pub use entry::{CacheEntry, EntryHandle, EntryState, ParentLink, Payload, Validity};
pub use gc::{GarbageCollector, GcReport};
pub use key::{EntryId, HandleKey};
pub use table::{EntryCache, ValidateOp};
