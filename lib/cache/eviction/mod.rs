/// LRU ordering driven by a background worker.
pub mod lru;
