pub mod lru_cache;
pub mod process_locker;
