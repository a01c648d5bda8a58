pub mod cache;
pub mod patcher;
pub mod pool;
