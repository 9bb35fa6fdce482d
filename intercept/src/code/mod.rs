#[cfg(test)]
pub mod allocator;
pub mod cache;
pub mod patcher;
