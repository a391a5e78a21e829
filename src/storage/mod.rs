pub mod block;
pub mod block_manager;
pub mod file_manager;
pub mod freelist;
pub mod memory_manager;
pub mod meta_block;
