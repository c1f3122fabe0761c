pub mod localdisk;
pub mod memory;

pub use localdisk::LocalDiskStorage;
pub use memory::MemoryStorage;
