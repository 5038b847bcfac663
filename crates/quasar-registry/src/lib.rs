pub mod file;
pub mod memory;
pub mod types;
pub mod usage;

pub use file::FileRegistry;
pub use memory::MemoryRegistry;
pub use types::{ModelRegistry, UsageSink};
pub use usage::{LogUsageSink, MemoryUsageSink};
