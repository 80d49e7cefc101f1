pub mod idgen;
pub mod logging;

pub use idgen::{EPOCH_MS, IdPool, SnowflakeGenerator};
pub use logging::init_tracing;
