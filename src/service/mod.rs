pub mod executor;
pub mod ratelimit;
pub mod template;
pub mod value;

pub use executor::{ExecuteRequest, Executor};
pub use ratelimit::{Admission, MemoryWindowStore, RateLimiter, WindowStore};
pub use template::{TemplateExpander, TextualExpander, validate_statement};
pub use value::{ResultRow, SqlValue};
