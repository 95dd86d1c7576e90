//! Domain models.

mod context;

pub use context::{Context, ContextError, ContextStatus, NewContext, RetryMeta};
