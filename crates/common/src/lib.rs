pub mod error;
pub mod http;
pub mod model;
pub mod retry;

pub use error::{ErrorKind, GraphRagError, Result};
pub use http::ServiceKind;
pub use model::LanguageModel;
pub use retry::{RetryConfig, RetryPolicy};
