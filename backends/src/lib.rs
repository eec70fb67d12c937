pub mod local;
pub mod retry;
pub mod s3;

pub use local::LocalStore;
pub use retry::{RetryConfig, RetryingStore, Retryable, retry_with_backoff};
pub use s3::{S3Config, S3Store};
