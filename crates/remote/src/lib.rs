//! Remote tier backends for buildcache
//!
//! - [`HttpRemote`]: `HEAD`/`GET`/`PUT` against `{url}/{key}`
//! - [`DirectoryRemote`]: a shared directory such as a network mount
//!
//! Backends are built from [`buildcache::RemoteConfig`] through the
//! [`BackendRegistry`], which wraps each in [`RetryingRemote`] so transient
//! failures are retried with exponential backoff before the coordinator
//! sees them.

pub mod directory;
pub mod http;
pub mod registry;
pub mod retry;

pub use directory::DirectoryRemote;
pub use http::HttpRemote;
pub use registry::{BackendFactory, BackendRegistry, create_remote_service};
pub use retry::{RetryingRemote, retry_with_backoff};
