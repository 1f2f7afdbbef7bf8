//! A client for the ferry backend API, used by distributors to fetch their
//! resources, follow the resource stream, and persist their state.

pub mod api;
pub mod storage;

pub use api::{Backoff, Client, ClientError};
pub use storage::{FileStore, StoreError};
