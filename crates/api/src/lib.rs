//! Wire types for the protocol between the ferry backend, its distributors,
//! and the external reachability tester.
//!
//! This crate defines serialization formats and decoding machinery only; the
//! transports that carry them live in `ferry-server` and `ferry-client`.

pub mod bridgestrap;
pub mod registry;
pub mod stream;

pub use ferry_core::ResourceRequest;
pub use registry::{ResourceRegistry, RegistryError};
pub use stream::{RawDiff, FRAME_DELIMITER};
