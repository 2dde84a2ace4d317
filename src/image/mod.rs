//! Image push: addressing, tagging, status stream handling and orchestration

pub mod oci;
pub mod push;
pub mod registry;
pub mod status;
pub mod tag;

pub use push::{ImagePusher, PushRequest, PushResult};
