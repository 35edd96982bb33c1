//! Containers
//!
//! - `platform`: the engine boundary the rest of the runner talks to
//! - `podman`: the engine implementation over the podman CLI
//! - `boxes`: the pipeline box and its linked service containers

mod boxes;
pub mod platform;
pub mod podman;

pub use boxes::{PipelineBox, ServiceBox, release};
