//! Eno core types: the API object model, the manifest parser, and the
//! readiness predicate language.

#![forbid(unsafe_code)]

pub mod api;
pub mod readiness;
pub mod resource;

pub use api::{
    Composition, InputRevisions, Manifest, NamespacedName, ResourceSlice, ResourceState,
    Symphony, Synthesis, Synthesizer,
};
pub use resource::{ManifestRef, Ref, Resource};

pub mod prelude {
    pub use super::api::*;
    pub use super::resource::{ManifestRef, Ref, Resource};
}
