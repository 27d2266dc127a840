//! TRELLIS resource injection
//!
//! Named resource creators with declared (required or optional)
//! dependencies, analyzed once per registry, and built lazily as
//! per-scope singletons.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod creator;
pub mod error;
pub mod map;
pub mod registry;

pub use creator::{BoxError, ResourceCreator, ResourceRef, ResourceScope};
pub use error::{ResourceError, ResourceResult};
pub use map::{ResourceContext, ResourceMap};
pub use registry::CreatorRegistry;
