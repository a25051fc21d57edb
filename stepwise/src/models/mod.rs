pub mod migration;
pub mod revision;

pub use migration::{Migration, TransformFn};
pub use revision::{Revision, DEFAULT_REVISION_ID};
