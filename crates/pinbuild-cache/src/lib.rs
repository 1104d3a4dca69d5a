//! Local artifact cache for pinbuild.
//!
//! Entries live at `<root>/<component>/<revision>/` and are never changed
//! once written. The existence of that directory is the only cache-hit
//! signal, so entries are copied into a staging directory first and
//! renamed into place when complete.

pub mod copy;
pub mod locate;
pub mod store;

pub use locate::{find_files, newest_file};
pub use store::{ArtifactCache, CacheEntry, PackageRecord, PackageRequest, PublishOptions, PublishOutcome};
