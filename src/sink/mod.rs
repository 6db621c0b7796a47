pub mod aggregated;
pub mod manifest;

pub use manifest::{AppManifest, ManifestBuilder};
