pub mod cache;
pub mod config;
pub mod decomposedfs;
pub mod filelocks;
pub mod lookup;
pub mod metadata;
pub mod node;
pub mod spaces;
pub mod tree;
pub mod upload;

mod locks;

#[cfg(test)]
mod decomposedfs_tests;

pub use cache::StatCache;
pub use config::{DcfsConfig, MetadataBackendKind};
pub use decomposedfs::{Decomposedfs, UploadOptions};
pub use lookup::Lookup;
pub use metadata::{MetadataBackend, SidecarBackend, XattrsBackend};
pub use node::{Node, NodeType, ResourceInfo};
pub use spaces::{Quota, SpaceFilter, SpaceManager, SpacePatch, StorageSpace};
pub use tree::{RecycleItem, Tree};
pub use upload::UploadSession;
