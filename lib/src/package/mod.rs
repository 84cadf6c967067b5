//! The package reference model: coordinates, versions, and descriptors.

mod meta;
mod reference;
mod version;

pub use meta::{
    FilesystemPermissions, LayerInfo, OverlayMountRule, OverlayfsInfo, PackageMeta,
    PermissionMount, Permissions,
};
pub use reference::{latest_of, Arch, Module, Ref, RefError, DEFAULT_CHANNEL};
pub use version::{compare_versions, Version};
