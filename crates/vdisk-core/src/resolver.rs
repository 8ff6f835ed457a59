//! Resolution of sibling file names to byte sources.
//!
//! Copy-on-write parents (VHDX locators, VMDK `parentFileNameHint`) and VMDK
//! descriptor extents reference their backing files by name. A
//! [`FileResolver`] translates such a name into an open [`ByteSource`]; the
//! resolver is passed to image constructors rather than held as process-wide
//! state, so two images can resolve against different directories.

use std::path::{Path, PathBuf};

use crate::error::Result;
use crate::source::{open_mmap, ByteSource};

/// Maps a logical sibling name to an open byte source.
///
/// Names arrive with `\` already normalized to `/`.
pub trait FileResolver {
    fn resolve(&self, name: &str) -> Result<Box<dyn ByteSource>>;
}

/// Resolves names relative to a base directory, the layout hypervisors use
/// for disks and their parents/extents sitting side by side.
pub struct DirResolver {
    base: PathBuf,
}

impl DirResolver {
    /// Creates a resolver rooted at `base`.
    pub fn new(base: impl Into<PathBuf>) -> Self {
        Self { base: base.into() }
    }

    /// Creates a resolver rooted at the directory containing `image_path`.
    pub fn for_image(image_path: &Path) -> Self {
        let base = image_path.parent().unwrap_or(Path::new(".")).to_path_buf();
        Self { base }
    }
}

impl FileResolver for DirResolver {
    fn resolve(&self, name: &str) -> Result<Box<dyn ByteSource>> {
        let path = self.base.join(name);
        log::debug!("resolving sibling '{}' -> {}", name, path.display());
        open_mmap(&path)
    }
}
