//! VMDK (VMware) images.
//!
//! A VMDK is one or more extents spliced into a single logical sector space:
//! hosted sparse (`KDMV`), legacy COW (`COWD`), ESX snapshot (`SEVM`), flat
//! files, or synthesized zeros, declared either by a standalone text
//! descriptor or by the extent's own header. Delta disks name a parent via
//! `parentCID`/`parentFileNameHint`.

pub mod descriptor;
mod flat;
mod header;
mod sparse;

pub use descriptor::{DiskDescriptor, ExtentKind, ExtentLine};

use std::io::Read;

use crate::error::{Error, Result};
use crate::image::read_at_sectors;
use crate::resolver::FileResolver;
use crate::source::{read_exact_at, source_len, ByteSource};

use flat::FlatExtent;
use header::{COWD_MAGIC, DESCRIPTOR_MAGIC, SESPARSE_MAGIC, SPARSE_MAGIC};
use sparse::{GrainRun, RunKind, SparseExtent};

/// VMDK sectors are always 512 bytes.
pub const SECTOR_SIZE: u64 = 512;

impl std::fmt::Debug for VmdkImage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VmdkImage")
            .field("sector_count", &self.sector_count)
            .field("size", &self.size)
            .finish()
    }
}

/// A read-only VMDK image assembled from its extents.
pub struct VmdkImage {
    extents: Vec<Extent>,
    parent: Option<Box<VmdkImage>>,
    descriptor: Option<DiskDescriptor>,
    sector_count: u64,
    size: u64,
}

/// One contiguous slice of the logical sector space.
struct Extent {
    backend: ExtentBackend,
    /// Start of this extent in the logical image, in sectors.
    sector_offset: u64,
    sector_count: u64,
}

/// Per-extent reader, one arm per extent flavor.
enum ExtentBackend {
    Flat(FlatExtent),
    Sparse(SparseExtent),
    Zero,
}

impl VmdkImage {
    /// Opens a VMDK from one or more byte sources.
    ///
    /// A single descriptor-file source pulls its extents in through
    /// `resolver`; several sources are treated as extents handed over up
    /// front. Files with an unrecognized magic are raw flat extents sized by
    /// the source itself.
    pub fn open(
        sources: Vec<Box<dyn ByteSource>>,
        resolver: &dyn FileResolver,
    ) -> Result<Self> {
        let mut image = VmdkImage {
            extents: Vec::new(),
            parent: None,
            descriptor: None,
            sector_count: 0,
            size: 0,
        };

        let single = sources.len() == 1;
        for mut source in sources {
            let mut magic = [0u8; 4];
            read_exact_at(&mut *source, 0, &mut magic)?;

            match &magic {
                DESCRIPTOR_MAGIC if single => image.open_descriptor(source, resolver)?,
                DESCRIPTOR_MAGIC => {
                    log::warn!("ignoring descriptor file among pre-opened extents");
                    continue;
                }
                SPARSE_MAGIC | COWD_MAGIC | SESPARSE_MAGIC => {
                    let extent = SparseExtent::open(source)?;
                    if image.parent.is_none() {
                        if let Some(hint) =
                            extent.descriptor().and_then(DiskDescriptor::parent_hint)
                        {
                            image.parent = Some(Box::new(open_parent(hint, resolver)?));
                        }
                    }
                    image.push_sparse(extent);
                }
                _ => {
                    // Raw fallback: the whole file is flat sector data.
                    let size = source_len(&mut *source)?;
                    image.push_extent(
                        ExtentBackend::Flat(FlatExtent::new(source, size)),
                        size / SECTOR_SIZE,
                    );
                }
            }
        }

        log::debug!(
            "VMDK with {} extent(s), {} bytes, parent: {}",
            image.extents.len(),
            image.size,
            image.parent.is_some()
        );
        Ok(image)
    }

    /// Opens the extents declared by a standalone descriptor file.
    fn open_descriptor(
        &mut self,
        mut source: Box<dyn ByteSource>,
        resolver: &dyn FileResolver,
    ) -> Result<()> {
        let len = source_len(&mut *source)?;
        let mut text = String::new();
        source.read_to_string(&mut text).map_err(|_| {
            Error::corrupt(format!("descriptor file of {} bytes is not UTF-8 text", len))
        })?;

        let descriptor = DiskDescriptor::parse(&text)?;

        if let Some(hint) = descriptor.parent_hint() {
            self.parent = Some(Box::new(open_parent(hint, resolver)?));
        }

        for line in &descriptor.extents {
            let kind = line.kind;
            if kind == ExtentKind::Zero {
                self.push_extent(ExtentBackend::Zero, line.size_sectors);
                continue;
            }

            let extent_source = resolver.resolve(&line.filename.replace('\\', "/"))?;
            if kind.is_sparse() {
                self.push_sparse(SparseExtent::open(extent_source)?);
            } else {
                let size = line.size_sectors * SECTOR_SIZE;
                self.push_extent(
                    ExtentBackend::Flat(FlatExtent::new(extent_source, size)),
                    line.size_sectors,
                );
            }
        }

        self.descriptor = Some(descriptor);
        Ok(())
    }

    fn push_sparse(&mut self, extent: SparseExtent) {
        let sector_count = extent.sector_count();
        self.push_extent(ExtentBackend::Sparse(extent), sector_count);
    }

    fn push_extent(&mut self, backend: ExtentBackend, sector_count: u64) {
        self.extents.push(Extent {
            backend,
            sector_offset: self.sector_count,
            sector_count,
        });
        self.sector_count += sector_count;
        self.size = self.sector_count * SECTOR_SIZE;
    }

    /// Logical size of the disk in bytes.
    pub fn size(&self) -> u64 {
        self.size
    }

    /// Number of extents composing the logical image.
    pub fn extent_count(&self) -> usize {
        self.extents.len()
    }

    /// The standalone descriptor, when the image was opened from one.
    pub fn descriptor(&self) -> Option<&DiskDescriptor> {
        self.descriptor.as_ref()
    }

    /// Whether this image reads through to a parent image.
    pub fn has_parent(&self) -> bool {
        self.parent.is_some()
    }

    /// Fills `buf` with the disk contents starting at `offset`. Reads
    /// touching the end of the disk return the bytes actually available.
    pub fn read_at(&mut self, buf: &mut [u8], offset: u64) -> Result<usize> {
        let size = self.size;
        read_at_sectors(size, SECTOR_SIZE, buf, offset, |sector, count| {
            self.read_sectors(sector, count)
        })
    }

    fn read_sectors(&mut self, mut sector: u64, mut count: u64) -> Result<Vec<u8>> {
        if sector + count > self.sector_count {
            return Err(Error::out_of_bounds(format!(
                "sectors {}..{} of {}",
                sector,
                sector + count,
                self.sector_count
            )));
        }

        let extents = &mut self.extents;
        let parent = &mut self.parent;

        let mut out = Vec::with_capacity((count * SECTOR_SIZE) as usize);
        let mut index = extents
            .partition_point(|extent| extent.sector_offset <= sector)
            .saturating_sub(1);

        while count > 0 {
            let extent = &mut extents[index];
            let relative = sector - extent.sector_offset;
            let piece = count.min(extent.sector_count - relative);

            match &mut extent.backend {
                ExtentBackend::Flat(flat) => {
                    let data = flat.read_sectors(relative, piece)?;
                    out.extend_from_slice(&data);
                }
                ExtentBackend::Zero => {
                    out.resize(out.len() + (piece * SECTOR_SIZE) as usize, 0);
                }
                ExtentBackend::Sparse(sparse_extent) => {
                    let runs = sparse_extent.plan_runs(relative, piece)?;
                    let base = extent.sector_offset;
                    execute_runs(sparse_extent, parent, base, &runs, &mut out)?;
                }
            }

            sector += piece;
            count -= piece;
            index += 1;
        }

        Ok(out)
    }
}

/// Executes planned runs for one sparse extent: parent runs recurse at the
/// image level, zero runs synthesize, data runs hit the extent's file.
fn execute_runs(
    extent: &mut SparseExtent,
    parent: &mut Option<Box<VmdkImage>>,
    extent_sector_offset: u64,
    runs: &[GrainRun],
    out: &mut Vec<u8>,
) -> Result<()> {
    for run in runs {
        match run.kind {
            RunKind::Parent => match parent.as_deref_mut() {
                Some(parent_image) => {
                    let data =
                        parent_image.read_sectors(extent_sector_offset + run.start, run.count)?;
                    out.extend_from_slice(&data);
                }
                None => out.resize(out.len() + (run.count * SECTOR_SIZE) as usize, 0),
            },
            RunKind::Zero => {
                out.resize(out.len() + (run.count * SECTOR_SIZE) as usize, 0);
            }
            RunKind::Data { .. } => {
                let data = extent.read_run(run)?;
                out.extend_from_slice(&data);
            }
        }
    }
    Ok(())
}

/// Opens a parent VMDK named by `parentFileNameHint`.
fn open_parent(hint: &str, resolver: &dyn FileResolver) -> Result<VmdkImage> {
    let name = hint.replace('\\', "/");
    let source = resolver
        .resolve(&name)
        .map_err(|e| Error::missing_parent(format!("cannot open '{}': {}", name, e)))?;
    log::debug!("opened VMDK parent: {}", name);
    VmdkImage::open(vec![source], resolver)
}
