//! vdisk Core Library
//!
//! Read-only access to virtual disk images in the VHD, VHDX and VMDK
//! families. An opened image is a flat byte-addressable view of what a guest
//! would see on the attached disk: sparse blocks, grain tables, compressed
//! grains, multi-extent layouts and copy-on-write parent chains are resolved
//! behind `read_at`.
//!
//! # Modules
//!
//! - `error` - Error types and Result alias
//! - `source` - Seekable byte sources (files, memory maps)
//! - `resolver` - Mapping sibling names (parents, extents) to sources
//! - `image` - Format sniffing and the top-level [`VirtualDisk`]
//! - `vhd` - VHD fixed and dynamic disks
//! - `vhdx` - VHDX dynamic disks with sector bitmaps and parents
//! - `vmdk` - VMDK descriptors, sparse dialects and multi-extent images
//!
//! # Example
//!
//! ```no_run
//! use vdisk_core::VirtualDisk;
//!
//! let mut image = VirtualDisk::open_path("disk.vmdk".as_ref()).unwrap();
//! let mut boot_sector = [0u8; 512];
//! image.read_at(&mut boot_sector, 0).unwrap();
//! println!("{} bytes, {}", image.size(), image.format());
//! ```

mod codec;

pub mod error;
pub mod image;
pub mod resolver;
pub mod source;
pub mod vhd;
pub mod vhdx;
pub mod vmdk;

pub use error::{Error, Result};
pub use image::{DiskFormat, VirtualDisk};
pub use resolver::{DirResolver, FileResolver};
pub use source::{open_mmap, ByteSource};
