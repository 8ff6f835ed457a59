//! vdisk CLI - Inspect and extract virtual disk images.

use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use indicatif::{ProgressBar, ProgressStyle};
use sha2::{Digest, Sha256};
use vdisk_core::VirtualDisk;

/// Read-only access to VHD, VHDX and VMDK virtual disk images.
#[derive(Parser)]
#[command(name = "vdisk")]
#[command(version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Display information about a virtual disk image.
    Info {
        /// Path to the image (descriptor or primary file).
        image: PathBuf,
    },

    /// Read a byte range from the guest-visible disk contents.
    Read {
        /// Path to the image.
        image: PathBuf,

        /// Byte offset to start reading at.
        #[arg(short, long, default_value = "0")]
        offset: u64,

        /// Number of bytes to read.
        #[arg(short, long, default_value = "512")]
        length: usize,

        /// Write the bytes to a file instead of hex-dumping to stdout.
        #[arg(long)]
        output: Option<PathBuf>,
    },

    /// Extract the whole flat image to a file.
    Dump {
        /// Path to the image.
        image: PathBuf,

        /// Output path for the raw image.
        output: PathBuf,

        /// Suppress progress output.
        #[arg(short, long)]
        quiet: bool,
    },
}

fn main() -> Result<()> {
    env_logger::init();
    let cli = Cli::parse();

    match cli.command {
        Commands::Info { image } => show_info(&image),
        Commands::Read {
            image,
            offset,
            length,
            output,
        } => run_read(&image, offset, length, output.as_deref()),
        Commands::Dump {
            image,
            output,
            quiet,
        } => run_dump(&image, &output, quiet),
    }
}

fn open(path: &Path) -> Result<VirtualDisk> {
    VirtualDisk::open_path(path).with_context(|| format!("opening {}", path.display()))
}

fn show_info(path: &Path) -> Result<()> {
    let image = open(path)?;

    println!("Image:    {}", path.display());
    println!("Format:   {}", image.format());
    println!("Size:     {} ({} bytes)", format_bytes(image.size()), image.size());

    match &image {
        VirtualDisk::Vhd(vhd) => {
            println!(
                "Layout:   {}",
                if vhd.is_fixed() { "fixed" } else { "dynamic" }
            );
            let id: String = vhd
                .footer()
                .unique_id
                .iter()
                .map(|b| format!("{:02x}", b))
                .collect();
            println!("Disk ID:  {}", id);
        }
        VirtualDisk::Vhdx(vhdx) => {
            println!("Blocks:   {} bytes", vhdx.block_size());
            println!(
                "Sectors:  {} logical / {} physical",
                vhdx.logical_sector_size(),
                vhdx.physical_sector_size()
            );
            println!("Disk ID:  {}", vhdx.virtual_disk_id());
            println!("Parent:   {}", if vhdx.has_parent() { "yes" } else { "no" });
        }
        VirtualDisk::Vmdk(vmdk) => {
            println!("Extents:  {}", vmdk.extent_count());
            if let Some(create_type) = vmdk.descriptor().and_then(|d| d.create_type()) {
                println!("Type:     {}", create_type);
            }
            println!("Parent:   {}", if vmdk.has_parent() { "yes" } else { "no" });
        }
    }

    Ok(())
}

fn run_read(path: &Path, offset: u64, length: usize, output: Option<&Path>) -> Result<()> {
    let mut image = open(path)?;

    let mut buf = vec![0u8; length];
    let read = image
        .read_at(&mut buf, offset)
        .with_context(|| format!("reading {} bytes at offset {}", length, offset))?;
    buf.truncate(read);

    match output {
        Some(out_path) => {
            std::fs::write(out_path, &buf)
                .with_context(|| format!("writing {}", out_path.display()))?;
            eprintln!("wrote {} bytes to {}", read, out_path.display());
        }
        None => hex_dump(&buf, offset),
    }
    Ok(())
}

/// Extraction chunk size; large enough to amortize per-call planning.
const DUMP_CHUNK: usize = 4 * 1024 * 1024;

fn run_dump(path: &Path, output: &Path, quiet: bool) -> Result<()> {
    let mut image = open(path)?;
    let size = image.size();

    let progress = if quiet {
        ProgressBar::hidden()
    } else {
        let pb = ProgressBar::new(size);
        pb.set_style(
            ProgressStyle::default_bar()
                .template("{bar:40} {bytes}/{total_bytes} ({eta})")
                .expect("static template"),
        );
        pb
    };

    let file = File::create(output).with_context(|| format!("creating {}", output.display()))?;
    let mut writer = BufWriter::new(file);
    let mut hasher = Sha256::new();

    let mut buf = vec![0u8; DUMP_CHUNK];
    let mut offset = 0u64;
    while offset < size {
        let read = image.read_at(&mut buf, offset)?;
        if read == 0 {
            break;
        }
        writer.write_all(&buf[..read])?;
        hasher.update(&buf[..read]);
        offset += read as u64;
        progress.set_position(offset);
    }
    writer.flush()?;
    progress.finish_and_clear();

    println!("{} bytes -> {}", offset, output.display());
    println!("sha256: {:x}", hasher.finalize());
    Ok(())
}

fn hex_dump(data: &[u8], base: u64) {
    for (i, row) in data.chunks(16).enumerate() {
        let hex: Vec<String> = row.iter().map(|b| format!("{:02x}", b)).collect();
        let ascii: String = row
            .iter()
            .map(|&b| {
                if b.is_ascii_graphic() || b == b' ' {
                    b as char
                } else {
                    '.'
                }
            })
            .collect();
        println!(
            "{:08x}  {:<47}  |{}|",
            base + i as u64 * 16,
            hex.join(" "),
            ascii
        );
    }
}

fn format_bytes(bytes: u64) -> String {
    const UNITS: [&str; 5] = ["B", "KiB", "MiB", "GiB", "TiB"];
    let mut value = bytes as f64;
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }
    if unit == 0 {
        format!("{} {}", bytes, UNITS[unit])
    } else {
        format!("{:.1} {}", value, UNITS[unit])
    }
}
