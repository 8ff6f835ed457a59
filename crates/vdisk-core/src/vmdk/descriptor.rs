//! VMDK descriptor parsing.
//!
//! The descriptor is plain text, either a standalone `.vmdk` file or embedded
//! in a hosted sparse extent. It declares the extents making up the disk,
//! `key=value` attributes, and the `ddb.*` disk data base.

use std::collections::HashMap;

use crate::error::{Error, Result};

/// CID value meaning "no parent".
const NO_PARENT_CID: &str = "ffffffff";

/// The type of a VMDK extent.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExtentKind {
    /// Raw disk data, declared size, no index.
    Flat,
    /// Hosted sparse extent with grain tables.
    Sparse,
    /// Zeroed data without storage.
    Zero,
    /// ESX flat extent on VMFS.
    Vmfs,
    /// ESX sparse (COWD-style) extent.
    VmfsSparse,
    /// ESX snapshot sparse extent.
    SeSparse,
}

impl ExtentKind {
    fn from_str(s: &str) -> Result<Self> {
        match s.to_uppercase().as_str() {
            "FLAT" => Ok(ExtentKind::Flat),
            "SPARSE" => Ok(ExtentKind::Sparse),
            "ZERO" => Ok(ExtentKind::Zero),
            "VMFS" => Ok(ExtentKind::Vmfs),
            "VMFSSPARSE" => Ok(ExtentKind::VmfsSparse),
            "SESPARSE" => Ok(ExtentKind::SeSparse),
            _ => Err(Error::unsupported(format!("unknown extent type: {}", s))),
        }
    }

    /// Whether this extent resolves reads through grain tables.
    pub fn is_sparse(&self) -> bool {
        matches!(
            self,
            ExtentKind::Sparse | ExtentKind::VmfsSparse | ExtentKind::SeSparse
        )
    }
}

/// One extent line: `RW 4192256 SPARSE "disk-s001.vmdk" 0`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExtentLine {
    /// Access mode: `RW`, `RDONLY`, or `NOACCESS`.
    pub access: String,
    /// Size of this extent in 512-byte sectors.
    pub size_sectors: u64,
    pub kind: ExtentKind,
    /// Filename of the extent file, quotes stripped.
    pub filename: String,
    /// Optional start sector within the extent file.
    pub start_sector: u64,
}

/// Parsed descriptor: extents plus the attribute and `ddb.*` maps.
#[derive(Debug, Clone, Default)]
pub struct DiskDescriptor {
    /// Top-level `key=value` attributes; unknown keys are retained.
    pub attributes: HashMap<String, String>,
    /// The disk data base (`ddb.*`) map.
    pub ddb: HashMap<String, String>,
    pub extents: Vec<ExtentLine>,
    /// Sum of the extent sizes in sectors.
    pub total_sectors: u64,
}

impl DiskDescriptor {
    /// Parses descriptor text. `#` introduces comments; blank lines are
    /// ignored; quoted values have their quotes stripped.
    pub fn parse(text: &str) -> Result<Self> {
        let mut descriptor = DiskDescriptor::default();

        for line in text.lines() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }

            if line.starts_with("RW ")
                || line.starts_with("RDONLY ")
                || line.starts_with("NOACCESS ")
            {
                let extent = parse_extent_line(line)?;
                descriptor.total_sectors += extent.size_sectors;
                descriptor.extents.push(extent);
                continue;
            }

            if let Some((key, value)) = parse_key_value(line) {
                if key.starts_with("ddb.") {
                    descriptor.ddb.insert(key, value);
                } else {
                    descriptor.attributes.insert(key, value);
                }
            }
        }

        Ok(descriptor)
    }

    /// The declared disk type, e.g. `monolithicSparse`.
    pub fn create_type(&self) -> Option<&str> {
        self.attributes.get("createType").map(String::as_str)
    }

    /// The parent file name, when `parentCID` marks this as a delta disk.
    pub fn parent_hint(&self) -> Option<&str> {
        let cid = self.attributes.get("parentCID")?;
        if cid.eq_ignore_ascii_case(NO_PARENT_CID) {
            return None;
        }
        self.attributes.get("parentFileNameHint").map(String::as_str)
    }
}

/// Parses `key=value` or `key = value`, stripping surrounding quotes.
fn parse_key_value(line: &str) -> Option<(String, String)> {
    let eq_pos = line.find('=')?;
    let key = line[..eq_pos].trim().to_string();
    let mut value = line[eq_pos + 1..].trim().to_string();

    if value.starts_with('"') && value.ends_with('"') && value.len() >= 2 {
        value = value[1..value.len() - 1].to_string();
    }

    Some((key, value))
}

/// Parses an extent line: `ACCESS SIZE TYPE "FILENAME" [OFFSET]`.
fn parse_extent_line(line: &str) -> Result<ExtentLine> {
    let parts: Vec<&str> = line.split_whitespace().collect();
    if parts.len() < 3 {
        return Err(Error::invalid_descriptor(line));
    }

    let access = parts[0].to_string();
    let size_sectors: u64 = parts[1]
        .parse()
        .map_err(|_| Error::invalid_descriptor(line))?;
    let kind = ExtentKind::from_str(parts[2])?;

    // ZERO extents carry no backing file.
    if parts.len() == 3 {
        if kind != ExtentKind::Zero {
            return Err(Error::invalid_descriptor(line));
        }
        return Ok(ExtentLine {
            access,
            size_sectors,
            kind,
            filename: String::new(),
            start_sector: 0,
        });
    }

    // The filename is quoted and may contain spaces, so rejoin the tail
    // before splitting it again at the closing quote.
    let rest = parts[3..].join(" ");
    let (filename, after) = parse_quoted_filename(&rest, line)?;

    let start_sector = match after.split_whitespace().next() {
        Some(token) => token.parse().map_err(|_| Error::invalid_descriptor(line))?,
        None => 0,
    };

    Ok(ExtentLine {
        access,
        size_sectors,
        kind,
        filename,
        start_sector,
    })
}

fn parse_quoted_filename<'a>(s: &'a str, line: &str) -> Result<(String, &'a str)> {
    let s = s.trim();
    if !s.starts_with('"') {
        return Err(Error::invalid_descriptor(line));
    }
    let end_quote = s[1..]
        .find('"')
        .ok_or_else(|| Error::invalid_descriptor(line))?
        + 1;
    Ok((s[1..end_quote].to_string(), &s[end_quote + 1..]))
}
