//! CIE/FDE records of the DWARF `.eh_frame` section.
//!
//! Every record is a little-endian 4-byte length (the length cell itself is
//! not counted) followed by a 4-byte discriminator: zero marks a CIE, any
//! other value marks an FDE and doubles as a back-pointer to its CIE. The
//! 64-bit extended-length form (length cell of 0xffff_ffff) is rejected, not
//! skipped.

use crate::error::LinkError;
use crate::input::{Artifact, Rela};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordKind {
    Cie,
    Fde,
}

/// One length-prefixed record as the scanner sees it. Transient: ingestion
/// turns these into `Cie`/`Fde` entries and drops them.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Record {
    pub kind: RecordKind,
    pub offset: u64,
    /// Byte size excluding the 4-byte length cell.
    pub size: u64,
}

/// Lazy scanner over a raw `.eh_frame` blob. Restartable: build a fresh
/// scanner to rescan from offset zero.
#[derive(Debug)]
pub struct RecordScanner<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> RecordScanner<'a> {
    #[must_use]
    pub fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    fn read_u32(&mut self) -> Result<u32, LinkError> {
        let Some(bytes) = self.data.get(self.pos..self.pos + 4) else {
            return Err(LinkError::TruncatedRecord(self.pos as u64));
        };
        self.pos += 4;
        Ok(u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
    }
}

impl Iterator for RecordScanner<'_> {
    type Item = Result<Record, LinkError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.pos >= self.data.len() {
            return None;
        }
        let offset = self.pos as u64;
        let size = match self.read_u32() {
            Ok(value) => value,
            Err(err) => return Some(Err(err)),
        };
        if size == 0xffff_ffff {
            return Some(Err(LinkError::ExtendedDwarfLength(offset)));
        }
        let id = match self.read_u32() {
            Ok(value) => value,
            Err(err) => return Some(Err(err)),
        };
        let next_pos = offset as usize + 4 + size as usize;
        if next_pos > self.data.len() {
            return Some(Err(LinkError::TruncatedRecord(offset)));
        }
        self.pos = next_pos;
        let kind = if id == 0 { RecordKind::Cie } else { RecordKind::Fde };
        Some(Ok(Record {
            kind,
            offset,
            size: u64::from(size),
        }))
    }
}

/// Final position of a placed record in the merged section. Layout assigns
/// this exactly once; records that contribute no bytes stay `Excluded`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Placement {
    #[default]
    Excluded,
    Included { out_offset: u64 },
}

impl Placement {
    #[must_use]
    pub fn out_offset(self) -> Option<u64> {
        match self {
            Placement::Excluded => None,
            Placement::Included { out_offset } => Some(out_offset),
        }
    }
}

/// Deduplication verdict for a CIE. Exactly one `Canonical` entry survives
/// per content-equal class; a `Duplicate` borrows its canonical's offset.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CieDisposition {
    #[default]
    Pending,
    Canonical { out_offset: u64 },
    Duplicate { out_offset: u64 },
}

impl CieDisposition {
    #[must_use]
    pub fn out_offset(self) -> Option<u64> {
        match self {
            CieDisposition::Pending => None,
            CieDisposition::Canonical { out_offset } | CieDisposition::Duplicate { out_offset } => {
                Some(out_offset)
            }
        }
    }

    #[must_use]
    pub fn is_canonical(self) -> bool {
        matches!(self, CieDisposition::Canonical { .. })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Cie {
    pub offset: u64,
    pub size: u64,
    pub rel_index: u32,
    pub rel_count: u32,
    pub disposition: CieDisposition,
}

impl Cie {
    /// Record bytes including the 4-byte length cell.
    #[must_use]
    pub fn bytes<'a>(&self, artifact: &'a Artifact) -> &'a [u8] {
        &artifact.data[self.offset as usize..(self.offset + 4 + self.size) as usize]
    }

    /// Payload after the length cell; what deduplication compares.
    #[must_use]
    pub fn payload<'a>(&self, artifact: &'a Artifact) -> &'a [u8] {
        &self.bytes(artifact)[4..]
    }

    #[must_use]
    pub fn relocs<'a>(&self, artifact: &'a Artifact) -> &'a [Rela] {
        &artifact.relocs[self.rel_index as usize..(self.rel_index + self.rel_count) as usize]
    }

    /// Bytes this record occupies in the output, length cell included.
    #[must_use]
    pub fn out_size(&self) -> u64 {
        self.size + 4
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Fde {
    pub offset: u64,
    pub size: u64,
    /// Index of the referenced CIE in the owning artifact's list.
    pub cie_index: u32,
    pub rel_index: u32,
    pub rel_count: u32,
    /// Externally supplied: whether the code range this entry covers survived
    /// linking. Dead entries keep their slot for provenance but are never
    /// placed or written.
    pub alive: bool,
    pub placement: Placement,
}

impl Fde {
    #[must_use]
    pub fn bytes<'a>(&self, artifact: &'a Artifact) -> &'a [u8] {
        &artifact.data[self.offset as usize..(self.offset + 4 + self.size) as usize]
    }

    #[must_use]
    pub fn relocs<'a>(&self, artifact: &'a Artifact) -> &'a [Rela] {
        &artifact.relocs[self.rel_index as usize..(self.rel_index + self.rel_count) as usize]
    }

    /// The CIE-pointer field value as stored in the input record.
    #[must_use]
    pub fn cie_pointer(&self, artifact: &Artifact) -> u32 {
        let bytes = self.bytes(artifact);
        u32::from_le_bytes([bytes[4], bytes[5], bytes[6], bytes[7]])
    }

    #[must_use]
    pub fn cie<'a>(&self, artifact: &'a Artifact) -> &'a Cie {
        &artifact.cies[self.cie_index as usize]
    }

    #[must_use]
    pub fn out_size(&self) -> u64 {
        self.size + 4
    }
}

/// Renders one CIE for diagnostics.
#[must_use]
pub fn format_cie(artifact: &Artifact, cie: &Cie) -> String {
    let head = format!(
        "{}: CIE @{:#x} size {:#x} relocs {}",
        artifact.name, cie.offset, cie.size, cie.rel_count
    );
    match cie.disposition {
        CieDisposition::Pending => head,
        CieDisposition::Canonical { out_offset } => format!("{head} -> @{out_offset:#x}"),
        CieDisposition::Duplicate { out_offset } => {
            format!("{head} duplicate of @{out_offset:#x}")
        }
    }
}

/// Renders one FDE for diagnostics.
#[must_use]
pub fn format_fde(artifact: &Artifact, fde: &Fde) -> String {
    let head = format!(
        "{}: FDE @{:#x} size {:#x} cie {} relocs {}",
        artifact.name, fde.offset, fde.size, fde.cie_index, fde.rel_count
    );
    if !fde.alive {
        return format!("{head} dead");
    }
    match fde.placement {
        Placement::Excluded => head,
        Placement::Included { out_offset } => format!("{head} -> @{out_offset:#x}"),
    }
}
