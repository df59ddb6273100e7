use thiserror::Error;

use crate::reloc::Arch;

/// Failures of the `.eh_frame` merge. Every variant aborts the whole pass;
/// there is no per-record recovery.
#[derive(Debug, Error)]
pub enum LinkError {
    #[error("unsupported 64-bit dwarf length at offset {0:#x}")]
    ExtendedDwarfLength(u64),
    #[error("truncated frame record at offset {0:#x}")]
    TruncatedRecord(u64),
    #[error("frame entry at offset {offset:#x} references no known CIE (pointer {pointer:#x})")]
    UnmatchedCie { offset: u64, pointer: u32 },
    #[error("relocation references symbol {0} outside the symbol table")]
    UnknownSymbol(u32),
    #[error("arithmetic overflow while {0}")]
    Overflow(&'static str),
    #[error("unsupported relocation type {r_type} for {arch}")]
    UnsupportedRelocation { arch: Arch, r_type: u32 },
    #[error("relocation window extends past its record at address {0:#x}")]
    RelocOutOfBounds(u64),
    #[error("frame entry at offset {0:#x} references a CIE that was never placed")]
    UnplacedCie(u64),
    #[error("live frame entry at offset {0:#x} carries no relocations")]
    MissingInitialLocation(u64),
    #[error("section symbol {0} has no assigned output section")]
    MissingOutputSection(String),
}
