use crate::error::LinkError;
use crate::frame::{CieDisposition, Fde, Placement};
use crate::input::{Artifact, OutSection, Rela};
use crate::layout::live_fde_count;
use crate::reloc::{resolve_reloc, Arch};

use object::elf::STT_SECTION;

/// `.eh_frame_hdr` prefix: version byte, three pointer-encoding bytes, the
/// 4-byte pc-relative pointer to `.eh_frame` and the 4-byte entry count.
pub const EH_FRAME_HDR_HEADER_SIZE: usize = 12;

// DW_EH_PE pointer encodings used by the search table.
const DW_EH_PE_UDATA4: u8 = 0x03;
const DW_EH_PE_SDATA4: u8 = 0x0b;
const DW_EH_PE_PCREL: u8 = 0x10;
const DW_EH_PE_DATAREL: u8 = 0x30;

/// Builds the merged executable `.eh_frame`: canonical CIEs, then live FDEs
/// with their CIE back-pointers rewritten and all relocations resolved in
/// place, then the 4-byte zero terminator.
///
/// # Errors
/// Fails on address-arithmetic overflow, an unsupported relocation, or an
/// FDE whose CIE was never placed.
pub fn build_eh_frame(
    artifacts: &[Artifact],
    arch: Arch,
    eh_frame_address: u64,
) -> Result<Vec<u8>, LinkError> {
    let mut out = Vec::new();

    for artifact in artifacts {
        for cie in &artifact.cies {
            let CieDisposition::Canonical { out_offset } = cie.disposition else {
                continue;
            };
            debug_assert_eq!(out.len() as u64, out_offset);
            let mut bytes = cie.bytes(artifact).to_vec();
            for rel in cie.relocs(artifact) {
                patch_record_reloc(
                    artifact,
                    rel,
                    cie.offset,
                    out_offset,
                    arch,
                    eh_frame_address,
                    &mut bytes,
                )?;
            }
            out.extend_from_slice(&bytes);
        }
    }

    for artifact in artifacts {
        for fde in &artifact.fdes {
            let Placement::Included { out_offset } = fde.placement else {
                continue;
            };
            debug_assert_eq!(out.len() as u64, out_offset);
            let mut bytes = fde.bytes(artifact).to_vec();
            rewrite_cie_pointer(artifact, fde, out_offset, &mut bytes)?;
            for rel in fde.relocs(artifact) {
                patch_record_reloc(
                    artifact,
                    rel,
                    fde.offset,
                    out_offset,
                    arch,
                    eh_frame_address,
                    &mut bytes,
                )?;
            }
            out.extend_from_slice(&bytes);
        }
    }

    out.extend_from_slice(&0u32.to_le_bytes());
    Ok(out)
}

/// Pass-through form for object output: the same record order and CIE
/// back-pointer rewrite as the executable pass, but symbol relocations stay
/// unresolved (they are re-emitted separately) and no terminator is written.
///
/// # Errors
/// Fails when an FDE's CIE was never placed.
pub fn build_eh_frame_relocatable(artifacts: &[Artifact]) -> Result<Vec<u8>, LinkError> {
    let mut out = Vec::new();

    for artifact in artifacts {
        for cie in &artifact.cies {
            let CieDisposition::Canonical { out_offset } = cie.disposition else {
                continue;
            };
            debug_assert_eq!(out.len() as u64, out_offset);
            out.extend_from_slice(cie.bytes(artifact));
        }
    }

    for artifact in artifacts {
        for fde in &artifact.fdes {
            let Placement::Included { out_offset } = fde.placement else {
                continue;
            };
            debug_assert_eq!(out.len() as u64, out_offset);
            let mut bytes = fde.bytes(artifact).to_vec();
            rewrite_cie_pointer(artifact, fde, out_offset, &mut bytes)?;
            out.extend_from_slice(&bytes);
        }
    }

    Ok(out)
}

/// Normalized relocation entries for relocatable output, in the order the
/// records land in the merged section.
///
/// # Errors
/// Fails on address-arithmetic overflow or a section symbol with no assigned
/// output section.
pub fn build_eh_frame_relocs(
    artifacts: &[Artifact],
    eh_frame_address: u64,
    out_sections: &[OutSection],
) -> Result<Vec<Rela>, LinkError> {
    let mut out = Vec::with_capacity(crate::layout::count_eh_frame_relocs(artifacts));

    for artifact in artifacts {
        for cie in &artifact.cies {
            let CieDisposition::Canonical { out_offset } = cie.disposition else {
                continue;
            };
            for rel in cie.relocs(artifact) {
                out.push(output_reloc(
                    artifact,
                    rel,
                    cie.offset,
                    out_offset,
                    eh_frame_address,
                    out_sections,
                )?);
            }
        }
    }

    for artifact in artifacts {
        for fde in &artifact.fdes {
            let Placement::Included { out_offset } = fde.placement else {
                continue;
            };
            for rel in fde.relocs(artifact) {
                out.push(output_reloc(
                    artifact,
                    rel,
                    fde.offset,
                    out_offset,
                    eh_frame_address,
                    out_sections,
                )?);
            }
        }
    }

    Ok(out)
}

/// Builds the `.eh_frame_hdr` binary-search index: the fixed header, then
/// one `(initial_location, fde_address)` pair per live FDE, both stored as
/// signed 32-bit distances from the header base and sorted ascending by
/// initial location so an unwinder can bisect the table.
///
/// # Errors
/// Fails on address-arithmetic overflow or a live FDE without relocations
/// (its initial location comes from its first relocation by convention).
pub fn build_eh_frame_hdr(
    artifacts: &[Artifact],
    eh_frame_address: u64,
    eh_frame_hdr_address: u64,
) -> Result<Vec<u8>, LinkError> {
    let count = live_fde_count(artifacts);
    let mut out = Vec::with_capacity(EH_FRAME_HDR_HEADER_SIZE + count * 8);
    out.push(1);
    out.push(DW_EH_PE_PCREL | DW_EH_PE_SDATA4);
    out.push(DW_EH_PE_UDATA4);
    out.push(DW_EH_PE_DATAREL | DW_EH_PE_SDATA4);

    // Pointer to .eh_frame, pc-relative to this field's own position.
    let eh_frame_ptr = eh_frame_address.wrapping_sub(eh_frame_hdr_address.wrapping_add(4)) as u32;
    out.extend_from_slice(&eh_frame_ptr.to_le_bytes());
    let count = u32::try_from(count)
        .map_err(|_| LinkError::Overflow("encoding the search-table entry count"))?;
    out.extend_from_slice(&count.to_le_bytes());

    let mut entries = Vec::with_capacity(count as usize);
    for artifact in artifacts {
        for fde in &artifact.fdes {
            let Placement::Included { out_offset } = fde.placement else {
                continue;
            };
            let Some(first) = fde.relocs(artifact).first() else {
                return Err(LinkError::MissingInitialLocation(fde.offset));
            };
            let symbol = &artifact.symbols[first.r_sym as usize];
            let initial_location = symbol
                .address
                .checked_add_signed(first.r_addend)
                .ok_or(LinkError::Overflow("computing an FDE's initial location"))?;
            let fde_address = eh_frame_address
                .checked_add(out_offset)
                .ok_or(LinkError::Overflow("computing an FDE's output address"))?;
            entries.push(HdrEntry {
                initial_location: initial_location.wrapping_sub(eh_frame_hdr_address) as i32,
                fde_address: fde_address.wrapping_sub(eh_frame_hdr_address) as i32,
            });
        }
    }

    // Initial locations are distinct in well-formed input, so stability
    // does not matter.
    entries.sort_unstable_by_key(|entry| entry.initial_location);
    for entry in entries {
        out.extend_from_slice(&entry.initial_location.to_le_bytes());
        out.extend_from_slice(&entry.fde_address.to_le_bytes());
    }
    Ok(out)
}

#[derive(Debug, Clone, Copy)]
struct HdrEntry {
    initial_location: i32,
    fde_address: i32,
}

/// Resolves one relocation into a mutable copy of its record's bytes.
fn patch_record_reloc(
    artifact: &Artifact,
    rel: &Rela,
    record_offset: u64,
    out_offset: u64,
    arch: Arch,
    eh_frame_address: u64,
    bytes: &mut [u8],
) -> Result<(), LinkError> {
    let within = rel.r_offset - record_offset;
    let place = eh_frame_address
        .checked_add(out_offset)
        .and_then(|address| address.checked_add(within))
        .ok_or(LinkError::Overflow("computing a relocation's output address"))?;
    let symbol = &artifact.symbols[rel.r_sym as usize];
    resolve_reloc(
        arch,
        rel.r_type,
        place,
        symbol.address,
        rel.r_addend,
        &mut bytes[within as usize..],
    )
}

/// Rewrites the back-pointer at byte 4 of an FDE copy: the distance from the
/// pointer field to the (possibly deduplicated) CIE, as unwinders expect it.
fn rewrite_cie_pointer(
    artifact: &Artifact,
    fde: &Fde,
    out_offset: u64,
    bytes: &mut [u8],
) -> Result<(), LinkError> {
    let cie_out = fde
        .cie(artifact)
        .disposition
        .out_offset()
        .ok_or(LinkError::UnplacedCie(fde.offset))?;
    let distance = (out_offset + 4)
        .checked_sub(cie_out)
        .ok_or(LinkError::Overflow("computing an FDE's CIE back-pointer"))?;
    bytes[4..8].copy_from_slice(&(distance as u32).to_le_bytes());
    Ok(())
}

/// One output relocation in the input's `Elf64_Rela` shape. Section symbols
/// are redirected to the output section's own symbol with the addend rebased
/// to the section start.
fn output_reloc(
    artifact: &Artifact,
    rel: &Rela,
    record_offset: u64,
    out_offset: u64,
    eh_frame_address: u64,
    out_sections: &[OutSection],
) -> Result<Rela, LinkError> {
    let within = rel.r_offset - record_offset;
    let r_offset = eh_frame_address
        .checked_add(out_offset)
        .and_then(|address| address.checked_add(within))
        .ok_or(LinkError::Overflow("computing a relocation's output address"))?;

    let symbol = &artifact.symbols[rel.r_sym as usize];
    let (r_sym, r_addend) = if symbol.esym.elf_type() == STT_SECTION {
        let section = symbol
            .out_section
            .and_then(|index| out_sections.get(index as usize))
            .ok_or_else(|| LinkError::MissingOutputSection(symbol.name.clone()))?;
        let rebased = symbol
            .address
            .checked_sub(section.address)
            .and_then(|delta| i64::try_from(delta).ok())
            .ok_or(LinkError::Overflow("rebasing a section-symbol addend"))?;
        let addend = rel
            .r_addend
            .checked_add(rebased)
            .ok_or(LinkError::Overflow("rebasing a section-symbol addend"))?;
        (section.symbol_index, addend)
    } else {
        (symbol.out_symtab_index.unwrap_or(0), rel.r_addend)
    };

    Ok(Rela {
        r_offset,
        r_sym,
        r_type: rel.r_type,
        r_addend,
    })
}
