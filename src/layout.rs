use crate::error::LinkError;
use crate::frame::{Cie, CieDisposition, Placement};
use crate::input::Artifact;

/// What the merged section is destined for. Final images get a 4-byte zero
/// terminator after the last FDE; relocatable output leaves it off so a
/// later link can keep appending records.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputKind {
    Executable,
    Relocatable,
}

/// Deduplicates CIEs across all artifacts, electing one canonical entry per
/// content-equal class and aliasing the rest to its output offset.
/// Artifacts are visited in ingestion order, CIEs in list order, and each is
/// compared against the canonicals accepted so far, in acceptance order.
///
/// Quadratic over canonical entries; unique CIE counts stay single-digit in
/// practice even across large artifact sets.
///
/// Returns the offset cursor positioned after the last canonical CIE.
///
/// # Errors
/// Fails when the output cursor overflows.
pub fn dedup_cies(artifacts: &mut [Artifact]) -> Result<u64, LinkError> {
    let mut offset = 0u64;
    let mut canonical: Vec<(usize, usize)> = Vec::new();

    for artifact_index in 0..artifacts.len() {
        for cie_index in 0..artifacts[artifact_index].cies.len() {
            let mut verdict = None;
            for &(other_artifact, other_cie) in &canonical {
                let this = &artifacts[artifact_index];
                let other = &artifacts[other_artifact];
                if cie_eq(this, &this.cies[cie_index], other, &other.cies[other_cie]) {
                    verdict = other.cies[other_cie].disposition.out_offset();
                    break;
                }
            }
            let cie = &mut artifacts[artifact_index].cies[cie_index];
            match verdict {
                Some(out_offset) => cie.disposition = CieDisposition::Duplicate { out_offset },
                None => {
                    cie.disposition = CieDisposition::Canonical { out_offset: offset };
                    offset = offset
                        .checked_add(cie.out_size())
                        .ok_or(LinkError::Overflow("advancing the CIE output cursor"))?;
                    canonical.push((artifact_index, cie_index));
                }
            }
        }
    }

    Ok(offset)
}

/// Content equality for deduplication: identical payload bytes and the same
/// relocation shape against the same symbol descriptors.
fn cie_eq(a_art: &Artifact, a: &Cie, b_art: &Artifact, b: &Cie) -> bool {
    if a.size != b.size || a.payload(a_art) != b.payload(b_art) {
        return false;
    }
    let a_relocs = a.relocs(a_art);
    let b_relocs = b.relocs(b_art);
    if a_relocs.len() != b_relocs.len() {
        return false;
    }
    a_relocs.iter().zip(b_relocs).all(|(ra, rb)| {
        if ra.r_offset - a.offset != rb.r_offset - b.offset
            || ra.r_type != rb.r_type
            || ra.r_addend != rb.r_addend
        {
            return false;
        }
        let sa = &a_art.symbols[ra.r_sym as usize];
        let sb = &b_art.symbols[rb.r_sym as usize];
        sa.esym == sb.esym && sa.name == sb.name
    })
}

/// Assigns every surviving record its final output offset and returns the
/// merged section size. Must complete before any writer pass runs.
///
/// # Errors
/// Fails when the output cursor overflows.
pub fn calc_eh_frame_size(artifacts: &mut [Artifact], kind: OutputKind) -> Result<u64, LinkError> {
    let mut offset = dedup_cies(artifacts)?;

    for artifact in artifacts.iter_mut() {
        for fde in &mut artifact.fdes {
            if !fde.alive {
                continue;
            }
            fde.placement = Placement::Included { out_offset: offset };
            offset = offset
                .checked_add(fde.out_size())
                .ok_or(LinkError::Overflow("advancing the FDE output cursor"))?;
        }
    }

    if kind == OutputKind::Executable {
        offset = offset
            .checked_add(4)
            .ok_or(LinkError::Overflow("reserving the zero terminator"))?;
    }
    Ok(offset)
}

/// Fixed 12-byte header plus one 8-byte search-table entry per live FDE.
#[must_use]
pub fn calc_eh_frame_hdr_size(artifacts: &[Artifact]) -> u64 {
    crate::writer::EH_FRAME_HDR_HEADER_SIZE as u64 + 8 * live_fde_count(artifacts) as u64
}

#[must_use]
pub fn live_fde_count(artifacts: &[Artifact]) -> usize {
    artifacts
        .iter()
        .map(|artifact| artifact.fdes.iter().filter(|fde| fde.alive).count())
        .sum()
}

/// Relocations the merge will carry over to relocatable output, for
/// pre-sizing the output table.
#[must_use]
pub fn count_eh_frame_relocs(artifacts: &[Artifact]) -> usize {
    let mut count = 0usize;
    for artifact in artifacts {
        for cie in &artifact.cies {
            if cie.disposition.is_canonical() {
                count += cie.rel_count as usize;
            }
        }
        for fde in &artifact.fdes {
            if fde.alive {
                count += fde.rel_count as usize;
            }
        }
    }
    count
}

#[cfg(test)]
mod tests {
    use crate::frame::{CieDisposition, Placement};
    use crate::input::{Artifact, ElfSym, Rela, Symbol};
    use crate::layout::{
        calc_eh_frame_hdr_size, calc_eh_frame_size, count_eh_frame_relocs, dedup_cies, OutputKind,
    };

    fn record(id: u32, payload: &[u8]) -> Vec<u8> {
        let mut out = (payload.len() as u32 + 4).to_le_bytes().to_vec();
        out.extend_from_slice(&id.to_le_bytes());
        out.extend_from_slice(payload);
        out
    }

    fn symbol(name: &str, value: u64) -> Symbol {
        Symbol {
            name: name.to_string(),
            esym: ElfSym {
                st_info: 0x12,
                st_value: value,
                ..ElfSym::default()
            },
            address: value,
            out_symtab_index: None,
            out_section: None,
        }
    }

    /// One CIE plus one live FDE referencing it, with one relocation on the
    /// FDE's initial-location field.
    fn one_function_artifact(name: &str, cie_payload: &[u8], address: u64) -> Artifact {
        let mut data = record(0, cie_payload);
        let fde_offset = data.len() as u64;
        data.extend_from_slice(&record((fde_offset + 4) as u32, &[0; 16]));
        let relocs = vec![Rela {
            r_offset: fde_offset + 8,
            r_sym: 0,
            r_type: object::elf::R_X86_64_PC32,
            r_addend: 0,
        }];
        Artifact::parse(name, data, relocs, vec![symbol("f", address)]).expect("parse")
    }

    #[test]
    fn deduplicates_byte_identical_cies_across_artifacts() {
        let payload = [1, b'z', b'R', 0, 1, 0x78, 0x10, 0x1b];
        let mut artifacts = vec![
            one_function_artifact("a.o", &payload, 0x1000),
            one_function_artifact("b.o", &payload, 0x2000),
        ];

        let after_cies = dedup_cies(&mut artifacts).expect("dedup");
        assert_eq!(after_cies, 16);
        assert_eq!(
            artifacts[0].cies[0].disposition,
            CieDisposition::Canonical { out_offset: 0 }
        );
        assert_eq!(
            artifacts[1].cies[0].disposition,
            CieDisposition::Duplicate { out_offset: 0 }
        );
    }

    #[test]
    fn keeps_cies_with_differing_payloads_apart() {
        let mut artifacts = vec![
            one_function_artifact("a.o", &[1, 0, 0, 0, 0, 0, 0, 0], 0x1000),
            one_function_artifact("b.o", &[2, 0, 0, 0, 0, 0, 0, 0], 0x2000),
        ];

        dedup_cies(&mut artifacts).expect("dedup");
        assert_eq!(
            artifacts[0].cies[0].disposition,
            CieDisposition::Canonical { out_offset: 0 }
        );
        assert_eq!(
            artifacts[1].cies[0].disposition,
            CieDisposition::Canonical { out_offset: 16 }
        );
    }

    #[test]
    fn keeps_cies_with_differing_relocation_shapes_apart() {
        let payload = [1, b'z', b'P', b'R', 0, 1, 0x78, 0x10];
        let build = |name: &str, addend: i64| {
            let mut data = record(0, &payload);
            let fde_offset = data.len() as u64;
            data.extend_from_slice(&record((fde_offset + 4) as u32, &[0; 16]));
            let relocs = vec![
                Rela {
                    r_offset: 8,
                    r_sym: 0,
                    r_type: object::elf::R_X86_64_64,
                    r_addend: addend,
                },
                Rela {
                    r_offset: fde_offset + 8,
                    r_sym: 0,
                    r_type: object::elf::R_X86_64_PC32,
                    r_addend: 0,
                },
            ];
            Artifact::parse(name, data, relocs, vec![symbol("personality", 0x500)]).expect("parse")
        };
        let mut artifacts = vec![build("a.o", 0), build("b.o", 8)];

        dedup_cies(&mut artifacts).expect("dedup");
        assert!(artifacts[0].cies[0].disposition.is_canonical());
        assert!(artifacts[1].cies[0].disposition.is_canonical());
    }

    #[test]
    fn assigns_monotonic_offsets_and_reserves_the_terminator() {
        let payload = [1, b'z', b'R', 0, 1, 0x78, 0x10, 0x1b];
        let mut artifacts = vec![
            one_function_artifact("a.o", &payload, 0x1000),
            one_function_artifact("b.o", &payload, 0x2000),
        ];

        let total = calc_eh_frame_size(&mut artifacts, OutputKind::Executable).expect("layout");
        // One canonical CIE (16) + two FDEs (24 each) + terminator.
        assert_eq!(total, 16 + 24 + 24 + 4);
        assert_eq!(
            artifacts[0].fdes[0].placement,
            Placement::Included { out_offset: 16 }
        );
        assert_eq!(
            artifacts[1].fdes[0].placement,
            Placement::Included { out_offset: 40 }
        );
    }

    #[test]
    fn relocatable_output_has_no_terminator() {
        let payload = [1, b'z', b'R', 0, 1, 0x78, 0x10, 0x1b];
        let mut artifacts = vec![one_function_artifact("a.o", &payload, 0x1000)];
        let total = calc_eh_frame_size(&mut artifacts, OutputKind::Relocatable).expect("layout");
        assert_eq!(total, 16 + 24);
    }

    #[test]
    fn dead_fdes_do_not_advance_the_cursor() {
        let payload = [1, b'z', b'R', 0, 1, 0x78, 0x10, 0x1b];
        let mut artifacts = vec![
            one_function_artifact("a.o", &payload, 0x1000),
            one_function_artifact("b.o", &payload, 0x2000),
        ];
        artifacts[0].fdes[0].alive = false;

        let total = calc_eh_frame_size(&mut artifacts, OutputKind::Executable).expect("layout");
        assert_eq!(total, 16 + 24 + 4);
        assert_eq!(artifacts[0].fdes[0].placement, Placement::Excluded);
        assert_eq!(
            artifacts[1].fdes[0].placement,
            Placement::Included { out_offset: 16 }
        );
    }

    #[test]
    fn sizes_the_search_table_from_live_fdes() {
        let payload = [1, b'z', b'R', 0, 1, 0x78, 0x10, 0x1b];
        let mut artifacts = vec![
            one_function_artifact("a.o", &payload, 0x1000),
            one_function_artifact("b.o", &payload, 0x2000),
        ];
        assert_eq!(calc_eh_frame_hdr_size(&artifacts), 12 + 16);

        artifacts[1].fdes[0].alive = false;
        assert_eq!(calc_eh_frame_hdr_size(&artifacts), 12 + 8);
    }

    #[test]
    fn counts_relocations_of_surviving_records_only() {
        let payload = [1, b'z', b'R', 0, 1, 0x78, 0x10, 0x1b];
        let mut artifacts = vec![
            one_function_artifact("a.o", &payload, 0x1000),
            one_function_artifact("b.o", &payload, 0x2000),
        ];
        artifacts[1].fdes[0].alive = false;
        calc_eh_frame_size(&mut artifacts, OutputKind::Executable).expect("layout");

        // The duplicate CIE and the dead FDE contribute nothing.
        assert_eq!(count_eh_frame_relocs(&artifacts), 1);
    }
}
