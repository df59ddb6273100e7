use crate::error::LinkError;
use crate::frame::{Cie, CieDisposition, Fde, Placement, Record, RecordKind, RecordScanner};

/// Raw `Elf64_Sym` image of an input symbol. CIE deduplication compares
/// these whole, so the full entry is kept, not just the fields the merge
/// itself reads.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ElfSym {
    pub st_name: u32,
    pub st_info: u8,
    pub st_other: u8,
    pub st_shndx: u16,
    pub st_value: u64,
    pub st_size: u64,
}

impl ElfSym {
    #[must_use]
    pub fn elf_type(&self) -> u8 {
        self.st_info & 0xf
    }
}

/// One `Elf64_Rela`-shaped relocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Rela {
    pub r_offset: u64,
    pub r_sym: u32,
    pub r_type: u32,
    pub r_addend: i64,
}

impl Rela {
    /// Little-endian `Elf64_Rela` wire form.
    #[must_use]
    pub fn to_bytes(&self) -> [u8; 24] {
        let mut out = [0u8; 24];
        out[0..8].copy_from_slice(&self.r_offset.to_le_bytes());
        let r_info = (u64::from(self.r_sym) << 32) | u64::from(self.r_type);
        out[8..16].copy_from_slice(&r_info.to_le_bytes());
        out[16..24].copy_from_slice(&self.r_addend.to_le_bytes());
        out
    }
}

/// Resolved view of an input symbol, filled in by the link driver: the final
/// virtual address and where the symbol landed in the output symbol table.
#[derive(Debug, Clone, Default)]
pub struct Symbol {
    pub name: String,
    pub esym: ElfSym,
    pub address: u64,
    pub out_symtab_index: Option<u32>,
    /// Index into the output-section table, for section symbols.
    pub out_section: Option<u32>,
}

/// One output section as the relocation-table writer needs it: its final
/// address and the output symtab index of its section symbol.
#[derive(Debug, Clone, Copy, Default)]
pub struct OutSection {
    pub address: u64,
    pub symbol_index: u32,
}

/// One input object's `.eh_frame` contribution. Cross-references are indices
/// into the vectors here; nothing owns anything across artifacts.
#[derive(Debug, Clone, Default)]
pub struct Artifact {
    pub name: String,
    pub data: Vec<u8>,
    pub relocs: Vec<Rela>,
    pub symbols: Vec<Symbol>,
    pub cies: Vec<Cie>,
    pub fdes: Vec<Fde>,
}

impl Artifact {
    /// Scans `data` into CIE/FDE entries, attaches each record's relocation
    /// run and resolves every FDE's CIE back-reference. All FDEs start out
    /// alive; the caller flips liveness before layout.
    ///
    /// # Errors
    /// Fails on the unsupported 64-bit length form, truncated records, a
    /// relocation against a missing symbol, or an FDE whose CIE pointer
    /// matches no CIE in this artifact.
    pub fn parse(
        name: impl Into<String>,
        data: Vec<u8>,
        mut relocs: Vec<Rela>,
        symbols: Vec<Symbol>,
    ) -> Result<Self, LinkError> {
        relocs.sort_by_key(|rel| rel.r_offset);
        for rel in &relocs {
            if rel.r_sym as usize >= symbols.len() {
                return Err(LinkError::UnknownSymbol(rel.r_sym));
            }
        }

        let mut artifact = Artifact {
            name: name.into(),
            data,
            relocs,
            symbols,
            cies: Vec::new(),
            fdes: Vec::new(),
        };

        let mut pending_fdes = Vec::new();
        for record in RecordScanner::new(&artifact.data) {
            let record = record?;
            let (rel_index, rel_count) = reloc_run(&artifact.relocs, &record);
            match record.kind {
                RecordKind::Cie => artifact.cies.push(Cie {
                    offset: record.offset,
                    size: record.size,
                    rel_index,
                    rel_count,
                    disposition: CieDisposition::default(),
                }),
                RecordKind::Fde => {
                    // The CIE-pointer field must be inside the record.
                    if record.size < 4 {
                        return Err(LinkError::TruncatedRecord(record.offset));
                    }
                    pending_fdes.push(Fde {
                        offset: record.offset,
                        size: record.size,
                        cie_index: 0,
                        rel_index,
                        rel_count,
                        alive: true,
                        placement: Placement::default(),
                    });
                }
            }
        }

        for mut fde in pending_fdes {
            let pointer = fde.cie_pointer(&artifact);
            let cie_offset = (fde.offset + 4).checked_sub(u64::from(pointer)).ok_or(
                LinkError::UnmatchedCie {
                    offset: fde.offset,
                    pointer,
                },
            )?;
            let index = artifact
                .cies
                .iter()
                .position(|cie| cie.offset == cie_offset)
                .ok_or(LinkError::UnmatchedCie {
                    offset: fde.offset,
                    pointer,
                })?;
            fde.cie_index = index as u32;
            artifact.fdes.push(fde);
        }

        Ok(artifact)
    }
}

/// The contiguous run of relocations whose offsets land inside one record,
/// as an (index, count) pair into the artifact's sorted relocation table.
fn reloc_run(relocs: &[Rela], record: &Record) -> (u32, u32) {
    let start = record.offset;
    let end = record.offset + 4 + record.size;
    let first = relocs.partition_point(|rel| rel.r_offset < start);
    let past = relocs.partition_point(|rel| rel.r_offset < end);
    (first as u32, (past - first) as u32)
}

#[cfg(test)]
mod tests {
    use crate::error::LinkError;
    use crate::frame::RecordKind;
    use crate::input::{Artifact, Rela, Symbol};

    fn record(id: u32, payload: &[u8]) -> Vec<u8> {
        let mut out = (payload.len() as u32 + 4).to_le_bytes().to_vec();
        out.extend_from_slice(&id.to_le_bytes());
        out.extend_from_slice(payload);
        out
    }

    fn rela(r_offset: u64) -> Rela {
        Rela {
            r_offset,
            r_sym: 0,
            r_type: 2,
            r_addend: 0,
        }
    }

    #[test]
    fn partitions_relocations_by_record() {
        // CIE [0, 0x10), FDE [0x10, 0x28) pointing back at the CIE.
        let mut data = record(0, &[0; 8]);
        data.extend_from_slice(&record(0x14, &[0; 16]));
        let relocs = vec![rela(0x08), rela(0x18), rela(0x20)];
        let symbols = vec![Symbol::default()];

        let artifact = Artifact::parse("a.o", data, relocs, symbols).expect("parse");
        assert_eq!(artifact.cies.len(), 1);
        assert_eq!(artifact.fdes.len(), 1);
        assert_eq!(
            (artifact.cies[0].rel_index, artifact.cies[0].rel_count),
            (0, 1)
        );
        assert_eq!(
            (artifact.fdes[0].rel_index, artifact.fdes[0].rel_count),
            (1, 2)
        );
        assert_eq!(artifact.fdes[0].cie_index, 0);
        assert!(artifact.fdes[0].alive);
    }

    #[test]
    fn resolves_fde_references_to_a_later_scanned_cie_list() {
        // Two CIEs; the FDE points at the second one.
        let mut data = record(0, &[0; 8]);
        let second_cie = data.len() as u64;
        data.extend_from_slice(&record(0, &[1; 8]));
        let fde_offset = data.len() as u64;
        let pointer = (fde_offset + 4 - second_cie) as u32;
        data.extend_from_slice(&record(pointer, &[0; 8]));

        let artifact = Artifact::parse("a.o", data, Vec::new(), Vec::new()).expect("parse");
        assert_eq!(artifact.fdes[0].cie_index, 1);
    }

    #[test]
    fn rejects_an_unmatched_cie_pointer() {
        let mut data = record(0, &[0; 8]);
        data.extend_from_slice(&record(0xdead, &[0; 8]));
        let err = Artifact::parse("a.o", data, Vec::new(), Vec::new()).expect_err("must fail");
        assert!(matches!(err, LinkError::UnmatchedCie { .. }));
    }

    #[test]
    fn rejects_a_relocation_against_a_missing_symbol() {
        let data = record(0, &[0; 8]);
        let err = Artifact::parse("a.o", data, vec![rela(4)], Vec::new()).expect_err("must fail");
        assert!(matches!(err, LinkError::UnknownSymbol(0)));
    }

    #[test]
    fn encodes_the_rela_wire_form() {
        let rel = Rela {
            r_offset: 0x1122,
            r_sym: 7,
            r_type: 2,
            r_addend: -8,
        };
        let bytes = rel.to_bytes();
        assert_eq!(&bytes[0..8], &0x1122u64.to_le_bytes());
        assert_eq!(&bytes[8..16], &((7u64 << 32) | 2).to_le_bytes());
        assert_eq!(&bytes[16..24], &(-8i64).to_le_bytes());
    }

    #[test]
    fn keeps_scanner_kinds_for_mixed_blobs() {
        let mut data = record(0, &[0; 4]);
        data.extend_from_slice(&record(16, &[0; 4]));
        let artifact = Artifact::parse("a.o", data.clone(), Vec::new(), Vec::new()).expect("parse");
        let kinds: Vec<RecordKind> = crate::frame::RecordScanner::new(&data)
            .map(|r| r.expect("record").kind)
            .collect();
        assert_eq!(kinds, vec![RecordKind::Cie, RecordKind::Fde]);
        assert_eq!(artifact.cies.len(), 1);
        assert_eq!(artifact.fdes.len(), 1);
    }
}
