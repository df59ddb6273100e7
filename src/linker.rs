use crate::cli::Args;
use crate::frame::{format_cie, format_fde};
use crate::input::{Artifact, ElfSym, Rela, Symbol};
use crate::layout::{calc_eh_frame_size, count_eh_frame_relocs, live_fde_count, OutputKind};
use crate::writer::build_eh_frame_relocatable;

use anyhow::{bail, Context, Result};
use object::elf::{
    STB_GLOBAL, STB_LOCAL, STB_WEAK, STT_FILE, STT_FUNC, STT_NOTYPE, STT_OBJECT, STT_SECTION,
    STT_TLS,
};
use object::{Object, ObjectSection, ObjectSymbol, RelocationFlags, RelocationTarget, SymbolKind};

pub fn run(args: Args) -> Result<()> {
    if args.inputs.is_empty() {
        bail!("no input files");
    }

    let mut artifacts = Vec::new();
    for input in &args.inputs {
        let bytes = std::fs::read(input).with_context(|| format!("failed to read {input}"))?;
        let artifact =
            load_artifact(input, &bytes).with_context(|| format!("failed to load {input}"))?;
        if args.verbose {
            println!(
                "parsed {input}: {} CIEs, {} FDEs, {} relocations",
                artifact.cies.len(),
                artifact.fdes.len(),
                artifact.relocs.len()
            );
        }
        artifacts.push(artifact);
    }

    let total = calc_eh_frame_size(&mut artifacts, OutputKind::Relocatable)?;
    if args.verbose {
        let canonical = artifacts
            .iter()
            .flat_map(|artifact| &artifact.cies)
            .filter(|cie| cie.disposition.is_canonical())
            .count();
        println!(
            "layout: {} unique CIE(s), {} live FDE(s), {} relocation(s), {total} bytes",
            canonical,
            live_fde_count(&artifacts),
            count_eh_frame_relocs(&artifacts)
        );
    }

    if args.list {
        for artifact in &artifacts {
            for cie in &artifact.cies {
                println!("{}", format_cie(artifact, cie));
            }
            for fde in &artifact.fdes {
                println!("{}", format_fde(artifact, fde));
            }
        }
    }

    if let Some(output) = &args.output {
        let payload = build_eh_frame_relocatable(&artifacts)?;
        std::fs::write(output, payload).with_context(|| format!("failed to write {output}"))?;
        if args.verbose {
            println!("wrote output: {output}");
        }
    }
    Ok(())
}

/// Extracts one object's `.eh_frame` contribution: section bytes, the
/// section's relocations and the symbol table. Objects without `.eh_frame`
/// contribute an empty artifact.
fn load_artifact(name: &str, bytes: &[u8]) -> Result<Artifact> {
    let file = object::File::parse(bytes).context("not a recognized object file")?;

    let Some(section) = file.section_by_name(".eh_frame") else {
        return Ok(Artifact {
            name: name.to_string(),
            ..Artifact::default()
        });
    };
    let data = section.uncompressed_data()?.into_owned();

    let mut relocs = Vec::new();
    for (r_offset, relocation) in section.relocations() {
        let RelocationFlags::Elf { r_type } = relocation.flags() else {
            bail!("non-ELF relocation in .eh_frame");
        };
        let RelocationTarget::Symbol(symbol_index) = relocation.target() else {
            bail!("unsupported relocation target in .eh_frame");
        };
        relocs.push(Rela {
            r_offset,
            r_sym: u32::try_from(symbol_index.0).context("symbol index out of range")?,
            r_type,
            r_addend: relocation.addend(),
        });
    }

    // Keyed by the indices the relocations carry; slot 0 stays the null
    // symbol.
    let mut symbols: Vec<Symbol> = Vec::new();
    for symbol in file.symbols() {
        let index = symbol.index().0;
        if symbols.len() <= index {
            symbols.resize_with(index + 1, Symbol::default);
        }
        symbols[index] = Symbol {
            name: symbol.name().unwrap_or_default().to_string(),
            esym: ElfSym {
                st_name: 0,
                st_info: st_info_of(&symbol),
                st_other: 0,
                st_shndx: symbol.section_index().map_or(0, |section| section.0 as u16),
                st_value: symbol.address(),
                st_size: symbol.size(),
            },
            address: symbol.address(),
            out_symtab_index: None,
            out_section: None,
        };
    }

    Ok(Artifact::parse(name, data, relocs, symbols)?)
}

fn st_info_of(symbol: &object::Symbol<'_, '_>) -> u8 {
    let bind = if symbol.is_weak() {
        STB_WEAK
    } else if symbol.is_global() {
        STB_GLOBAL
    } else {
        STB_LOCAL
    };
    let kind = match symbol.kind() {
        SymbolKind::Text => STT_FUNC,
        SymbolKind::Data => STT_OBJECT,
        SymbolKind::Section => STT_SECTION,
        SymbolKind::File => STT_FILE,
        SymbolKind::Tls => STT_TLS,
        _ => STT_NOTYPE,
    };
    (bind << 4) | (kind & 0xf)
}
