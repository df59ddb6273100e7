use crate::error::LinkError;

/// Target architectures the resolver knows how to patch. Adding one means
/// adding a match arm in `resolve_reloc`, not changing the calling contract.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Arch {
    X86_64,
}

impl std::fmt::Display for Arch {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Arch::X86_64 => f.write_str("x86-64"),
        }
    }
}

/// Patches one relocation's byte window at the start of `buf`.
///
/// `p` is the final virtual address of the patched bytes, `s` the referenced
/// symbol's resolved address and `a` the addend. Narrowing a 64-bit result
/// into a 32-bit field truncates to the low 32 bits; range validation is a
/// caller concern.
///
/// # Errors
/// Fails when `s + a` overflows, the window does not fit inside `buf`, or
/// the relocation type is not implemented for `arch`.
pub fn resolve_reloc(
    arch: Arch,
    r_type: u32,
    p: u64,
    s: u64,
    a: i64,
    buf: &mut [u8],
) -> Result<(), LinkError> {
    match arch {
        Arch::X86_64 => resolve_x86_64(r_type, p, s, a, buf),
    }
}

fn resolve_x86_64(r_type: u32, p: u64, s: u64, a: i64, buf: &mut [u8]) -> Result<(), LinkError> {
    use object::elf::{R_X86_64_32, R_X86_64_64, R_X86_64_PC32, R_X86_64_PC64};

    let value = s
        .checked_add_signed(a)
        .ok_or(LinkError::Overflow("adding a relocation addend"))?;
    match r_type {
        R_X86_64_32 => write_field(buf, &(value as u32).to_le_bytes(), p),
        R_X86_64_64 => write_field(buf, &value.to_le_bytes(), p),
        R_X86_64_PC32 => write_field(buf, &(value.wrapping_sub(p) as u32).to_le_bytes(), p),
        R_X86_64_PC64 => write_field(buf, &value.wrapping_sub(p).to_le_bytes(), p),
        other => Err(LinkError::UnsupportedRelocation {
            arch: Arch::X86_64,
            r_type: other,
        }),
    }
}

fn write_field(buf: &mut [u8], bytes: &[u8], place: u64) -> Result<(), LinkError> {
    let Some(window) = buf.get_mut(..bytes.len()) else {
        return Err(LinkError::RelocOutOfBounds(place));
    };
    window.copy_from_slice(bytes);
    Ok(())
}
