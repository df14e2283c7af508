//! PE header and export-table parsing.
//!
//! Two distinct buffers are parsed in this harness and they are *not* laid out the
//! same way: a module image read out of a live process via `ReadProcessMemory` is
//! laid out by virtual address (an RVA is simply an offset into that buffer), while a
//! module's on-disk file is laid out by file offset (an RVA must be translated through
//! the section table). The entrypoint and export-table walks below operate on the
//! in-memory layout, matching what `ProcessMemory` hands them; the on-disk debug-symbol
//! fallback in `crate::module` doesn't parse the PE file at all — it hands the path to
//! `dbghelp` and lets `SymLoadModuleExA` do that work.

use crate::error::{EngineError, Result};

const PE_SIGNATURE: u32 = 0x0000_4550; // "PE\0\0"
const MAGIC_PE32: u16 = 0x10b;
const MAGIC_PE32_PLUS: u16 = 0x20b;

fn u16_at(buf: &[u8], offset: usize) -> Result<u16> {
    buf.get(offset..offset + 2)
        .map(|b| u16::from_le_bytes([b[0], b[1]]))
        .ok_or_else(|| EngineError::Memory(format!("PE read out of bounds at {offset:#x}")))
}

fn u32_at(buf: &[u8], offset: usize) -> Result<u32> {
    buf.get(offset..offset + 4)
        .map(|b| u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
        .ok_or_else(|| EngineError::Memory(format!("PE read out of bounds at {offset:#x}")))
}

struct PeHeader {
    /// Offset (within the same buffer) of the start of the PE signature.
    pe_offset: usize,
    magic: u16,
}

fn locate_pe_header(image: &[u8]) -> Result<PeHeader> {
    let e_lfanew = u32_at(image, 0x3C)? as usize;
    let signature = u32_at(image, e_lfanew)?;
    if signature != PE_SIGNATURE {
        return Err(EngineError::Memory("PE signature mismatch".into()));
    }
    let magic = u16_at(image, e_lfanew + 0x18)?;
    if magic != MAGIC_PE32 && magic != MAGIC_PE32_PLUS {
        return Err(EngineError::Memory(format!("unknown PE optional header magic {magic:#x}")));
    }
    Ok(PeHeader { pe_offset: e_lfanew, magic })
}

/// Resolves a module's entrypoint RVA from its first 4 KiB of header bytes.
pub fn entrypoint_rva(header_bytes: &[u8]) -> Result<u32> {
    let pe = locate_pe_header(header_bytes)?;
    // AddressOfEntryPoint sits at the same offset for PE32 and PE32+.
    u32_at(header_bytes, pe.pe_offset + 0x18 + 16)
}

/// Linearly scans the export name-pointer table for `symbol` and returns its RVA, the
/// in-memory-image equivalent of `GetProcAddress` for a process we don't own.
pub fn export_rva(image: &[u8], symbol: &str) -> Result<Option<u32>> {
    let pe = locate_pe_header(image);
    let pe = match pe {
        Ok(pe) => pe,
        Err(_) => return Ok(None),
    };

    let export_dir_offset = match pe.magic {
        MAGIC_PE32 => pe.pe_offset + 0x18 + 96,
        MAGIC_PE32_PLUS => pe.pe_offset + 0x18 + 112,
        _ => unreachable!(),
    };
    let export_table_rva = u32_at(image, export_dir_offset)?;
    if export_table_rva == 0 {
        return Ok(None);
    }
    let export_table = export_table_rva as usize;

    let num_names = u32_at(image, export_table + 24)? as usize;
    let address_table_rva = u32_at(image, export_table + 28)? as usize;
    let name_ptr_table_rva = u32_at(image, export_table + 32)? as usize;
    let ordinal_table_rva = u32_at(image, export_table + 36)? as usize;

    for i in 0..num_names {
        let name_rva = u32_at(image, name_ptr_table_rva + i * 4)? as usize;
        let name = read_c_str(image, name_rva)?;
        if name == symbol {
            let ordinal = u16_at(image, ordinal_table_rva + i * 2)? as usize;
            let rva = u32_at(image, address_table_rva + ordinal * 4)?;
            return Ok(Some(rva));
        }
    }

    Ok(None)
}

fn read_c_str(buf: &[u8], offset: usize) -> Result<&str> {
    let bytes = buf
        .get(offset..)
        .ok_or_else(|| EngineError::Memory(format!("PE read out of bounds at {offset:#x}")))?;
    let len = memchr::memchr(0, bytes).unwrap_or(bytes.len());
    std::str::from_utf8(&bytes[..len])
        .map_err(|_| EngineError::Memory("export name is not valid UTF-8".into()))
}

#[cfg(test)]
pub mod test_image {
    //! Builds minimal synthetic PE32+ byte buffers for unit tests, since these tests
    //! run without a real Windows module to read from.

    pub fn with_entrypoint(entry_rva: u32) -> Vec<u8> {
        let mut image = vec![0u8; 0x200];
        let e_lfanew = 0x80u32;
        image[0x3C..0x40].copy_from_slice(&e_lfanew.to_le_bytes());
        let pe = e_lfanew as usize;
        image[pe..pe + 4].copy_from_slice(&0x0000_4550u32.to_le_bytes());
        image[pe + 0x18..pe + 0x1A].copy_from_slice(&0x20bu16.to_le_bytes());
        image[pe + 0x18 + 16..pe + 0x18 + 20].copy_from_slice(&entry_rva.to_le_bytes());
        image
    }

    pub fn with_export(name: &str, rva: u32) -> Vec<u8> {
        let mut image = vec![0u8; 0x400];
        let e_lfanew = 0x80u32;
        image[0x3C..0x40].copy_from_slice(&e_lfanew.to_le_bytes());
        let pe = e_lfanew as usize;
        image[pe..pe + 4].copy_from_slice(&0x0000_4550u32.to_le_bytes());
        image[pe + 0x18..pe + 0x1A].copy_from_slice(&0x20bu16.to_le_bytes());

        let export_table = 0x200usize;
        image[pe + 0x18 + 112..pe + 0x18 + 116].copy_from_slice(&(export_table as u32).to_le_bytes());

        let address_table = export_table + 64;
        let name_ptr_table = address_table + 4;
        let ordinal_table = name_ptr_table + 4;
        let name_bytes_offset = ordinal_table + 4;

        image[export_table + 24..export_table + 28].copy_from_slice(&1u32.to_le_bytes());
        image[export_table + 28..export_table + 32].copy_from_slice(&(address_table as u32).to_le_bytes());
        image[export_table + 32..export_table + 36].copy_from_slice(&(name_ptr_table as u32).to_le_bytes());
        image[export_table + 36..export_table + 40].copy_from_slice(&(ordinal_table as u32).to_le_bytes());

        image[address_table..address_table + 4].copy_from_slice(&rva.to_le_bytes());
        image[name_ptr_table..name_ptr_table + 4]
            .copy_from_slice(&(name_bytes_offset as u32).to_le_bytes());
        image[ordinal_table..ordinal_table + 2].copy_from_slice(&0u16.to_le_bytes());

        let name_bytes = name.as_bytes();
        image[name_bytes_offset..name_bytes_offset + name_bytes.len()].copy_from_slice(name_bytes);

        image
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn entrypoint_rva_matches_constructed_header() {
        let image = test_image::with_entrypoint(0x1234);
        assert_eq!(entrypoint_rva(&image).unwrap(), 0x1234);
    }

    #[test]
    fn export_rva_finds_matching_symbol() {
        let image = test_image::with_export("FuzzMe", 0x5678);
        assert_eq!(export_rva(&image, "FuzzMe").unwrap(), Some(0x5678));
    }

    #[test]
    fn export_rva_returns_none_for_missing_symbol() {
        let image = test_image::with_export("FuzzMe", 0x5678);
        assert_eq!(export_rva(&image, "NotThere").unwrap(), None);
    }

    #[test]
    fn bad_signature_is_an_error_for_entrypoint_lookup() {
        let mut image = vec![0u8; 0x100];
        image[0x3C..0x40].copy_from_slice(&0x40u32.to_le_bytes());
        assert!(entrypoint_rva(&image).is_err());
    }
}
