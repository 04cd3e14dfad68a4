//! Loaded-module decoding. Module records come from the ModuleList stream,
//! but everything interesting about a module (sections, exported symbols,
//! the exception directory) is parsed straight out of the reconstructed
//! memory at its image base, exactly where the loader put it.
use std::collections::BTreeMap;

use scroll::ctx::SizeWith;
use scroll::{Pread, LE};
use tracing::{debug, warn};

use crate::error::{Error, Result};
use crate::memory::AddressSpace;
use crate::reader::{read_minidump_string, stream_bytes};
use crate::structs::{
    CoffFileHeader, DataDirectory, ExportDirectory, FixedFileInfo, LocationDescriptor, ModuleEntry,
    RuntimeFunctionEntry, DATA_DIRECTORY_OFFSET_PE32, DATA_DIRECTORY_OFFSET_PE32_PLUS,
    DIRECTORY_COUNT_OFFSET_PE32, DIRECTORY_COUNT_OFFSET_PE32_PLUS, DIRECTORY_ENTRY_EXCEPTION,
    DIRECTORY_ENTRY_EXPORT, DOS_E_LFANEW_OFFSET, DOS_MAGIC, OPTIONAL_HEADER_MAGIC_PE32,
    OPTIONAL_HEADER_MAGIC_PE32_PLUS, OPTIONAL_HEADER_SIZE_PE32, OPTIONAL_HEADER_SIZE_PE32_PLUS,
    PE_SIGNATURE,
};
use crate::PointerWidth;

/// Module display names longer than this are assumed corrupt and clamped.
const MAX_MODULE_NAME_CHARS: u32 = 512;
/// Export names longer than this are assumed corrupt and truncated.
const MAX_EXPORT_NAME_BYTES: usize = 2048;
/// A PE image cannot carry more sections than this.
const MAX_SECTIONS: u16 = 96;
/// Plausibility ceiling for named exports in one module.
const MAX_EXPORT_NAMES: u32 = 0x10_0000;
/// Plausibility ceiling for exception-directory entries in one module.
const MAX_RUNTIME_FUNCTIONS: u32 = 0x10_0000;

const SECTION_HEADER_SIZE: u64 = 40;

/// One entry of a module's section table.
#[derive(Debug, Clone)]
pub struct ModuleSection {
    /// The raw 8-byte section name, trailing NULs trimmed.
    pub name: String,
    /// Virtual address of the section, already rebased on the image base.
    pub address: u64,
    /// Virtual size of the section.
    pub size: u64,
}

/// One named export.
#[derive(Debug, Clone)]
pub struct Symbol {
    pub name: String,
    /// Absolute address of the exported function.
    pub address: u64,
}

/// A module loaded in the dumped process, decoded once and cached by the
/// reader. 32-bit modules carry no unwind table; 64-bit modules without an
/// exception directory carry [`None`] as well.
#[derive(Debug, Clone)]
pub struct Module {
    /// The module path as recorded in the dump.
    pub name: String,
    /// Image base address.
    pub base: u64,
    /// Declared image size.
    pub size: u64,
    /// Whether the module name ends in `.exe`, marking the process
    /// executable as opposed to a library.
    pub is_executable_image: bool,
    /// The fixed file-version record from the module entry.
    pub version_info: FixedFileInfo,
    pub sections: Vec<ModuleSection>,
    pub symbols: Vec<Symbol>,
    /// The exception directory, ordered by start address, used by the 64-bit
    /// stack walker.
    pub unwind_table: Option<Vec<RuntimeFunctionEntry>>,
    /// PE and module-record metadata by name.
    pub attributes: BTreeMap<&'static str, u64>,
}

impl Module {
    /// One past the last address of the image.
    pub fn end(&self) -> u64 {
        self.base + self.size
    }

    pub fn contains(&self, addr: u64) -> bool {
        addr >= self.base && addr < self.end()
    }

    /// The file name without its directory part.
    pub fn file_name(&self) -> &str {
        self.name
            .rsplit(|c| c == '\\' || c == '/')
            .next()
            .unwrap_or(&self.name)
    }

    /// Find the exception-directory entry covering the image-relative
    /// address `rva`.
    pub fn find_function(&self, rva: u32) -> Option<&RuntimeFunctionEntry> {
        let table = self.unwind_table.as_deref()?;
        let index = table
            .partition_point(|function| function.start_address <= rva)
            .checked_sub(1)?;
        let function = &table[index];
        (rva < function.end_address).then_some(function)
    }

    /// Decode one module from its list entry: display name from the dump
    /// file, then DOS/PE/optional headers, sections, exports and (64-bit)
    /// the exception directory from the reconstructed memory.
    fn decode(
        file: &[u8],
        space: &AddressSpace<'_>,
        entry: &ModuleEntry,
        width: PointerWidth,
    ) -> Result<Self> {
        let name = read_minidump_string(file, entry.module_name_rva, MAX_MODULE_NAME_CHARS)?;
        let is_executable_image = name.to_ascii_lowercase().ends_with(".exe");

        let mut attributes = BTreeMap::new();
        attributes.insert("checksum", u64::from(entry.checksum));
        attributes.insert("time_date_stamp", u64::from(entry.time_date_stamp));
        attributes.insert("size_of_image", u64::from(entry.size_of_image));

        let mut module = Self {
            name,
            base: entry.base_of_image,
            size: u64::from(entry.size_of_image),
            is_executable_image,
            version_info: entry.version_info,
            sections: Vec::new(),
            symbols: Vec::new(),
            unwind_table: None,
            attributes,
        };
        module.decode_pe(space, width)?;

        Ok(module)
    }

    fn decode_pe(&mut self, space: &AddressSpace<'_>, width: PointerWidth) -> Result<()> {
        let base = self.base;

        let dos_magic = space.read_bytes(base, 2)?;
        if dos_magic != DOS_MAGIC {
            // Packed or scribbled-over images are seen in the wild; keep
            // going and let a later read decide whether anything is salvable.
            warn!(
                module = %self.name,
                base = %format_args!("{base:#x}"),
                "DOS header magic mismatch"
            );
        }

        let e_lfanew = u64::from(space.read_u32(base + DOS_E_LFANEW_OFFSET)?);
        let pe_addr = base + e_lfanew;
        let signature = space.read_u32(pe_addr)?;
        if signature != PE_SIGNATURE {
            return Err(Error::corrupt(format!(
                "PE signature {signature:#x} at {pe_addr:#x}"
            )));
        }

        let file_header: CoffFileHeader = space.read_struct(pe_addr + 4)?;
        let optional_addr = pe_addr + 4 + CoffFileHeader::size_with(&LE) as u64;
        let optional_magic = space.read_u16(optional_addr)?;

        // Only the two blessed optional-header shapes are decodable; any
        // other size means the headers cannot be trusted at all.
        let (directory_offset, directory_count_offset) =
            match (file_header.size_of_optional_header, optional_magic) {
                (OPTIONAL_HEADER_SIZE_PE32, OPTIONAL_HEADER_MAGIC_PE32) => {
                    (DATA_DIRECTORY_OFFSET_PE32, DIRECTORY_COUNT_OFFSET_PE32)
                }
                (OPTIONAL_HEADER_SIZE_PE32_PLUS, OPTIONAL_HEADER_MAGIC_PE32_PLUS) => (
                    DATA_DIRECTORY_OFFSET_PE32_PLUS,
                    DIRECTORY_COUNT_OFFSET_PE32_PLUS,
                ),
                (size, magic) => {
                    return Err(Error::corrupt(format!(
                        "optional header size {size} / magic {magic:#x}"
                    )))
                }
            };

        self.attributes.insert("machine", u64::from(file_header.machine));
        self.attributes
            .insert("number_of_sections", u64::from(file_header.number_of_sections));
        self.attributes
            .insert("optional_header_magic", u64::from(optional_magic));
        self.attributes
            .insert("entry_point", u64::from(space.read_u32(optional_addr + 16)?));

        if file_header.number_of_sections > MAX_SECTIONS {
            return Err(Error::corrupt(format!(
                "{} sections",
                file_header.number_of_sections
            )));
        }

        let section_table = optional_addr + u64::from(file_header.size_of_optional_header);
        for index in 0..u64::from(file_header.number_of_sections) {
            let header_addr = section_table + index * SECTION_HEADER_SIZE;
            let raw_name = space.read_bytes(header_addr, 8)?;
            let name_len = raw_name.iter().rposition(|&b| b != 0).map_or(0, |i| i + 1);
            let name = String::from_utf8_lossy(&raw_name[..name_len]).into_owned();
            let virtual_size = space.read_u32(header_addr + 8)?;
            let virtual_address = space.read_u32(header_addr + 12)?;
            self.sections.push(ModuleSection {
                name,
                address: base + u64::from(virtual_address),
                size: u64::from(virtual_size),
            });
        }

        let directory_count = u64::from(space.read_u32(optional_addr + directory_count_offset)?);

        if directory_count > DIRECTORY_ENTRY_EXPORT {
            let export: DataDirectory =
                space.read_struct(optional_addr + directory_offset + DIRECTORY_ENTRY_EXPORT * 8)?;
            // A zero export RVA just means the module exports nothing.
            if export.virtual_address != 0 {
                self.symbols = decode_exports(space, base, export)?;
            }
        }

        if width == PointerWidth::Bits64 && directory_count > DIRECTORY_ENTRY_EXCEPTION {
            let exception: DataDirectory = space
                .read_struct(optional_addr + directory_offset + DIRECTORY_ENTRY_EXCEPTION * 8)?;
            if exception.virtual_address != 0 {
                self.unwind_table = Some(decode_exception_directory(space, base, exception)?);
            }
        }

        Ok(())
    }
}

/// Walk the export directory's three parallel arrays into a symbol list.
fn decode_exports(
    space: &AddressSpace<'_>,
    base: u64,
    directory: DataDirectory,
) -> Result<Vec<Symbol>> {
    let export: ExportDirectory = space.read_struct(base + u64::from(directory.virtual_address))?;

    // More names than functions cannot happen in a well-formed directory and
    // is the usual sign the whole table is garbage.
    if export.number_of_functions < export.number_of_names {
        return Err(Error::corrupt(format!(
            "export directory has {} functions but {} names",
            export.number_of_functions, export.number_of_names
        )));
    }
    if export.number_of_names > MAX_EXPORT_NAMES {
        return Err(Error::corrupt(format!(
            "{} export names",
            export.number_of_names
        )));
    }

    let functions = base + u64::from(export.address_of_functions);
    let names = base + u64::from(export.address_of_names);
    let ordinals = base + u64::from(export.address_of_name_ordinals);

    let mut symbols = Vec::with_capacity(export.number_of_names as usize);
    for index in 0..u64::from(export.number_of_names) {
        let name_rva = space.read_u32(names + index * 4)?;
        let ordinal = u32::from(space.read_u16(ordinals + index * 2)?);
        if ordinal >= export.number_of_functions {
            debug!(ordinal, index, "export ordinal out of range, skipping");
            continue;
        }

        let function_rva = space.read_u32(functions + u64::from(ordinal) * 4)?;
        let name = space.read_cstring(base + u64::from(name_rva), MAX_EXPORT_NAME_BYTES)?;
        symbols.push(Symbol {
            name,
            address: base + u64::from(function_rva),
        });
    }

    Ok(symbols)
}

/// Read the exception directory as fixed 12-byte triples, stopping at the
/// declared size or at the first all-zero soft terminator.
fn decode_exception_directory(
    space: &AddressSpace<'_>,
    base: u64,
    directory: DataDirectory,
) -> Result<Vec<RuntimeFunctionEntry>> {
    let entry_size = RuntimeFunctionEntry::size_with(&LE) as u32;
    let count = (directory.size / entry_size).min(MAX_RUNTIME_FUNCTIONS);

    let mut table = Vec::with_capacity(count as usize);
    for index in 0..u64::from(count) {
        let entry: RuntimeFunctionEntry =
            space.read_struct(base + u64::from(directory.virtual_address) + index * u64::from(entry_size))?;
        if entry.is_terminator() {
            break;
        }
        table.push(entry);
    }

    Ok(table)
}

/// Decode every entry of the ModuleList stream. Failures are contained at
/// module granularity: a module that cannot be decoded is logged, recorded
/// in the returned failure list, and left out, with its siblings unaffected.
pub(crate) fn decode_module_list(
    file: &[u8],
    location: &LocationDescriptor,
    space: &AddressSpace<'_>,
    width: PointerWidth,
) -> Result<(Vec<Module>, Vec<String>)> {
    let stream = stream_bytes(file, location)?;
    let count: u32 = stream.pread_with(0, LE)?;
    let entry_size = ModuleEntry::size_with(&LE);
    if 4 + u64::from(count) * entry_size as u64 > stream.len() as u64 {
        return Err(Error::corrupt(format!(
            "ModuleList declares {count} modules but the stream holds fewer"
        )));
    }

    let mut modules = Vec::with_capacity(count as usize);
    let mut failures = Vec::new();
    for index in 0..count as usize {
        let entry: ModuleEntry = stream.pread_with(4 + index * entry_size, LE)?;
        match Module::decode(file, space, &entry, width) {
            Ok(module) => modules.push(module),
            Err(err) => {
                warn!(
                    base = %format_args!("{:#x}", entry.base_of_image),
                    %err,
                    "skipping undecodable module"
                );
                failures.push(format!("module at {:#x}: {err}", entry.base_of_image));
            }
        }
    }

    Ok((modules, failures))
}

/// Cheap scan of the ModuleList display names, without touching the memory
/// model. This feeds the pointer-width correction heuristic before any
/// pointer-size-dependent decoding has happened.
pub(crate) fn scan_module_names(file: &[u8], location: &LocationDescriptor) -> Vec<String> {
    let Ok(stream) = stream_bytes(file, location) else {
        return Vec::new();
    };
    let Ok(count) = stream.pread_with::<u32>(0, LE) else {
        return Vec::new();
    };

    let entry_size = ModuleEntry::size_with(&LE);
    let mut names = Vec::new();
    for index in 0..count as usize {
        let Ok(entry) = stream.pread_with::<ModuleEntry>(4 + index * entry_size, LE) else {
            break;
        };
        if let Ok(name) = read_minidump_string(file, entry.module_name_rva, MAX_MODULE_NAME_CHARS) {
            names.push(name);
        }
    }

    names
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::{AddressSpace, Backing, MemoryRange};

    const BASE: u64 = 0x0100_0000;
    const E_LFANEW: usize = 0x80;
    const OPTIONAL: usize = E_LFANEW + 4 + 20;

    fn put(image: &mut [u8], offset: usize, bytes: &[u8]) {
        image[offset..offset + bytes.len()].copy_from_slice(bytes);
    }

    fn put_u16(image: &mut [u8], offset: usize, value: u16) {
        put(image, offset, &value.to_le_bytes());
    }

    fn put_u32(image: &mut [u8], offset: usize, value: u32) {
        put(image, offset, &value.to_le_bytes());
    }

    /// A minimal PE32+ image: DOS header, COFF header, 240-byte optional
    /// header with 16 data directories, one `.text` section header.
    fn pe64_image() -> Vec<u8> {
        let mut image = vec![0u8; 0x1000];
        put(&mut image, 0, b"MZ");
        put_u32(&mut image, 0x3c, E_LFANEW as u32);
        put_u32(&mut image, E_LFANEW, 0x0000_4550);
        // COFF file header.
        put_u16(&mut image, E_LFANEW + 4, 0x8664);
        put_u16(&mut image, E_LFANEW + 6, 1); // sections
        put_u16(&mut image, E_LFANEW + 4 + 16, 240); // optional header size
        // Optional header.
        put_u16(&mut image, OPTIONAL, 0x20b);
        put_u32(&mut image, OPTIONAL + 16, 0x1234); // entry point
        put_u32(&mut image, OPTIONAL + 108, 16); // directory count
        // Section table right after the optional header.
        let section = OPTIONAL + 240;
        put(&mut image, section, b".text\0\0\0");
        put_u32(&mut image, section + 8, 0x200); // virtual size
        put_u32(&mut image, section + 12, 0x400); // virtual address
        image
    }

    fn module_for(image_len: usize) -> Module {
        Module {
            name: "C:\\Windows\\app.exe".into(),
            base: BASE,
            size: image_len as u64,
            is_executable_image: true,
            version_info: FixedFileInfo::default(),
            sections: Vec::new(),
            symbols: Vec::new(),
            unwind_table: None,
            attributes: BTreeMap::new(),
        }
    }

    fn with_image<R>(image: &[u8], f: impl FnOnce(&AddressSpace<'_>) -> R) -> R {
        let ranges = vec![MemoryRange {
            base: BASE,
            size: image.len() as u64,
            backing: Backing::Backed { file_offset: 0 },
            state: 0,
            protect: 0,
            mem_type: 0,
        }];
        let space = AddressSpace::new(&ranges, image);
        f(&space)
    }

    #[test]
    fn pe_without_exports_has_empty_symbol_table() {
        let image = pe64_image();
        with_image(&image, |space| {
            let mut module = module_for(image.len());
            module.decode_pe(space, PointerWidth::Bits64).unwrap();
            assert!(module.symbols.is_empty());
            assert_eq!(module.sections.len(), 1);
            assert_eq!(module.sections[0].name, ".text");
            assert_eq!(module.sections[0].address, BASE + 0x400);
            assert_eq!(module.sections[0].size, 0x200);
            assert_eq!(module.attributes["machine"], 0x8664);
            assert_eq!(module.attributes["entry_point"], 0x1234);
            assert!(module.unwind_table.is_none());
        });
    }

    #[test]
    fn unexpected_optional_header_size_is_fatal_for_the_module() {
        let mut image = pe64_image();
        put_u16(&mut image, E_LFANEW + 4 + 16, 248);
        with_image(&image, |space| {
            let mut module = module_for(image.len());
            let err = module.decode_pe(space, PointerWidth::Bits64).unwrap_err();
            assert!(matches!(err, Error::Corrupt(_)));
        });
    }

    /// Lay out an export directory at RVA 0x500 with the given parallel
    /// arrays.
    fn add_exports(image: &mut [u8], functions: &[u32], names: &[(&str, u16)], declared_names: u32) {
        const DIR: usize = 0x500;
        put_u32(image, OPTIONAL + 112, DIR as u32);
        put_u32(image, OPTIONAL + 116, 0x100);
        put_u32(image, DIR + 20, functions.len() as u32); // NumberOfFunctions
        put_u32(image, DIR + 24, declared_names); // NumberOfNames
        let fn_table = DIR + 40;
        put_u32(image, DIR + 28, fn_table as u32);
        for (i, rva) in functions.iter().enumerate() {
            put_u32(image, fn_table + i * 4, *rva);
        }
        let name_table = fn_table + functions.len() * 4;
        put_u32(image, DIR + 32, name_table as u32);
        let ordinal_table = name_table + names.len() * 4;
        put_u32(image, DIR + 36, ordinal_table as u32);
        let mut string_at = ordinal_table + names.len() * 2;
        for (i, (name, ordinal)) in names.iter().enumerate() {
            put_u32(image, name_table + i * 4, string_at as u32);
            put_u16(image, ordinal_table + i * 2, *ordinal);
            put(image, string_at, name.as_bytes());
            string_at += name.len() + 1;
        }
    }

    #[test]
    fn exports_resolve_through_the_ordinal_table() {
        let mut image = pe64_image();
        add_exports(&mut image, &[0x1100, 0x1200], &[("beta", 1), ("alpha", 0)], 2);
        with_image(&image, |space| {
            let mut module = module_for(image.len());
            module.decode_pe(space, PointerWidth::Bits64).unwrap();
            assert_eq!(module.symbols.len(), 2);
            assert_eq!(module.symbols[0].name, "beta");
            assert_eq!(module.symbols[0].address, BASE + 0x1200);
            assert_eq!(module.symbols[1].name, "alpha");
            assert_eq!(module.symbols[1].address, BASE + 0x1100);
        });
    }

    #[test]
    fn more_names_than_functions_is_corruption() {
        let mut image = pe64_image();
        add_exports(&mut image, &[0x1100], &[("a", 0)], 5);
        with_image(&image, |space| {
            let mut module = module_for(image.len());
            let err = module.decode_pe(space, PointerWidth::Bits64).unwrap_err();
            assert!(matches!(err, Error::Corrupt(_)));
        });
    }

    #[test]
    fn out_of_range_ordinals_are_skipped() {
        let mut image = pe64_image();
        add_exports(&mut image, &[0x1100, 0x1200], &[("good", 0), ("bad", 7)], 2);
        with_image(&image, |space| {
            let mut module = module_for(image.len());
            module.decode_pe(space, PointerWidth::Bits64).unwrap();
            assert_eq!(module.symbols.len(), 1);
            assert_eq!(module.symbols[0].name, "good");
        });
    }

    #[test]
    fn exception_directory_stops_at_soft_terminator() {
        let mut image = pe64_image();
        const DIR: usize = 0x800;
        put_u32(&mut image, OPTIONAL + 112 + 3 * 8, DIR as u32);
        put_u32(&mut image, OPTIONAL + 112 + 3 * 8 + 4, 5 * 12);
        for (i, (start, end, info)) in [(0x1000u32, 0x1040u32, 0x2000u32), (0x1040, 0x1080, 0x2010)]
            .iter()
            .enumerate()
        {
            put_u32(&mut image, DIR + i * 12, *start);
            put_u32(&mut image, DIR + i * 12 + 4, *end);
            put_u32(&mut image, DIR + i * 12 + 8, *info);
        }
        with_image(&image, |space| {
            let mut module = module_for(image.len());
            module.decode_pe(space, PointerWidth::Bits64).unwrap();
            let table = module.unwind_table.as_deref().unwrap();
            assert_eq!(table.len(), 2);
            assert_eq!(table[1].unwind_info_address, 0x2010);

            assert_eq!(module.find_function(0x1050).unwrap().start_address, 0x1040);
            assert!(module.find_function(0x2000).is_none());
        });
    }

    #[test]
    fn thirty_two_bit_modules_carry_no_unwind_table() {
        let mut image = pe64_image();
        // Rewrite as PE32: optional size 224, magic 0x10b, directories at 96.
        put_u16(&mut image, E_LFANEW + 4 + 16, 224);
        put_u16(&mut image, OPTIONAL, 0x10b);
        put_u32(&mut image, OPTIONAL + 92, 16);
        put_u32(&mut image, OPTIONAL + 108, 0);
        // Move the section header to right after the shorter optional header.
        let section = OPTIONAL + 224;
        put(&mut image, section, b".data\0\0\0");
        put_u32(&mut image, section + 8, 0x80);
        put_u32(&mut image, section + 12, 0x600);
        with_image(&image, |space| {
            let mut module = module_for(image.len());
            module.decode_pe(space, PointerWidth::Bits32).unwrap();
            assert!(module.unwind_table.is_none());
            assert_eq!(module.sections[0].name, ".data");
        });
    }

    #[test]
    fn module_file_name() {
        let module = module_for(0x1000);
        assert_eq!(module.file_name(), "app.exe");
    }
}
