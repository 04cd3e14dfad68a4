//! Raw on-disk structures of the Windows user-dump format and of the PE/COFF
//! headers reachable through the dump's memory. Layouts follow the published
//! Microsoft definitions bit for bit; everything is little-endian.
use scroll::{Pread, SizeWith};

/// The 4-byte ASCII magic at offset 0 of every minidump, compared
/// case-insensitively.
pub const DUMP_SIGNATURE: &[u8; 4] = b"MDMP";

pub const STREAM_TYPE_THREAD_LIST: u32 = 3;
pub const STREAM_TYPE_MODULE_LIST: u32 = 4;
pub const STREAM_TYPE_SYSTEM_INFO: u32 = 7;
pub const STREAM_TYPE_MEMORY64_LIST: u32 = 9;
pub const STREAM_TYPE_MISC_INFO: u32 = 15;
pub const STREAM_TYPE_MEMORY_INFO_LIST: u32 = 16;
pub const STREAM_TYPE_THREAD_INFO_LIST: u32 = 17;

pub const PROCESSOR_ARCHITECTURE_INTEL: u16 = 0;
pub const PROCESSOR_ARCHITECTURE_IA64: u16 = 6;
pub const PROCESSOR_ARCHITECTURE_ALPHA64: u16 = 7;
pub const PROCESSOR_ARCHITECTURE_AMD64: u16 = 9;
pub const PROCESSOR_ARCHITECTURE_X86_ON_WIN64: u16 = 10;

/// `MISC_INFO.flags1` bit telling whether `process_id` is valid.
pub const MISC_INFO_PROCESS_ID: u32 = 1;

/// The leading fields of the dump header. The trailing `flags` quadword is
/// not interesting to us and is left unread.
#[derive(Debug, Clone, Pread, SizeWith)]
pub struct Header {
    pub signature: u32,
    pub version: u32,
    pub stream_count: u32,
    pub stream_directory_rva: u32,
    pub checksum: u32,
    pub time_date_stamp: u32,
}

/// A size + file offset pair locating a blob inside the dump file.
#[derive(Debug, Default, Clone, Copy, Pread, SizeWith)]
pub struct LocationDescriptor {
    pub data_size: u32,
    pub rva: u32,
}

/// One stream-directory entry.
#[derive(Debug, Clone, Pread, SizeWith)]
pub struct Directory {
    pub stream_type: u32,
    pub location: LocationDescriptor,
}

/// The SystemInfo stream. Decoded first because the processor architecture
/// drives every pointer-size-dependent decode after it.
#[derive(Debug, Default, Clone, Pread, SizeWith)]
pub struct SystemInfoStream {
    pub processor_architecture: u16,
    pub processor_level: u16,
    pub processor_revision: u16,
    pub number_of_processors: u8,
    pub product_type: u8,
    pub major_version: u32,
    pub minor_version: u32,
    pub build_number: u32,
    pub platform_id: u32,
    pub csd_version_rva: u32,
    pub suite_mask: u16,
    pub reserved2: u16,
}

/// The leading fixed fields of the MiscInfo stream. Later format revisions
/// append more fields; we only consume the ones every revision carries.
#[derive(Debug, Default, Clone, Pread, SizeWith)]
pub struct MiscInfoStream {
    pub size_of_info: u32,
    pub flags1: u32,
    pub process_id: u32,
    pub process_create_time: u32,
    pub process_user_time: u32,
    pub process_kernel_time: u32,
}

/// Header of the Memory64List stream. `base_rva` is where the raw bytes of
/// the first range start; each following range's bytes are appended directly
/// after the previous one's.
#[derive(Debug, Default, Clone, Pread, SizeWith)]
pub struct Memory64ListStream {
    pub number_of_memory_ranges: u64,
    pub base_rva: u64,
}

#[derive(Debug, Default, Clone, Pread, SizeWith)]
pub struct MemoryDescriptor64 {
    pub start_of_memory_range: u64,
    pub data_size: u64,
}

/// Header of the MemoryInfoList stream.
#[derive(Debug, Default, Clone, Pread, SizeWith)]
pub struct MemoryInfoListStream {
    pub size_of_header: u32,
    pub size_of_entry: u32,
    pub number_of_entries: u64,
}

/// One region of the dumped process's address space as the kernel saw it,
/// captured or not.
#[derive(Debug, Default, Clone, Pread, SizeWith)]
pub struct MemoryInfo {
    pub base_address: u64,
    pub allocation_base: u64,
    pub allocation_protect: u32,
    pub alignment1: u32,
    pub region_size: u64,
    pub state: u32,
    pub protect: u32,
    pub mem_type: u32,
    pub alignment2: u32,
}

/// A base address + file location pair describing captured memory, used for
/// thread stacks.
#[derive(Debug, Default, Clone, Copy, Pread, SizeWith)]
pub struct MemoryDescriptor {
    pub start_of_memory_range: u64,
    pub memory: LocationDescriptor,
}

/// One ThreadList entry. Fixed 48 bytes, 4-byte aligned within the stream.
#[derive(Debug, Default, Clone, Pread, SizeWith)]
pub struct ThreadEntry {
    pub thread_id: u32,
    pub suspend_count: u32,
    pub priority_class: u32,
    pub priority: u32,
    pub teb: u64,
    pub stack: MemoryDescriptor,
    pub thread_context: LocationDescriptor,
}

/// Header of the ThreadInfoList stream.
#[derive(Debug, Default, Clone, Pread, SizeWith)]
pub struct ThreadInfoListStream {
    pub size_of_header: u32,
    pub size_of_entry: u32,
    pub number_of_entries: u32,
}

/// One ThreadInfoList entry: scheduling and timing metadata keyed by thread
/// id, merged into [`crate::Thread`] attributes when the stream is present.
#[derive(Debug, Default, Clone, Pread, SizeWith)]
pub struct ThreadInfoEntry {
    pub thread_id: u32,
    pub dump_flags: u32,
    pub dump_error: u32,
    pub exit_status: u32,
    pub create_time: u64,
    pub exit_time: u64,
    pub kernel_time: u64,
    pub user_time: u64,
    pub start_address: u64,
    pub affinity: u64,
}

/// `VS_FIXEDFILEINFO`, embedded in every module entry.
#[derive(Debug, Default, Clone, Copy, Pread, SizeWith)]
pub struct FixedFileInfo {
    pub signature: u32,
    pub struct_version: u32,
    pub file_version_ms: u32,
    pub file_version_ls: u32,
    pub product_version_ms: u32,
    pub product_version_ls: u32,
    pub file_flags_mask: u32,
    pub file_flags: u32,
    pub file_os: u32,
    pub file_type: u32,
    pub file_subtype: u32,
    pub file_date_ms: u32,
    pub file_date_ls: u32,
}

/// One ModuleList entry. 108 bytes packed.
#[derive(Debug, Default, Clone, Pread, SizeWith)]
pub struct ModuleEntry {
    pub base_of_image: u64,
    pub size_of_image: u32,
    pub checksum: u32,
    pub time_date_stamp: u32,
    pub module_name_rva: u32,
    pub version_info: FixedFileInfo,
    pub cv_record: LocationDescriptor,
    pub misc_record: LocationDescriptor,
    pub reserved0: u64,
    pub reserved1: u64,
}

// PE/COFF structures, read out of the reconstructed memory at a module's
// image base rather than out of the dump file.

/// Offset of `e_lfanew` inside the DOS header.
pub const DOS_E_LFANEW_OFFSET: u64 = 0x3c;
pub const DOS_MAGIC: &[u8; 2] = b"MZ";
/// "PE\0\0".
pub const PE_SIGNATURE: u32 = 0x0000_4550;

pub const OPTIONAL_HEADER_MAGIC_PE32: u16 = 0x10b;
pub const OPTIONAL_HEADER_MAGIC_PE32_PLUS: u16 = 0x20b;
pub const OPTIONAL_HEADER_SIZE_PE32: u16 = 224;
pub const OPTIONAL_HEADER_SIZE_PE32_PLUS: u16 = 240;

/// Byte offset of the data-directory array within the optional header.
pub const DATA_DIRECTORY_OFFSET_PE32: u64 = 96;
pub const DATA_DIRECTORY_OFFSET_PE32_PLUS: u64 = 112;
/// Byte offset of `number_of_rva_and_sizes` within the optional header.
pub const DIRECTORY_COUNT_OFFSET_PE32: u64 = 92;
pub const DIRECTORY_COUNT_OFFSET_PE32_PLUS: u64 = 108;

pub const DIRECTORY_ENTRY_EXPORT: u64 = 0;
pub const DIRECTORY_ENTRY_EXCEPTION: u64 = 3;

/// The COFF file header, right after the PE signature.
#[derive(Debug, Default, Clone, Pread, SizeWith)]
pub struct CoffFileHeader {
    pub machine: u16,
    pub number_of_sections: u16,
    pub time_date_stamp: u32,
    pub pointer_to_symbol_table: u32,
    pub number_of_symbols: u32,
    pub size_of_optional_header: u16,
    pub characteristics: u16,
}

/// One data-directory slot: an RVA + size pair.
#[derive(Debug, Default, Clone, Copy, Pread, SizeWith)]
pub struct DataDirectory {
    pub virtual_address: u32,
    pub size: u32,
}

/// `IMAGE_EXPORT_DIRECTORY`.
#[derive(Debug, Default, Clone, Pread, SizeWith)]
pub struct ExportDirectory {
    pub characteristics: u32,
    pub time_date_stamp: u32,
    pub major_version: u16,
    pub minor_version: u16,
    pub name_rva: u32,
    pub ordinal_base: u32,
    pub number_of_functions: u32,
    pub number_of_names: u32,
    pub address_of_functions: u32,
    pub address_of_names: u32,
    pub address_of_name_ordinals: u32,
}

/// One exception-directory entry: a function's code range and the RVA of its
/// unwind information. 12 bytes, image-base relative.
#[derive(Debug, Default, Clone, Copy, Pread, SizeWith)]
pub struct RuntimeFunctionEntry {
    pub start_address: u32,
    pub end_address: u32,
    pub unwind_info_address: u32,
}

impl RuntimeFunctionEntry {
    /// The all-zero entry some linkers use as a soft terminator.
    pub fn is_terminator(&self) -> bool {
        self.start_address == 0 && self.end_address == 0 && self.unwind_info_address == 0
    }
}

#[cfg(test)]
mod tests {
    use scroll::ctx::SizeWith as _;
    use scroll::LE;

    use super::*;

    /// Ensure the decoded sizes match the published layouts.
    #[test]
    fn sizeofs() {
        assert_eq!(Header::size_with(&LE), 0x18);
        assert_eq!(LocationDescriptor::size_with(&LE), 0x8);
        assert_eq!(Directory::size_with(&LE), 0xc);
        assert_eq!(SystemInfoStream::size_with(&LE), 0x20);
        assert_eq!(MiscInfoStream::size_with(&LE), 0x18);
        assert_eq!(Memory64ListStream::size_with(&LE), 0x10);
        assert_eq!(MemoryDescriptor64::size_with(&LE), 0x10);
        assert_eq!(MemoryInfoListStream::size_with(&LE), 0x10);
        assert_eq!(MemoryInfo::size_with(&LE), 0x30);
        assert_eq!(MemoryDescriptor::size_with(&LE), 0x10);
        assert_eq!(ThreadEntry::size_with(&LE), 0x30);
        assert_eq!(ThreadInfoListStream::size_with(&LE), 0xc);
        assert_eq!(ThreadInfoEntry::size_with(&LE), 0x40);
        assert_eq!(FixedFileInfo::size_with(&LE), 0x34);
        assert_eq!(ModuleEntry::size_with(&LE), 0x6c);
        assert_eq!(CoffFileHeader::size_with(&LE), 0x14);
        assert_eq!(DataDirectory::size_with(&LE), 0x8);
        assert_eq!(ExportDirectory::size_with(&LE), 0x28);
        assert_eq!(RuntimeFunctionEntry::size_with(&LE), 0xc);
    }

    #[test]
    fn runtime_function_terminator() {
        assert!(RuntimeFunctionEntry::default().is_terminator());
        let live = RuntimeFunctionEntry {
            start_address: 0x1000,
            end_address: 0x1040,
            unwind_info_address: 0x2000,
        };
        assert!(!live.is_terminator());
    }
}
