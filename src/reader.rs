//! The top-level dump handle and the stream-directory decode.
//!
//! Decoding happens in two phases. The header, the stream directory and the
//! immediate streams (SystemInfo, Memory64List, MiscInfo) are decoded when
//! the reader is built, SystemInfo first because everything pointer-size
//! dependent hangs off it. The deferred streams (ThreadList, ModuleList,
//! ThreadInfo, MemoryInfo) only have their locations recorded; they decode
//! on first access, because modules and threads read through the memory
//! model that the immediate phase reconstructs.
use std::collections::HashMap;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use once_cell::sync::OnceCell;
use scroll::ctx::SizeWith;
use scroll::{Pread, LE};
use tracing::{debug, warn};

use crate::error::{Error, Result};
use crate::map::MappedFile;
use crate::memory::{self, AddressSpace, MemoryRange};
use crate::modules::{self, Module};
use crate::structs::{
    Directory, Header, LocationDescriptor, MiscInfoStream, SystemInfoStream, DUMP_SIGNATURE,
    MISC_INFO_PROCESS_ID, PROCESSOR_ARCHITECTURE_ALPHA64, PROCESSOR_ARCHITECTURE_AMD64,
    PROCESSOR_ARCHITECTURE_IA64, PROCESSOR_ARCHITECTURE_X86_ON_WIN64, STREAM_TYPE_MEMORY64_LIST,
    STREAM_TYPE_MEMORY_INFO_LIST, STREAM_TYPE_MISC_INFO, STREAM_TYPE_MODULE_LIST,
    STREAM_TYPE_SYSTEM_INFO, STREAM_TYPE_THREAD_INFO_LIST, STREAM_TYPE_THREAD_LIST,
};
use crate::threads::{self, Thread};

/// The pointer width of the dumped process. Chosen once per dump; it selects
/// the stack-walk algorithm, the register windows and the environment-block
/// layout.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PointerWidth {
    Bits32,
    Bits64,
}

impl PointerWidth {
    /// The size of a pointer in bytes.
    pub fn byte_size(self) -> u64 {
        match self {
            Self::Bits32 => 4,
            Self::Bits64 => 8,
        }
    }
}

/// Path marker of the 32-bit compatibility subsystem on 64-bit Windows.
const WOW64_MODULE_MARKER: &str = "syswow64";
/// More than this many marker modules reclassify a 64-bit dump as a 32-bit
/// process captured by a 64-bit dumping tool. An empirical threshold; keep
/// it as is.
const WOW64_MODULE_THRESHOLD: usize = 5;

/// Windows Vista; the process-parameter layout this reader knows stops here.
const VISTA_MAJOR_VERSION: u32 = 6;

// Environment-block offsets of the pre-Vista era: TEB to PEB, PEB to process
// parameters, process parameters to the command-line counted string.
const TEB32_PEB_OFFSET: u64 = 0x30;
const TEB64_PEB_OFFSET: u64 = 0x60;
const PEB32_PARAMETERS_OFFSET: u64 = 0x10;
const PEB64_PARAMETERS_OFFSET: u64 = 0x20;
const PARAMETERS32_COMMAND_LINE_OFFSET: u64 = 0x40;
const PARAMETERS64_COMMAND_LINE_OFFSET: u64 = 0x70;
/// Corruption guard on the command-line length.
const MAX_COMMAND_LINE_BYTES: u64 = 0x2000;

/// A decoded minidump: the queryable model of the crashed process.
///
/// Immutable after construction except for the lazily populated caches
/// (annotated memory map, modules, threads, per-thread registers and
/// frames), each decoded once on first access and memoized. Every decode
/// step is idempotent, so re-reading an accessor is always safe.
#[derive(Debug)]
pub struct DumpReader<'a> {
    data: MappedFile<'a>,
    stream_count: u32,
    time_date_stamp: u32,
    system: SystemInfoStream,
    width: PointerWidth,
    process_id: Option<u32>,
    deferred: HashMap<u32, LocationDescriptor>,
    /// Canonical backed ranges, the address space every decode reads through.
    ranges: Vec<MemoryRange>,
    annotated: OnceCell<Vec<MemoryRange>>,
    modules: OnceCell<(Vec<Module>, Vec<String>)>,
    threads: OnceCell<Vec<Thread>>,
}

impl DumpReader<'static> {
    /// Memory map the file at `path` and decode it.
    pub fn new<P: AsRef<std::path::Path>>(path: P) -> Result<Self> {
        Self::with_file(MappedFile::open(path)?)
    }
}

impl<'a> DumpReader<'a> {
    /// Decode a dump from something that dereferences to bytes, for callers
    /// that already hold the file in memory.
    pub fn with_slice(slice: &'a impl std::ops::Deref<Target = [u8]>) -> Result<Self> {
        Self::with_file(MappedFile::from(&**slice))
    }

    pub fn with_file(data: MappedFile<'a>) -> Result<Self> {
        let file = data.bytes();

        let header: Header = file
            .pread_with(0, LE)
            .map_err(|_| Error::Format("file is too small for a dump header".into()))?;
        if !header.signature.to_le_bytes().eq_ignore_ascii_case(DUMP_SIGNATURE) {
            return Err(Error::Format(format!(
                "signature {:#010x} is not MDMP",
                header.signature
            )));
        }

        // Walk exactly `stream_count` directory entries, splitting them into
        // the immediate and deferred buckets. Unrecognized stream types are
        // ignored for forward compatibility.
        let directory_size = Directory::size_with(&LE) as u64;
        let directory_end = u64::from(header.stream_directory_rva)
            + u64::from(header.stream_count) * directory_size;
        if directory_end > file.len() as u64 {
            return Err(Error::Format(format!(
                "stream directory of {} entries does not fit in the file",
                header.stream_count
            )));
        }

        let mut immediate = Vec::new();
        let mut deferred = HashMap::new();
        let mut offset = header.stream_directory_rva as usize;
        for _ in 0..header.stream_count {
            let entry: Directory = file
                .gread_with(&mut offset, LE)
                .map_err(|_| Error::Format("stream directory is unreadable".into()))?;
            match entry.stream_type {
                STREAM_TYPE_SYSTEM_INFO | STREAM_TYPE_MEMORY64_LIST | STREAM_TYPE_MISC_INFO => {
                    immediate.push((entry.stream_type, entry.location));
                }
                STREAM_TYPE_THREAD_LIST
                | STREAM_TYPE_MODULE_LIST
                | STREAM_TYPE_MEMORY_INFO_LIST
                | STREAM_TYPE_THREAD_INFO_LIST => {
                    deferred.insert(entry.stream_type, entry.location);
                }
                other => debug!(stream_type = other, "ignoring unrecognized stream"),
            }
        }

        // SystemInfo always decodes first: without the processor architecture
        // there is no pointer width, and without a pointer width nothing
        // else can be decoded.
        let system_location = immediate
            .iter()
            .find(|(stream_type, _)| *stream_type == STREAM_TYPE_SYSTEM_INFO)
            .map(|(_, location)| *location)
            .ok_or_else(|| Error::corrupt("dump carries no SystemInfo stream"))?;
        let system: SystemInfoStream = stream_bytes(file, &system_location)?.pread_with(0, LE)?;
        let width = detect_pointer_width(system.processor_architecture);

        // The remaining immediate streams decode in directory order. Their
        // bodies are load bearing, so a malformed one is fatal.
        let mut provisional = Vec::new();
        let mut process_id = None;
        for (stream_type, location) in &immediate {
            match *stream_type {
                STREAM_TYPE_MEMORY64_LIST => {
                    provisional = memory::decode_memory64_list(file, location)?;
                }
                STREAM_TYPE_MISC_INFO => {
                    let misc: MiscInfoStream = stream_bytes(file, location)?.pread_with(0, LE)?;
                    if misc.flags1 & MISC_INFO_PROCESS_ID != 0 {
                        process_id = Some(misc.process_id);
                    }
                }
                _ => {}
            }
        }

        // Best-effort width correction: a 64-bit dumping tool capturing a
        // 32-bit process reports the host architecture, but the module list
        // betrays the compatibility subsystem. The provisional address space
        // is only finalized after this has run.
        let width = correct_pointer_width(width, file, &deferred);
        let ranges = memory::finalize_ranges(provisional);

        Ok(Self {
            data,
            stream_count: header.stream_count,
            time_date_stamp: header.time_date_stamp,
            system,
            width,
            process_id,
            deferred,
            ranges,
            annotated: OnceCell::new(),
            modules: OnceCell::new(),
            threads: OnceCell::new(),
        })
    }

    pub(crate) fn file_bytes(&self) -> &[u8] {
        self.data.bytes()
    }

    /// The detected pointer width, heuristic correction included.
    pub fn pointer_width(&self) -> PointerWidth {
        self.width
    }

    /// How many streams the directory declared.
    pub fn stream_count(&self) -> u32 {
        self.stream_count
    }

    /// When the dump was written.
    pub fn crash_time(&self) -> SystemTime {
        UNIX_EPOCH + Duration::from_secs(u64::from(self.time_date_stamp))
    }

    /// The dumped process id, when the MiscInfo stream carried one. A
    /// cross-reference key only; no validation is applied.
    pub fn process_id(&self) -> Option<u32> {
        self.process_id
    }

    pub fn processor_architecture(&self) -> u16 {
        self.system.processor_architecture
    }

    pub fn processor_level(&self) -> u16 {
        self.system.processor_level
    }

    pub fn processor_revision(&self) -> u16 {
        self.system.processor_revision
    }

    pub fn number_of_processors(&self) -> u8 {
        self.system.number_of_processors
    }

    /// The OS version as "major.minor.build", with the service-pack string
    /// appended when it is readable.
    pub fn os_version(&self) -> String {
        let mut version = format!(
            "{}.{}.{}",
            self.system.major_version, self.system.minor_version, self.system.build_number
        );
        if self.system.csd_version_rva != 0 {
            if let Ok(csd) = read_minidump_string(self.file_bytes(), self.system.csd_version_rva, 256)
            {
                if !csd.is_empty() {
                    version.push(' ');
                    version.push_str(&csd);
                }
            }
        }
        version
    }

    /// The unified view of the process's readable memory.
    pub fn address_space(&self) -> AddressSpace<'_> {
        AddressSpace::new(&self.ranges, self.file_bytes())
    }

    /// The full memory map: captured ranges annotated with protection and
    /// commit-state metadata, plus synthesized unbacked ranges for regions
    /// the dump describes but did not capture. Built on first access.
    pub fn memory_ranges(&self) -> &[MemoryRange] {
        self.annotated.get_or_init(|| {
            let Some(location) = self.deferred.get(&STREAM_TYPE_MEMORY_INFO_LIST) else {
                return self.ranges.clone();
            };
            match memory::decode_memory_info_list(self.file_bytes(), location) {
                Ok(infos) => memory::merge_memory_info(&self.ranges, &infos),
                Err(err) => {
                    warn!(%err, "skipping undecodable MemoryInfo stream");
                    self.ranges.clone()
                }
            }
        })
    }

    /// Find the memory range containing `addr` in the annotated map.
    pub fn find_memory_range(&self, addr: u64) -> Option<&MemoryRange> {
        self.memory_ranges().iter().find(|range| range.contains(addr))
    }

    fn decoded_modules(&self) -> &(Vec<Module>, Vec<String>) {
        self.modules.get_or_init(|| {
            let Some(location) = self.deferred.get(&STREAM_TYPE_MODULE_LIST) else {
                return (Vec::new(), Vec::new());
            };
            let space = self.address_space();
            match modules::decode_module_list(self.file_bytes(), location, &space, self.width) {
                Ok(decoded) => decoded,
                Err(err) => {
                    warn!(%err, "skipping undecodable ModuleList stream");
                    (Vec::new(), vec![err.to_string()])
                }
            }
        })
    }

    /// Every module the dump could decode, cached after the first access. A
    /// module that fails to decode is logged and skipped without disturbing
    /// the others; see [`Self::module_failures`] for what was dropped.
    pub fn modules(&self) -> &[Module] {
        &self.decoded_modules().0
    }

    /// Human-readable records of the modules that failed to decode, one per
    /// dropped module.
    pub fn module_failures(&self) -> &[String] {
        &self.decoded_modules().1
    }

    /// Find the module whose image contains `addr`.
    pub fn module_at(&self, addr: u64) -> Option<&Module> {
        self.modules().iter().find(|module| module.contains(addr))
    }

    /// The process executable, i.e. the module whose name ends in `.exe`.
    pub fn executable(&self) -> Option<&Module> {
        self.modules().iter().find(|module| module.is_executable_image)
    }

    /// Every thread the dump could decode, cached after the first access.
    pub fn threads(&self) -> &[Thread] {
        self.threads.get_or_init(|| {
            let Some(location) = self.deferred.get(&STREAM_TYPE_THREAD_LIST) else {
                return Vec::new();
            };
            let mut threads = match threads::decode_thread_list(self.file_bytes(), location) {
                Ok(threads) => threads,
                Err(err) => {
                    warn!(%err, "skipping undecodable ThreadList stream");
                    return Vec::new();
                }
            };
            if let Some(info_location) = self.deferred.get(&STREAM_TYPE_THREAD_INFO_LIST) {
                if let Err(err) =
                    threads::merge_thread_info(self.file_bytes(), info_location, &mut threads)
                {
                    warn!(%err, "skipping undecodable ThreadInfo stream");
                }
            }
            threads
        })
    }

    /// Find a thread by id.
    pub fn thread(&self, id: u32) -> Option<&Thread> {
        self.threads().iter().find(|thread| thread.id == id)
    }

    /// The process command line, recovered from the process environment
    /// block. Only the pre-Vista parameter layout is known, so this reports
    /// unavailable data on newer dumps as well as on any read fault.
    pub fn command_line(&self) -> Result<String> {
        if self.system.major_version >= VISTA_MAJOR_VERSION {
            return Err(Error::DataUnavailable(
                "command line is only recoverable from pre-Vista dumps",
            ));
        }
        let thread = self
            .threads()
            .iter()
            .find(|thread| thread.teb != 0)
            .ok_or(Error::DataUnavailable("no thread carries an environment block"))?;
        self.read_command_line(thread.teb)
            .map_err(|_| Error::DataUnavailable("process parameters are not readable"))
    }

    fn read_command_line(&self, teb: u64) -> Result<String> {
        let space = self.address_space();
        let width = self.width;
        let (peb_offset, parameters_offset, command_line_offset) = match width {
            PointerWidth::Bits32 => (
                TEB32_PEB_OFFSET,
                PEB32_PARAMETERS_OFFSET,
                PARAMETERS32_COMMAND_LINE_OFFSET,
            ),
            PointerWidth::Bits64 => (
                TEB64_PEB_OFFSET,
                PEB64_PARAMETERS_OFFSET,
                PARAMETERS64_COMMAND_LINE_OFFSET,
            ),
        };

        let peb = space.read_pointer(teb + peb_offset, width)?;
        let parameters = space.read_pointer(peb + parameters_offset, width)?;
        // The command line is a counted UTF-16 string: a 16-bit byte length,
        // a 16-bit capacity, then the (padded, on 64-bit) buffer pointer.
        let length = u64::from(space.read_u16(parameters + command_line_offset)?);
        let buffer_offset = match width {
            PointerWidth::Bits32 => 4,
            PointerWidth::Bits64 => 8,
        };
        let buffer = space.read_pointer(parameters + command_line_offset + buffer_offset, width)?;
        let bytes = space.read_bytes(buffer, length.min(MAX_COMMAND_LINE_BYTES) as usize)?;
        utf16_string(&bytes)
    }
}

/// Map the reported processor architecture to a pointer width.
fn detect_pointer_width(processor_architecture: u16) -> PointerWidth {
    match processor_architecture {
        PROCESSOR_ARCHITECTURE_IA64
        | PROCESSOR_ARCHITECTURE_ALPHA64
        | PROCESSOR_ARCHITECTURE_AMD64
        | PROCESSOR_ARCHITECTURE_X86_ON_WIN64 => PointerWidth::Bits64,
        _ => PointerWidth::Bits32,
    }
}

/// Reclassify an apparently 64-bit dump as 32-bit when more than
/// [`WOW64_MODULE_THRESHOLD`] module paths name the compatibility subsystem.
fn correct_pointer_width(
    width: PointerWidth,
    file: &[u8],
    deferred: &HashMap<u32, LocationDescriptor>,
) -> PointerWidth {
    if width != PointerWidth::Bits64 {
        return width;
    }
    let Some(location) = deferred.get(&STREAM_TYPE_MODULE_LIST) else {
        return width;
    };

    let wow64_modules = modules::scan_module_names(file, location)
        .iter()
        .filter(|name| name.to_ascii_lowercase().contains(WOW64_MODULE_MARKER))
        .count();
    if wow64_modules > WOW64_MODULE_THRESHOLD {
        debug!(wow64_modules, "reclassifying dump as a 32-bit process");
        PointerWidth::Bits32
    } else {
        width
    }
}

/// Bounds-checked view of one stream's bytes.
pub(crate) fn stream_bytes<'d>(file: &'d [u8], location: &LocationDescriptor) -> Result<&'d [u8]> {
    let start = location.rva as usize;
    let end = start + location.data_size as usize;
    file.get(start..end).ok_or_else(|| {
        Error::corrupt(format!(
            "stream at {:#x}+{:#x} runs outside the file",
            location.rva, location.data_size
        ))
    })
}

/// Read a length-prefixed UTF-16LE string at `rva` in the dump file, clamped
/// to `max_chars` UTF-16 units as a corruption guard.
pub(crate) fn read_minidump_string(file: &[u8], rva: u32, max_chars: u32) -> Result<String> {
    let byte_length: u32 = file.pread_with(rva as usize, LE)?;
    let units = (byte_length / 2).min(max_chars) as usize;
    let start = rva as usize + 4;
    let bytes = file
        .get(start..start + units * 2)
        .ok_or_else(|| Error::corrupt(format!("string at {rva:#x} runs outside the file")))?;
    utf16_string(bytes)
}

/// Decode UTF-16LE bytes into a string, failing on unpaired surrogates.
pub(crate) fn utf16_string(slice: &[u8]) -> Result<String> {
    let units = slice
        .chunks_exact(2)
        .map(|pair| u16::from_le_bytes([pair[0], pair[1]]));
    char::decode_utf16(units)
        .collect::<Result<String, _>>()
        .map_err(|_| Error::corrupt("string is not valid UTF-16"))
}

#[cfg(test)]
mod tests {
    use core::fmt::Debug;

    use super::*;
    use crate::structs::PROCESSOR_ARCHITECTURE_INTEL;

    #[test]
    fn assert_traits() {
        fn assert_traits_<T: Send + Sync + Debug>() {}
        assert_traits_::<DumpReader<'static>>();
    }

    #[test]
    fn pointer_width_detection() {
        assert_eq!(detect_pointer_width(PROCESSOR_ARCHITECTURE_AMD64), PointerWidth::Bits64);
        assert_eq!(detect_pointer_width(PROCESSOR_ARCHITECTURE_IA64), PointerWidth::Bits64);
        assert_eq!(detect_pointer_width(PROCESSOR_ARCHITECTURE_ALPHA64), PointerWidth::Bits64);
        assert_eq!(
            detect_pointer_width(PROCESSOR_ARCHITECTURE_X86_ON_WIN64),
            PointerWidth::Bits64
        );
        assert_eq!(detect_pointer_width(PROCESSOR_ARCHITECTURE_INTEL), PointerWidth::Bits32);
        assert_eq!(detect_pointer_width(5), PointerWidth::Bits32);
    }

    #[test]
    fn minidump_string_is_clamped() {
        let mut file = vec![0u8; 64];
        file[0..4].copy_from_slice(&12u32.to_le_bytes());
        for (i, c) in "abcdef".bytes().enumerate() {
            file[4 + i * 2] = c;
        }
        assert_eq!(read_minidump_string(&file, 0, 512).unwrap(), "abcdef");
        assert_eq!(read_minidump_string(&file, 0, 3).unwrap(), "abc");
    }

    #[test]
    fn utf16_rejects_unpaired_surrogates() {
        let bad = 0xd800u16.to_le_bytes();
        assert!(matches!(utf16_string(&bad), Err(Error::Corrupt(_))));
    }
}
