//! The reconstructed memory model: an ordered, gap-aware list of
//! [`MemoryRange`]s built from the Memory64List stream, optionally annotated
//! with the per-region protection and commit-state metadata of the
//! MemoryInfoList stream, plus the [`AddressSpace`] view every later decode
//! stage reads through.
use scroll::ctx::{SizeWith, TryFromCtx};
use scroll::{Endian, Pread, LE};
use tracing::warn;

use crate::error::{Error, Result};
use crate::structs::{
    LocationDescriptor, Memory64ListStream, MemoryDescriptor64, MemoryInfo, MemoryInfoListStream,
};

/// Disables all access to the committed region of pages.
pub const PAGE_NOACCESS: u32 = 0x01;
/// Enables read-only access to the committed region of pages.
pub const PAGE_READONLY: u32 = 0x02;
/// Enables read-only or read/write access to the committed region of pages.
pub const PAGE_READWRITE: u32 = 0x04;
/// Enables read-only or copy-on-write access to a mapped view.
pub const PAGE_WRITECOPY: u32 = 0x08;
/// Enables execute access to the committed region of pages.
pub const PAGE_EXECUTE: u32 = 0x10;
/// Enables execute or read-only access to the committed region of pages.
pub const PAGE_EXECUTE_READ: u32 = 0x20;
/// Enables execute, read-only, or read/write access.
pub const PAGE_EXECUTE_READWRITE: u32 = 0x40;
/// Enables execute, read-only, or copy-on-write access to a mapped view.
pub const PAGE_EXECUTE_WRITECOPY: u32 = 0x80;
/// Pages in the region become guard pages; independent modifier bit.
pub const PAGE_GUARD: u32 = 0x100;
/// Sets all pages to be non-cachable; independent modifier bit.
pub const PAGE_NOCACHE: u32 = 0x200;
/// Sets all pages to be write-combined; independent modifier bit.
pub const PAGE_WRITECOMBINE: u32 = 0x400;

/// The Windows protection constants do not directly say whether a page can be
/// read, written or executed, so we derive our own masks. A page is readable
/// when protected with any of these rights.
const READABLE: u32 = PAGE_READONLY
    | PAGE_READWRITE
    | PAGE_WRITECOPY
    | PAGE_EXECUTE_READ
    | PAGE_EXECUTE_READWRITE
    | PAGE_EXECUTE_WRITECOPY;

/// A page is writable when protected with any of these rights.
const WRITABLE: u32 = PAGE_READWRITE | PAGE_WRITECOPY | PAGE_EXECUTE_READWRITE;

/// A page is executable when protected with any of these rights.
const EXECUTABLE: u32 =
    PAGE_EXECUTE | PAGE_EXECUTE_READ | PAGE_EXECUTE_READWRITE | PAGE_EXECUTE_WRITECOPY;

pub const MEM_COMMIT: u32 = 0x1000;
pub const MEM_RESERVE: u32 = 0x2000;
pub const MEM_FREE: u32 = 0x1_0000;

pub const MEM_PRIVATE: u32 = 0x2_0000;
pub const MEM_MAPPED: u32 = 0x4_0000;
pub const MEM_IMAGE: u32 = 0x100_0000;

/// Why a range exists in the map without captured bytes behind it.
pub const UNBACKED_FREE: &str = "free memory, unallocated";
pub const UNBACKED_OMITTED: &str = "data not included in dump";

/// Whether a range's bytes exist in the dump file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Backing {
    /// The bytes were captured and live at `file_offset` in the dump.
    Backed { file_offset: u64 },
    /// The region was described by the kernel but its bytes were not
    /// captured; `reason` says why.
    Unbacked { reason: &'static str },
}

/// One region of the dumped process's address space. Ranges are
/// non-overlapping and sorted ascending by base address; for any two,
/// `range[i].base + range[i].size <= range[i + 1].base`.
#[derive(Debug, Clone)]
pub struct MemoryRange {
    /// First virtual address of the range.
    pub base: u64,
    /// Length in bytes.
    pub size: u64,
    /// Where (and whether) the bytes live in the dump file.
    pub backing: Backing,
    /// `MEM_COMMIT` / `MEM_RESERVE` / `MEM_FREE`, zero when no
    /// MemoryInfoList metadata matched this range.
    pub state: u32,
    /// The raw page-protection bitmask.
    pub protect: u32,
    /// `MEM_PRIVATE` / `MEM_MAPPED` / `MEM_IMAGE`.
    pub mem_type: u32,
}

impl MemoryRange {
    fn backed(base: u64, size: u64, file_offset: u64) -> Self {
        Self {
            base,
            size,
            backing: Backing::Backed { file_offset },
            state: 0,
            protect: 0,
            mem_type: 0,
        }
    }

    /// One past the last address of the range.
    pub fn end(&self) -> u64 {
        self.base + self.size
    }

    pub fn contains(&self, addr: u64) -> bool {
        addr >= self.base && addr < self.end()
    }

    /// Is the region readable? Always false for free regions, whose
    /// protection bits are undefined.
    pub fn is_readable(&self) -> bool {
        self.state != MEM_FREE && (self.protect & READABLE) != 0
    }

    /// Is the region writable? Always false for free regions.
    pub fn is_writable(&self) -> bool {
        self.state != MEM_FREE && (self.protect & WRITABLE) != 0
    }

    /// Is the region executable? Always false for free regions.
    pub fn is_executable(&self) -> bool {
        self.state != MEM_FREE && (self.protect & EXECUTABLE) != 0
    }

    /// Stringify the commit state.
    pub fn state_as_str(&self) -> &'static str {
        match self.state {
            MEM_COMMIT => "MEM_COMMIT",
            MEM_RESERVE => "MEM_RESERVE",
            MEM_FREE => "MEM_FREE",
            _ => "UNKNOWN",
        }
    }

    /// Stringify the region type. Free regions have no meaningful type.
    pub fn type_as_str(&self) -> &'static str {
        if self.state == MEM_FREE {
            return "";
        }

        match self.mem_type {
            MEM_PRIVATE => "MEM_PRIVATE",
            MEM_MAPPED => "MEM_MAPPED",
            MEM_IMAGE => "MEM_IMAGE",
            _ => "UNKNOWN",
        }
    }

    /// Stringify the protection mask: at most one base right plus the
    /// independent modifier bits.
    pub fn protection_string(&self) -> String {
        if self.protect == 0 {
            return String::new();
        }

        const MODIFIERS: [(u32, &str); 3] = [
            (PAGE_GUARD, "PAGE_GUARD"),
            (PAGE_NOCACHE, "PAGE_NOCACHE"),
            (PAGE_WRITECOMBINE, "PAGE_WRITECOMBINE"),
        ];

        // The modifier bits combine with exactly one base right, so strip
        // them off first and decode the remainder as a single value.
        let mut parts = Vec::new();
        let mut protect = self.protect;
        for (mask, name) in MODIFIERS {
            if (protect & mask) != 0 {
                protect &= !mask;
                parts.push(name);
            }
        }

        parts.push(match protect {
            PAGE_NOACCESS => "PAGE_NOACCESS",
            PAGE_READONLY => "PAGE_READONLY",
            PAGE_READWRITE => "PAGE_READWRITE",
            PAGE_WRITECOPY => "PAGE_WRITECOPY",
            PAGE_EXECUTE => "PAGE_EXECUTE",
            PAGE_EXECUTE_READ => "PAGE_EXECUTE_READ",
            PAGE_EXECUTE_READWRITE => "PAGE_EXECUTE_READWRITE",
            PAGE_EXECUTE_WRITECOPY => "PAGE_EXECUTE_WRITECOPY",
            _ => "UNKNOWN",
        });

        parts.join(" | ")
    }
}

/// Decode the Memory64List stream into raw, uncoalesced backed ranges. The
/// result is provisional; [`finalize_ranges`] produces the canonical list
/// once the pointer-width heuristic has run.
pub(crate) fn decode_memory64_list(
    file: &[u8],
    location: &LocationDescriptor,
) -> Result<Vec<MemoryRange>> {
    let stream = crate::reader::stream_bytes(file, location)?;
    let mut offset = 0;
    let header: Memory64ListStream = stream.gread_with(&mut offset, LE)?;

    // The descriptor table must fit in the stream, which doubles as a
    // plausibility check on the count.
    let descriptor_size = MemoryDescriptor64::size_with(&LE) as u64;
    let table_size = header
        .number_of_memory_ranges
        .checked_mul(descriptor_size)
        .ok_or_else(|| Error::corrupt("Memory64List range count overflows"))?;
    if table_size + offset as u64 > stream.len() as u64 {
        return Err(Error::corrupt(format!(
            "Memory64List declares {} ranges but the stream holds fewer",
            header.number_of_memory_ranges
        )));
    }

    let mut ranges = Vec::with_capacity(header.number_of_memory_ranges as usize);
    let mut file_offset = header.base_rva;
    for _ in 0..header.number_of_memory_ranges {
        let descriptor: MemoryDescriptor64 = stream.gread_with(&mut offset, LE)?;

        // Truncated dumps routinely cut the last range short. Clamp to the
        // bytes that are actually present instead of refusing the dump.
        let available = (file.len() as u64).saturating_sub(file_offset);
        let size = descriptor.data_size.min(available);
        if size != descriptor.data_size {
            warn!(
                base = %format_args!("{:#x}", descriptor.start_of_memory_range),
                missing = descriptor.data_size - size,
                "memory range truncated by end of file"
            );
        }

        if size != 0 {
            ranges.push(MemoryRange::backed(
                descriptor.start_of_memory_range,
                size,
                file_offset,
            ));
        }
        file_offset += descriptor.data_size;
    }

    Ok(ranges)
}

/// Turn the provisional range list into the canonical one: coalesce adjacent
/// ranges whose bases and file offsets are both consecutive, then sort
/// ascending by base address.
pub(crate) fn finalize_ranges(raw: Vec<MemoryRange>) -> Vec<MemoryRange> {
    let mut ranges: Vec<MemoryRange> = Vec::with_capacity(raw.len());
    for range in raw {
        if let Some(last) = ranges.last_mut() {
            if let (Backing::Backed { file_offset: last_off }, Backing::Backed { file_offset }) =
                (last.backing, range.backing)
            {
                if last.end() == range.base && last_off + last.size == file_offset {
                    last.size += range.size;
                    continue;
                }
            }
        }
        ranges.push(range);
    }

    ranges.sort_by_key(|range| range.base);
    ranges
}

/// Decode the MemoryInfoList stream into raw region descriptors.
pub(crate) fn decode_memory_info_list(
    file: &[u8],
    location: &LocationDescriptor,
) -> Result<Vec<MemoryInfo>> {
    let stream = crate::reader::stream_bytes(file, location)?;
    let header: MemoryInfoListStream = stream.pread_with(0, LE)?;

    let entry_size = MemoryInfo::size_with(&LE) as u32;
    if header.size_of_entry < entry_size {
        return Err(Error::corrupt(format!(
            "MemoryInfoList entry size {} is smaller than expected {}",
            header.size_of_entry, entry_size
        )));
    }
    let table_size = header
        .number_of_entries
        .checked_mul(header.size_of_entry as u64)
        .and_then(|size| size.checked_add(header.size_of_header as u64))
        .ok_or_else(|| Error::corrupt("MemoryInfoList entry count overflows"))?;
    if table_size > stream.len() as u64 {
        return Err(Error::corrupt(format!(
            "MemoryInfoList declares {} entries but the stream holds fewer",
            header.number_of_entries
        )));
    }

    let mut infos = Vec::with_capacity(header.number_of_entries as usize);
    for index in 0..header.number_of_entries {
        let offset = header.size_of_header as u64 + index * header.size_of_entry as u64;
        infos.push(stream.pread_with(offset as usize, LE)?);
    }

    Ok(infos)
}

/// Merge MemoryInfoList metadata into the canonical range list. Regions
/// whose base matches a backed range annotate it in place; regions the dump
/// describes but did not capture become synthesized [`Backing::Unbacked`]
/// ranges. The merged list is re-sorted, stable and ascending, which is the
/// order every consumer relies on.
pub(crate) fn merge_memory_info(backed: &[MemoryRange], infos: &[MemoryInfo]) -> Vec<MemoryRange> {
    let mut merged = backed.to_vec();

    for info in infos {
        match merged.iter_mut().find(|range| range.base == info.base_address) {
            Some(range) => {
                range.state = info.state;
                range.protect = info.protect;
                range.mem_type = info.mem_type;
            }
            None => {
                let reason = if info.state == MEM_FREE {
                    UNBACKED_FREE
                } else {
                    UNBACKED_OMITTED
                };
                merged.push(MemoryRange {
                    base: info.base_address,
                    size: info.region_size,
                    backing: Backing::Unbacked { reason },
                    state: info.state,
                    protect: info.protect,
                    mem_type: info.mem_type,
                });
            }
        }
    }

    merged.sort_by_key(|range| range.base);
    merged
}

/// A read-only view of the dumped process's virtual memory: the sorted range
/// list plus the dump bytes behind it. Reads resolve a virtual address to a
/// backed range and fail with [`Error::MemoryFault`] on gaps, uncaptured
/// regions and truncation, which callers treat as "stop here, keep what you
/// have".
#[derive(Debug, Clone, Copy)]
pub struct AddressSpace<'d> {
    ranges: &'d [MemoryRange],
    file: &'d [u8],
}

impl<'d> AddressSpace<'d> {
    pub(crate) fn new(ranges: &'d [MemoryRange], file: &'d [u8]) -> Self {
        Self { ranges, file }
    }

    /// Find the range containing `addr`, if any.
    pub fn range_at(&self, addr: u64) -> Option<&'d MemoryRange> {
        let index = self.ranges.partition_point(|range| range.base <= addr);
        let range = self.ranges.get(index.checked_sub(1)?)?;
        range.contains(addr).then_some(range)
    }

    /// The captured bytes from `addr` to the end of its containing range.
    pub(crate) fn chunk_from(&self, addr: u64) -> Result<&'d [u8]> {
        let range = self
            .range_at(addr)
            .ok_or_else(|| Error::fault(addr, "address not in any memory range"))?;
        let Backing::Backed { file_offset } = range.backing else {
            return Err(Error::fault(addr, "range not captured in the dump"));
        };

        let start = file_offset + (addr - range.base);
        let end = file_offset + range.size;
        usize::try_from(start)
            .ok()
            .zip(usize::try_from(end).ok())
            .and_then(|(start, end)| self.file.get(start..end))
            .ok_or_else(|| Error::fault(addr, "range data past end of file"))
    }

    /// Read exactly `len` bytes starting at `addr`, crossing into the next
    /// range when the ranges are contiguous.
    pub fn read_bytes(&self, addr: u64, len: usize) -> Result<Vec<u8>> {
        let mut bytes = Vec::with_capacity(len);
        let mut cursor = addr;
        while bytes.len() < len {
            let chunk = self.chunk_from(cursor)?;
            let take = (len - bytes.len()).min(chunk.len());
            bytes.extend_from_slice(&chunk[..take]);
            cursor += take as u64;
        }

        Ok(bytes)
    }

    pub fn read_u8(&self, addr: u64) -> Result<u8> {
        Ok(self.read_bytes(addr, 1)?[0])
    }

    pub fn read_u16(&self, addr: u64) -> Result<u16> {
        Ok(self.read_bytes(addr, 2)?.as_slice().pread_with(0, LE)?)
    }

    pub fn read_u32(&self, addr: u64) -> Result<u32> {
        Ok(self.read_bytes(addr, 4)?.as_slice().pread_with(0, LE)?)
    }

    pub fn read_u64(&self, addr: u64) -> Result<u64> {
        Ok(self.read_bytes(addr, 8)?.as_slice().pread_with(0, LE)?)
    }

    /// Read a pointer-sized value, zero-extending on 32-bit.
    pub fn read_pointer(&self, addr: u64, width: crate::PointerWidth) -> Result<u64> {
        match width {
            crate::PointerWidth::Bits32 => Ok(self.read_u32(addr)?.into()),
            crate::PointerWidth::Bits64 => self.read_u64(addr),
        }
    }

    /// Read a fixed-layout structure at `addr`.
    pub fn read_struct<T>(&self, addr: u64) -> Result<T>
    where
        T: for<'b> TryFromCtx<'b, Endian, Error = scroll::Error> + SizeWith<Endian>,
    {
        let bytes = self.read_bytes(addr, T::size_with(&LE))?;
        Ok(bytes.as_slice().pread_with(0, LE)?)
    }

    /// Read a NUL-terminated ASCII string of at most `max_len` bytes. An
    /// unterminated run is truncated at the bound rather than rejected.
    pub fn read_cstring(&self, addr: u64, max_len: usize) -> Result<String> {
        let chunk = self.chunk_from(addr)?;
        let bytes = &chunk[..chunk.len().min(max_len)];
        let end = bytes.iter().position(|&b| b == 0).unwrap_or(bytes.len());
        String::from_utf8(bytes[..end].to_vec())
            .map_err(|_| Error::corrupt(format!("string at {addr:#x} is not ASCII")))
    }
}
