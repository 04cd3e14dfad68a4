//! Thread decoding: the ThreadList entries, the per-thread register context
//! windows, the optional ThreadInfo attributes, and the glue that hands a
//! thread to the right stack walker on first access.
use std::collections::BTreeMap;
use std::ops::Range;

use once_cell::sync::OnceCell;
use scroll::ctx::SizeWith;
use scroll::{Pread, LE};
use tracing::warn;

use crate::error::{Error, Result};
use crate::reader::{stream_bytes, DumpReader};
use crate::structs::{LocationDescriptor, ThreadEntry, ThreadInfoEntry, ThreadInfoListStream};
use crate::unwind::{self, StackFrame};
use crate::PointerWidth;

/// One named register value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Register {
    pub name: &'static str,
    pub value: u64,
}

// Byte offsets of the register window inside a 32-bit context record.
const X86_SEGMENTS_OFFSET: usize = 0x8c;
const X86_GPR_OFFSET: usize = 0x9c;
const X86_CONTEXT_MIN_SIZE: usize = 0xcc;

// Byte offsets of the two windows inside a 64-bit context record.
const X64_SEGMENTS_OFFSET: usize = 0x38;
const X64_GPR_OFFSET: usize = 0x78;
const X64_CONTEXT_MIN_SIZE: usize = 0x100;

const X86_GPR_NAMES: [&str; 12] = [
    "edi", "esi", "ebx", "edx", "ecx", "eax", "ebp", "eip", "cs", "eflags", "esp", "ss",
];
const X64_SEGMENT_NAMES: [&str; 6] = ["cs", "ds", "es", "fs", "gs", "ss"];
const X64_GPR_NAMES: [&str; 17] = [
    "rax", "rcx", "rdx", "rbx", "rsp", "rbp", "rsi", "rdi", "r8", "r9", "r10", "r11", "r12",
    "r13", "r14", "r15", "rip",
];

/// The values the stack walkers start from, kept alongside the display list
/// so the context blob is only decoded once.
#[derive(Debug, Clone)]
enum RawContext {
    X86 { eip: u32, esp: u32, ebp: u32 },
    X64 { gprs: [u64; 16], rip: u64 },
}

#[derive(Debug, Clone)]
struct DecodedContext {
    registers: Vec<Register>,
    raw: RawContext,
}

/// A thread of the dumped process. Registers and stack frames are decoded on
/// first access and cached; both accessors need the owning [`DumpReader`]
/// because they read through its address space.
#[derive(Debug)]
pub struct Thread {
    /// The thread id.
    pub id: u32,
    /// How many times the thread had been suspended.
    pub suspend_count: u32,
    /// The scheduling priority class of the owning process.
    pub priority_class: u32,
    /// The thread priority within its class.
    pub priority: u32,
    /// The thread environment block address.
    pub teb: u64,
    /// The thread's stack bounds, `[base, base + size)`.
    pub stack_range: Range<u64>,
    /// Timing and start-address metadata from the ThreadInfo stream, when
    /// present.
    pub attributes: BTreeMap<&'static str, u64>,
    context_location: LocationDescriptor,
    context: OnceCell<Option<DecodedContext>>,
    frames: OnceCell<Vec<StackFrame>>,
}

impl Thread {
    fn new(entry: &ThreadEntry) -> Self {
        let stack_base = entry.stack.start_of_memory_range;
        Self {
            id: entry.thread_id,
            suspend_count: entry.suspend_count,
            priority_class: entry.priority_class,
            priority: entry.priority,
            teb: entry.teb,
            stack_range: stack_base..stack_base + u64::from(entry.stack.memory.data_size),
            attributes: BTreeMap::new(),
            context_location: entry.thread_context,
            context: OnceCell::new(),
            frames: OnceCell::new(),
        }
    }

    fn decoded_context(&self, dump: &DumpReader<'_>) -> Option<&DecodedContext> {
        self.context
            .get_or_init(|| {
                match decode_context(dump.file_bytes(), &self.context_location, dump.pointer_width())
                {
                    Ok(context) => Some(context),
                    Err(err) => {
                        warn!(thread = self.id, %err, "failed to decode thread context");
                        None
                    }
                }
            })
            .as_ref()
    }

    /// The thread's registers, by architecture-appropriate name. Decoded on
    /// first access; an undecodable context reports as unavailable data.
    pub fn registers(&self, dump: &DumpReader<'_>) -> Result<&[Register]> {
        self.decoded_context(dump)
            .map(|context| context.registers.as_slice())
            .ok_or(Error::DataUnavailable("thread context is not decodable"))
    }

    /// Look a register up by name.
    pub fn register(&self, dump: &DumpReader<'_>, name: &str) -> Option<u64> {
        self.registers(dump)
            .ok()?
            .iter()
            .find(|register| register.name == name)
            .map(|register| register.value)
    }

    /// The thread's reconstructed call stack, outermost frame last. Computed
    /// once with the walker matching the dump's pointer width; a thread whose
    /// context cannot be decoded has an empty stack, and a walk that hits
    /// unreadable memory keeps the frames it collected.
    pub fn stack_frames(&self, dump: &DumpReader<'_>) -> &[StackFrame] {
        self.frames.get_or_init(|| {
            let Some(context) = self.decoded_context(dump) else {
                return Vec::new();
            };
            let space = dump.address_space();
            match context.raw {
                RawContext::X86 { eip, esp, ebp } => {
                    unwind::walk_x86(&space, self.stack_range.clone(), eip, esp, ebp)
                }
                RawContext::X64 { gprs, rip } => {
                    unwind::walk_x64(&space, dump.modules(), gprs, rip)
                }
            }
        })
    }
}

/// Decode the architecture-specific register window out of a context blob
/// located in the dump file.
fn decode_context(
    file: &[u8],
    location: &LocationDescriptor,
    width: PointerWidth,
) -> Result<DecodedContext> {
    let blob = stream_bytes(file, location)?;
    match width {
        PointerWidth::Bits32 => decode_context_x86(blob),
        PointerWidth::Bits64 => decode_context_x64(blob),
    }
}

fn decode_context_x86(blob: &[u8]) -> Result<DecodedContext> {
    if blob.len() < X86_CONTEXT_MIN_SIZE {
        return Err(Error::corrupt(format!(
            "x86 context record of {} bytes",
            blob.len()
        )));
    }

    let mut registers = Vec::with_capacity(16);
    for (index, name) in ["gs", "fs", "es", "ds"].into_iter().enumerate() {
        let value: u32 = blob.pread_with(X86_SEGMENTS_OFFSET + index * 4, LE)?;
        registers.push(Register { name, value: u64::from(value) });
    }
    for (index, name) in X86_GPR_NAMES.into_iter().enumerate() {
        let value: u32 = blob.pread_with(X86_GPR_OFFSET + index * 4, LE)?;
        registers.push(Register { name, value: u64::from(value) });
    }

    let at = |name: &str| {
        registers
            .iter()
            .find(|register| register.name == name)
            .map(|register| register.value as u32)
            .unwrap_or(0)
    };
    let raw = RawContext::X86 {
        eip: at("eip"),
        esp: at("esp"),
        ebp: at("ebp"),
    };

    Ok(DecodedContext { registers, raw })
}

fn decode_context_x64(blob: &[u8]) -> Result<DecodedContext> {
    if blob.len() < X64_CONTEXT_MIN_SIZE {
        return Err(Error::corrupt(format!(
            "x64 context record of {} bytes",
            blob.len()
        )));
    }

    let mut registers = Vec::with_capacity(24);
    for (index, name) in X64_SEGMENT_NAMES.into_iter().enumerate() {
        let value: u16 = blob.pread_with(X64_SEGMENTS_OFFSET + index * 2, LE)?;
        registers.push(Register { name, value: u64::from(value) });
    }
    let eflags: u32 = blob.pread_with(X64_SEGMENTS_OFFSET + 12, LE)?;
    registers.push(Register { name: "eflags", value: u64::from(eflags) });

    let mut gprs = [0u64; 16];
    for (index, name) in X64_GPR_NAMES.into_iter().enumerate() {
        let value: u64 = blob.pread_with(X64_GPR_OFFSET + index * 8, LE)?;
        registers.push(Register { name, value });
        if index < gprs.len() {
            gprs[index] = value;
        }
    }
    let rip = registers.last().map(|register| register.value).unwrap_or(0);

    Ok(DecodedContext {
        registers,
        raw: RawContext::X64 { gprs, rip },
    })
}

/// Decode every entry of the ThreadList stream. The records are fixed 48
/// bytes each at 4-byte-aligned offsets after the leading count.
pub(crate) fn decode_thread_list(file: &[u8], location: &LocationDescriptor) -> Result<Vec<Thread>> {
    let stream = stream_bytes(file, location)?;
    let count: u32 = stream.pread_with(0, LE)?;
    let entry_size = ThreadEntry::size_with(&LE);
    if 4 + u64::from(count) * entry_size as u64 > stream.len() as u64 {
        return Err(Error::corrupt(format!(
            "ThreadList declares {count} threads but the stream holds fewer"
        )));
    }

    let mut threads = Vec::with_capacity(count as usize);
    for index in 0..count as usize {
        let entry: ThreadEntry = stream.pread_with(4 + index * entry_size, LE)?;
        threads.push(Thread::new(&entry));
    }

    Ok(threads)
}

/// Decode the ThreadInfo stream and merge its scheduling and timing fields
/// into the matching threads' attribute maps.
pub(crate) fn merge_thread_info(
    file: &[u8],
    location: &LocationDescriptor,
    threads: &mut [Thread],
) -> Result<()> {
    let stream = stream_bytes(file, location)?;
    let header: ThreadInfoListStream = stream.pread_with(0, LE)?;

    let entry_size = ThreadInfoEntry::size_with(&LE) as u32;
    if header.size_of_entry < entry_size {
        return Err(Error::corrupt(format!(
            "ThreadInfoList entry size {} is smaller than expected {}",
            header.size_of_entry, entry_size
        )));
    }
    let table_size = u64::from(header.number_of_entries) * u64::from(header.size_of_entry)
        + u64::from(header.size_of_header);
    if table_size > stream.len() as u64 {
        return Err(Error::corrupt(format!(
            "ThreadInfoList declares {} entries but the stream holds fewer",
            header.number_of_entries
        )));
    }

    for index in 0..u64::from(header.number_of_entries) {
        let offset = u64::from(header.size_of_header) + index * u64::from(header.size_of_entry);
        let info: ThreadInfoEntry = stream.pread_with(offset as usize, LE)?;
        let Some(thread) = threads.iter_mut().find(|thread| thread.id == info.thread_id) else {
            continue;
        };
        thread.attributes.insert("dump_flags", u64::from(info.dump_flags));
        thread.attributes.insert("exit_status", u64::from(info.exit_status));
        thread.attributes.insert("create_time", info.create_time);
        thread.attributes.insert("exit_time", info.exit_time);
        thread.attributes.insert("kernel_time", info.kernel_time);
        thread.attributes.insert("user_time", info.user_time);
        thread.attributes.insert("start_address", info.start_address);
        thread.attributes.insert("affinity", info.affinity);
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Lay a register value into a synthetic context blob.
    fn put_u32(blob: &mut [u8], offset: usize, value: u32) {
        blob[offset..offset + 4].copy_from_slice(&value.to_le_bytes());
    }

    fn put_u64(blob: &mut [u8], offset: usize, value: u64) {
        blob[offset..offset + 8].copy_from_slice(&value.to_le_bytes());
    }

    #[test]
    fn x86_context_window() {
        let mut blob = vec![0u8; 0x2cc];
        put_u32(&mut blob, 0xb0, 0x1111_2222); // eax
        put_u32(&mut blob, 0xb4, 0x0040_0000); // ebp
        put_u32(&mut blob, 0xb8, 0x0040_1000); // eip
        put_u32(&mut blob, 0xc4, 0x0012_f000); // esp
        put_u32(&mut blob, 0x8c, 0x2b); // gs

        let context = decode_context_x86(&blob).unwrap();
        let find = |name: &str| {
            context
                .registers
                .iter()
                .find(|r| r.name == name)
                .unwrap()
                .value
        };
        assert_eq!(find("eax"), 0x1111_2222);
        assert_eq!(find("gs"), 0x2b);
        match context.raw {
            RawContext::X86 { eip, esp, ebp } => {
                assert_eq!(eip, 0x0040_1000);
                assert_eq!(esp, 0x0012_f000);
                assert_eq!(ebp, 0x0040_0000);
            }
            RawContext::X64 { .. } => panic!("wrong architecture"),
        }
    }

    #[test]
    fn x64_context_window() {
        let mut blob = vec![0u8; 0x4d0];
        blob[0x38] = 0x33; // cs
        put_u32(&mut blob, 0x44, 0x246); // eflags
        put_u64(&mut blob, 0x78, 0xaaaa); // rax
        put_u64(&mut blob, 0x98, 0x7fff_0000); // rsp
        put_u64(&mut blob, 0xf8, 0x1400_1000); // rip

        let context = decode_context_x64(&blob).unwrap();
        let find = |name: &str| {
            context
                .registers
                .iter()
                .find(|r| r.name == name)
                .unwrap()
                .value
        };
        assert_eq!(find("cs"), 0x33);
        assert_eq!(find("eflags"), 0x246);
        assert_eq!(find("rax"), 0xaaaa);
        assert_eq!(find("rip"), 0x1400_1000);
        match context.raw {
            RawContext::X64 { gprs, rip } => {
                assert_eq!(gprs[crate::unwind::GPR_RSP], 0x7fff_0000);
                assert_eq!(rip, 0x1400_1000);
            }
            RawContext::X86 { .. } => panic!("wrong architecture"),
        }
    }

    #[test]
    fn short_context_is_corrupt() {
        assert!(matches!(
            decode_context_x86(&[0u8; 0x40]),
            Err(Error::Corrupt(_))
        ));
        assert!(matches!(
            decode_context_x64(&[0u8; 0x80]),
            Err(Error::Corrupt(_))
        ));
    }
}
