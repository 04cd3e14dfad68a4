//! Stack reconstruction. Two walkers, selected once per dump by pointer
//! width: frame-pointer chaining for 32-bit processes and table-driven
//! unwinding for 64-bit ones, where each module's exception directory names
//! the unwind-info program to interpret for the function containing the
//! instruction pointer.
//!
//! Both walkers are best-effort by contract: any unreadable address or
//! undecodable unwind program stops the walk and the frames collected so far
//! are the result. Short stacks are normal on truncated dumps.
use std::ops::Range;

use tracing::debug;

use crate::error::{Error, Result};
use crate::memory::AddressSpace;
use crate::modules::Module;
use crate::structs::RuntimeFunctionEntry;

/// One reconstructed stack frame. The innermost frame carries the thread's
/// instruction pointer; every later frame carries a return address.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StackFrame {
    pub frame_base: u64,
    pub return_address: u64,
}

/// Ceiling on reconstructed frames, so a corrupted cyclic frame chain cannot
/// walk forever.
const MAX_STACK_FRAMES: usize = 4096;

/// A 32-bit thread parked in a system call reports this instruction pointer.
const X86_SYSCALL_SENTINEL: u32 = u32::MAX;

/// Index of `rsp` in the x64 integer register file, which is laid out in the
/// unwind-operation encoding order (rax, rcx, rdx, rbx, rsp, rbp, rsi, rdi,
/// r8..r15).
pub(crate) const GPR_RSP: usize = 4;

/// Frame-pointer chase for 32-bit threads.
///
/// The walk starts at the frame-base register when it lies inside the
/// thread's stack bounds, otherwise at the stack pointer advanced past the
/// recovered instruction pointer. Each step loads the caller's frame base at
/// `frame_base` and the return address one pointer above it, and the walk
/// ends as soon as the chain leaves the stack bounds or a load faults.
pub(crate) fn walk_x86(
    space: &AddressSpace<'_>,
    stack: Range<u64>,
    eip: u32,
    esp: u32,
    ebp: u32,
) -> Vec<StackFrame> {
    let esp = u64::from(esp);
    let ebp = u64::from(ebp);
    let mut eip = u64::from(eip);

    // A thread that was sitting in a system call has no user-mode
    // instruction pointer in its context; the real one is on top of the
    // stack.
    if eip == u64::from(X86_SYSCALL_SENTINEL) && stack.contains(&esp) {
        if let Ok(recovered) = space.read_u32(esp) {
            eip = u64::from(recovered);
        }
    }

    let mut frame_base = if stack.contains(&ebp) { ebp } else { esp + 4 };

    let mut frames = vec![StackFrame {
        frame_base,
        return_address: eip,
    }];
    while frames.len() < MAX_STACK_FRAMES {
        if !stack.contains(&frame_base) {
            break;
        }
        let Ok(next_base) = space.read_u32(frame_base) else {
            break;
        };
        let Ok(return_address) = space.read_u32(frame_base + 4) else {
            break;
        };
        frames.push(StackFrame {
            frame_base: u64::from(next_base),
            return_address: u64::from(return_address),
        });
        frame_base = u64::from(next_base);
    }

    frames
}

/// Table-driven unwind for 64-bit threads.
///
/// Starting from `(rsp, rip)`, each iteration emits a frame, locates the
/// module and exception-directory entry covering the instruction pointer,
/// interprets that function's unwind-info program to recover the caller's
/// stack pointer, and loads the next return address from the top of the
/// recovered stack.
pub(crate) fn walk_x64(
    space: &AddressSpace<'_>,
    modules: &[Module],
    mut regs: [u64; 16],
    rip: u64,
) -> Vec<StackFrame> {
    let mut frames = Vec::new();
    let mut ip = rip;
    while ip != 0 && frames.len() < MAX_STACK_FRAMES {
        frames.push(StackFrame {
            frame_base: regs[GPR_RSP],
            return_address: ip,
        });

        let Some(module) = modules.iter().find(|module| module.contains(ip)) else {
            break;
        };
        let Some(function) = module.find_function((ip - module.base) as u32) else {
            break;
        };
        if let Err(err) = apply_unwind_info(space, module.base, function.unwind_info_address, &mut regs)
        {
            debug!(ip = %format_args!("{ip:#x}"), %err, "unwind stopped");
            break;
        }

        let Ok(return_address) = space.read_u64(regs[GPR_RSP]) else {
            break;
        };
        ip = return_address;
        regs[GPR_RSP] += 8;
    }

    frames
}

// Unwind operation codes, per the published x64 exception-handling format.
const UWOP_PUSH_NONVOL: u8 = 0;
const UWOP_ALLOC_LARGE: u8 = 1;
const UWOP_ALLOC_SMALL: u8 = 2;
const UWOP_SET_FPREG: u8 = 3;
const UWOP_SAVE_NONVOL: u8 = 4;
const UWOP_SAVE_NONVOL_FAR: u8 = 5;
const UWOP_EPILOG_OR_SAVE_XMM: u8 = 6;
const UWOP_SPARE_OR_SAVE_XMM_FAR: u8 = 7;
const UWOP_SAVE_XMM128: u8 = 8;
const UWOP_SAVE_XMM128_FAR: u8 = 9;
const UWOP_PUSH_MACHFRAME: u8 = 10;

/// The unwind-info header flag announcing a chained function entry after the
/// code array.
const UNW_FLAG_CHAININFO: u8 = 0x4;

/// How many chained entries we are willing to follow.
const MAX_CHAIN_DEPTH: usize = 32;

/// One decoded unwind operation. The set is open ended on purpose: every
/// operation reduces to an effect on the tracked register file, and codes
/// with no bearing on the stack pointer decode to [`UnwindOp::Untracked`].
#[derive(Debug, Clone, Copy)]
enum UnwindOp {
    /// Pop one nonvolatile register off the stack.
    PushedNonvolatile { reg: u8 },
    /// Undo a fixed stack allocation.
    Alloc { size: u64 },
    /// Recompute the stack pointer from the frame register.
    FrameRegister,
    /// Skip past a pushed hardware exception frame, leaving the faulting
    /// instruction pointer on top of the stack.
    MachineFrame { error_code: bool },
    /// A register or xmm save slot; no stack-pointer effect.
    Untracked,
}

/// Decode the operation at `slot`, returning it and the number of 16-bit
/// slots it occupies.
fn decode_op(codes: &[u8], slot: usize) -> Result<(UnwindOp, usize)> {
    let slot_u16 = |index: usize| -> Result<u64> {
        let bytes = codes
            .get(index * 2..index * 2 + 2)
            .ok_or_else(|| Error::corrupt("unwind code array is too short"))?;
        Ok(u64::from(u16::from_le_bytes([bytes[0], bytes[1]])))
    };

    let op_byte = codes
        .get(slot * 2 + 1)
        .copied()
        .ok_or_else(|| Error::corrupt("unwind code array is too short"))?;
    let op = op_byte & 0xf;
    let info = op_byte >> 4;

    Ok(match op {
        UWOP_PUSH_NONVOL => (UnwindOp::PushedNonvolatile { reg: info }, 1),
        UWOP_ALLOC_LARGE => match info {
            0 => (UnwindOp::Alloc { size: slot_u16(slot + 1)? * 8 }, 2),
            1 => (
                UnwindOp::Alloc {
                    size: slot_u16(slot + 1)? | (slot_u16(slot + 2)? << 16),
                },
                3,
            ),
            _ => return Err(Error::corrupt(format!("alloc-large op info {info}"))),
        },
        UWOP_ALLOC_SMALL => (UnwindOp::Alloc { size: u64::from(info) * 8 + 8 }, 1),
        UWOP_SET_FPREG => (UnwindOp::FrameRegister, 1),
        UWOP_SAVE_NONVOL => (UnwindOp::Untracked, 2),
        UWOP_SAVE_NONVOL_FAR => (UnwindOp::Untracked, 3),
        UWOP_EPILOG_OR_SAVE_XMM => (UnwindOp::Untracked, 2),
        UWOP_SPARE_OR_SAVE_XMM_FAR => (UnwindOp::Untracked, 3),
        UWOP_SAVE_XMM128 => (UnwindOp::Untracked, 2),
        UWOP_SAVE_XMM128_FAR => (UnwindOp::Untracked, 3),
        UWOP_PUSH_MACHFRAME => (UnwindOp::MachineFrame { error_code: info != 0 }, 1),
        _ => return Err(Error::corrupt(format!("unwind opcode {op}"))),
    })
}

/// Interpret the unwind-info program at `base + info_rva` against the
/// register file, following chained entries, and leave the caller's stack
/// pointer in `regs[GPR_RSP]`.
fn apply_unwind_info(
    space: &AddressSpace<'_>,
    base: u64,
    info_rva: u32,
    regs: &mut [u64; 16],
) -> Result<()> {
    let mut info_rva = info_rva;
    for _ in 0..MAX_CHAIN_DEPTH {
        let info_addr = base + u64::from(info_rva);
        let header = space.read_bytes(info_addr, 4)?;
        let version = header[0] & 0x7;
        let flags = header[0] >> 3;
        if version != 1 && version != 2 {
            return Err(Error::corrupt(format!("unwind info version {version}")));
        }
        let count = usize::from(header[2]);
        let frame_register = header[3] & 0xf;
        let frame_offset = u64::from(header[3] >> 4);

        let codes = space.read_bytes(info_addr + 4, count * 2)?;
        apply_opcodes(space, &codes, frame_register, frame_offset, regs)?;

        if flags & UNW_FLAG_CHAININFO != 0 {
            // The chained function entry sits after the code array, which is
            // padded to an even slot count.
            let chained_at = info_addr + 4 + (((count + 1) & !1) * 2) as u64;
            let chained: RuntimeFunctionEntry = space.read_struct(chained_at)?;
            info_rva = chained.unwind_info_address;
            continue;
        }
        return Ok(());
    }

    Err(Error::corrupt("unwind info chain is too deep"))
}

/// Apply one function's unwind codes, in array order, which is the reverse
/// of prolog execution order. Register restores are best effort; the stack
/// pointer is the value that matters.
fn apply_opcodes(
    space: &AddressSpace<'_>,
    codes: &[u8],
    frame_register: u8,
    frame_offset: u64,
    regs: &mut [u64; 16],
) -> Result<()> {
    let total_slots = codes.len() / 2;
    let mut slot = 0;
    while slot < total_slots {
        let (op, consumed) = decode_op(codes, slot)?;
        match op {
            UnwindOp::PushedNonvolatile { reg } => {
                if let Ok(saved) = space.read_u64(regs[GPR_RSP]) {
                    regs[usize::from(reg)] = saved;
                }
                regs[GPR_RSP] += 8;
            }
            UnwindOp::Alloc { size } => regs[GPR_RSP] += size,
            UnwindOp::FrameRegister => {
                if frame_register == 0 {
                    return Err(Error::corrupt("set-fpreg with no frame register"));
                }
                regs[GPR_RSP] =
                    regs[usize::from(frame_register)].wrapping_sub(frame_offset * 16);
            }
            UnwindOp::MachineFrame { error_code } => {
                if error_code {
                    regs[GPR_RSP] += 8;
                }
            }
            UnwindOp::Untracked => {}
        }
        slot += consumed;
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use super::*;
    use crate::memory::{Backing, MemoryRange};

    fn backed_range(base: u64, size: u64, file_offset: u64) -> MemoryRange {
        MemoryRange {
            base,
            size,
            backing: Backing::Backed { file_offset },
            state: 0,
            protect: 0,
            mem_type: 0,
        }
    }

    fn put_u32(buf: &mut [u8], offset: usize, value: u32) {
        buf[offset..offset + 4].copy_from_slice(&value.to_le_bytes());
    }

    fn put_u64(buf: &mut [u8], offset: usize, value: u64) {
        buf[offset..offset + 8].copy_from_slice(&value.to_le_bytes());
    }

    /// A frame-pointer chain of five links whose last value leaves the stack
    /// bounds produces exactly five frames, without an error.
    #[test]
    fn x86_walk_terminates_at_stack_bounds() {
        let mut stack = vec![0u8; 0x100];
        let links = [0x1010u32, 0x1020, 0x1030, 0x9999];
        for (i, link) in links.iter().enumerate() {
            let base = i * 0x10;
            put_u32(&mut stack, base, *link);
            put_u32(&mut stack, base + 4, 0x4000_0000 + i as u32);
        }
        let ranges = vec![backed_range(0x1000, 0x100, 0)];
        let space = AddressSpace::new(&ranges, &stack);

        let frames = walk_x86(&space, 0x1000..0x1100, 0x7000_0000, 0x1080, 0x1000);
        assert_eq!(frames.len(), 5);
        assert_eq!(frames[0], StackFrame { frame_base: 0x1000, return_address: 0x7000_0000 });
        assert_eq!(frames[1], StackFrame { frame_base: 0x1010, return_address: 0x4000_0000 });
        assert_eq!(frames[4], StackFrame { frame_base: 0x9999, return_address: 0x4000_0003 });
    }

    /// A thread parked in a system call recovers its instruction pointer
    /// from the top of the stack, and the frame base falls back to the stack
    /// pointer when the frame register is out of bounds.
    #[test]
    fn x86_walk_recovers_syscall_instruction_pointer() {
        let mut stack = vec![0u8; 0x100];
        put_u32(&mut stack, 0x40, 0x7fff_1234);
        let ranges = vec![backed_range(0x1000, 0x100, 0)];
        let space = AddressSpace::new(&ranges, &stack);

        let frames = walk_x86(&space, 0x1000..0x1100, u32::MAX, 0x1040, 0xdead_0000);
        assert_eq!(frames[0], StackFrame { frame_base: 0x1044, return_address: 0x7fff_1234 });
    }

    fn bare_module(base: u64, size: u64, table: Option<Vec<RuntimeFunctionEntry>>) -> Module {
        Module {
            name: "test.dll".into(),
            base,
            size,
            is_executable_image: false,
            version_info: crate::structs::FixedFileInfo::default(),
            sections: Vec::new(),
            symbols: Vec::new(),
            unwind_table: table,
            attributes: BTreeMap::new(),
        }
    }

    /// An instruction pointer outside every module yields exactly the
    /// starting frame.
    #[test]
    fn x64_walk_stops_without_a_module() {
        let ranges: Vec<MemoryRange> = Vec::new();
        let space = AddressSpace::new(&ranges, &[]);
        let mut regs = [0u64; 16];
        regs[GPR_RSP] = 0x10_0000;

        let frames = walk_x64(&space, &[], regs, 0x5000);
        assert_eq!(frames, vec![StackFrame { frame_base: 0x10_0000, return_address: 0x5000 }]);
    }

    /// Full table-driven step: an alloc-small plus a nonvolatile push move
    /// the stack pointer by 40 bytes, then the return address is loaded from
    /// the recovered top of stack.
    #[test]
    fn x64_walk_applies_unwind_opcodes() {
        const IMAGE_BASE: u64 = 0x40_0000;
        const STACK_BASE: u64 = 0x10_0000;

        let mut file = vec![0u8; 0x3100];
        // Unwind info at image rva 0x2000: version 1, no flags, two codes.
        file[0x2000] = 1;
        file[0x2002] = 2;
        // UWOP_ALLOC_SMALL, info 3 -> rsp += 32.
        file[0x2004] = 5;
        file[0x2005] = 0x32;
        // UWOP_PUSH_NONVOL, rbp -> rsp += 8.
        file[0x2006] = 1;
        file[0x2007] = 0x50;
        // Stack bytes live at file offset 0x3000; the return address sits at
        // the unwound stack top, STACK_BASE + 40.
        put_u64(&mut file, 0x3000 + 40, 0x9000_0000);

        let ranges = vec![
            backed_range(STACK_BASE, 0x100, 0x3000),
            backed_range(IMAGE_BASE, 0x3000, 0),
        ];
        let space = AddressSpace::new(&ranges, &file);

        let table = vec![RuntimeFunctionEntry {
            start_address: 0x1000,
            end_address: 0x1040,
            unwind_info_address: 0x2000,
        }];
        let modules = vec![bare_module(IMAGE_BASE, 0x3000, Some(table))];

        let mut regs = [0u64; 16];
        regs[GPR_RSP] = STACK_BASE;

        let frames = walk_x64(&space, &modules, regs, IMAGE_BASE + 0x1010);
        assert_eq!(frames.len(), 2);
        assert_eq!(frames[0], StackFrame { frame_base: STACK_BASE, return_address: IMAGE_BASE + 0x1010 });
        assert_eq!(
            frames[1],
            StackFrame { frame_base: STACK_BASE + 48, return_address: 0x9000_0000 }
        );
    }

    /// Chained unwind info: the primary entry has no codes of its own and
    /// forwards to a parent whose allocation is applied.
    #[test]
    fn chained_unwind_info_is_followed() {
        let mut file = vec![0u8; 0x3000];
        // Primary info at rva 0x2000: version 1, chain flag, zero codes,
        // chained RUNTIME_FUNCTION immediately after the header.
        file[0x2000] = 1 | (UNW_FLAG_CHAININFO << 3);
        put_u32(&mut file, 0x2004, 0x1000);
        put_u32(&mut file, 0x2008, 0x1040);
        put_u32(&mut file, 0x200c, 0x2800);
        // Parent info at rva 0x2800: one alloc-small of 16 bytes.
        file[0x2800] = 1;
        file[0x2802] = 1;
        file[0x2804] = 3;
        file[0x2805] = 0x12;

        let ranges = vec![backed_range(0x40_0000, 0x3000, 0)];
        let space = AddressSpace::new(&ranges, &file);

        let mut regs = [0u64; 16];
        regs[GPR_RSP] = 0x10_0000;
        apply_unwind_info(&space, 0x40_0000, 0x2000, &mut regs).unwrap();
        assert_eq!(regs[GPR_RSP], 0x10_0000 + 16);
    }

    /// The frame-register operation recomputes the stack pointer from the
    /// tracked register file.
    #[test]
    fn set_frame_register_recomputes_stack_pointer() {
        let ranges: Vec<MemoryRange> = Vec::new();
        let space = AddressSpace::new(&ranges, &[]);
        let mut regs = [0u64; 16];
        regs[5] = 0x20_0100; // rbp
        // UWOP_SET_FPREG with frame register rbp, frame offset 2 (32 bytes).
        let codes = [0u8, 0x03];
        apply_opcodes(&space, &codes, 5, 2, &mut regs).unwrap();
        assert_eq!(regs[GPR_RSP], 0x20_0100 - 32);
    }

    #[test]
    fn alloc_large_decodes_both_forms() {
        let ranges: Vec<MemoryRange> = Vec::new();
        let space = AddressSpace::new(&ranges, &[]);

        let mut regs = [0u64; 16];
        // Form 0: size in one slot, scaled by 8.
        let codes = [0u8, 0x01, 0x20, 0x00];
        apply_opcodes(&space, &codes, 0, 0, &mut regs).unwrap();
        assert_eq!(regs[GPR_RSP], 0x100);

        let mut regs = [0u64; 16];
        // Form 1: unscaled 32-bit size over two slots.
        let codes = [0u8, 0x11, 0x00, 0x00, 0x02, 0x00];
        apply_opcodes(&space, &codes, 0, 0, &mut regs).unwrap();
        assert_eq!(regs[GPR_RSP], 0x2_0000);
    }

    #[test]
    fn unknown_opcode_is_corruption() {
        let err = decode_op(&[0u8, 0x0f], 0).unwrap_err();
        assert!(matches!(err, Error::Corrupt(_)));
    }
}
