#![doc = include_str!("../README.md")]
mod error;
pub use error::{Error, Result};

mod map;
pub use map::MappedFile;

mod structs;
pub use structs::{
    FixedFileInfo, RuntimeFunctionEntry, PROCESSOR_ARCHITECTURE_ALPHA64,
    PROCESSOR_ARCHITECTURE_AMD64, PROCESSOR_ARCHITECTURE_IA64, PROCESSOR_ARCHITECTURE_INTEL,
    PROCESSOR_ARCHITECTURE_X86_ON_WIN64,
};

mod memory;
pub use memory::{
    AddressSpace, Backing, MemoryRange, MEM_COMMIT, MEM_FREE, MEM_IMAGE, MEM_MAPPED, MEM_PRIVATE,
    MEM_RESERVE, PAGE_EXECUTE, PAGE_EXECUTE_READ, PAGE_EXECUTE_READWRITE, PAGE_EXECUTE_WRITECOPY,
    PAGE_GUARD, PAGE_NOACCESS, PAGE_NOCACHE, PAGE_READONLY, PAGE_READWRITE, PAGE_WRITECOMBINE,
    PAGE_WRITECOPY,
};

mod modules;
pub use modules::{Module, ModuleSection, Symbol};

mod threads;
pub use threads::{Register, Thread};

mod unwind;
pub use unwind::StackFrame;

mod reader;
pub use reader::{DumpReader, PointerWidth};
