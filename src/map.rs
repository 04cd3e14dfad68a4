//! Byte-source handling. A dump is either memory mapped from a file or
//! borrowed from a slice the caller already owns; every decoder sees the same
//! flat little-endian byte view either way.
use std::{fs, io, ops, path};

use memmap2::Mmap;

/// The backing bytes of a dump. The mapped variant owns its mapping for the
/// lifetime of the reader, the borrowed variant lets callers parse from a
/// `Vec<u8>`, an embedded resource, or a mapping they manage themselves.
#[derive(Debug)]
pub enum MappedFile<'a> {
    /// A read-only memory mapping of the dump file.
    Mapped(Mmap),
    /// A byte slice owned by somebody else.
    Borrowed(&'a [u8]),
}

impl MappedFile<'_> {
    /// Open `path` and memory map it read-only.
    pub fn open<P>(path: P) -> io::Result<MappedFile<'static>>
    where
        P: AsRef<path::Path>,
    {
        let file = fs::File::open(path)?;

        // SAFETY: the mapping is read-only and lives as long as this value;
        // not truncating the file under an open mapping is the caller's
        // contract to keep.
        let mmap = unsafe { Mmap::map(&file)? };

        Ok(MappedFile::Mapped(mmap))
    }

    /// The raw dump bytes.
    pub fn bytes(&self) -> &[u8] {
        match self {
            Self::Mapped(mmap) => mmap,
            Self::Borrowed(slice) => slice,
        }
    }
}

impl<'a> From<&'a [u8]> for MappedFile<'a> {
    fn from(value: &'a [u8]) -> Self {
        Self::Borrowed(value)
    }
}

impl ops::Deref for MappedFile<'_> {
    type Target = [u8];

    fn deref(&self) -> &Self::Target {
        self.bytes()
    }
}
