//! # Program images
//!
//! The lifecycle manager never parses executables itself. An
//! [`ImageLoader`] turns the bytes of a file into an [`Image`]: the entry
//! point, where the program headers end up in memory and the loadable
//! segments with their permissions and file contents. [`ElfLoader`] is the
//! implementation for x86-64 ELF64 executables.

pub mod elf;

pub use elf::ElfLoader;

use alloc::vec::Vec;
use kernel_memory_addresses::{PAGE_SIZE, VirtualAddress, align_down, checked_align_up};
use kernel_vmem::{VmaFlags, VmaKind};

#[derive(Debug, thiserror::Error, Copy, Clone, Eq, PartialEq)]
pub enum ImageError {
    #[error("image is truncated")]
    TooShort,
    #[error("not an ELF file")]
    BadMagic,
    #[error("not a 64-bit image")]
    BadClass,
    #[error("not an x86-64 image")]
    BadMachine,
    #[error("malformed file header")]
    BadHeader,
    #[error("header points outside the file")]
    OutOfBounds,
    #[error("malformed program header")]
    BadProgramHeader,
    #[error("no loadable segments")]
    NoLoadableSegments,
}

/// One loadable range.
///
/// `data` initializes the first `data.len()` bytes at `vaddr`; the rest up
/// to `mem_size` reads as zero.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct Segment<'a> {
    pub vaddr: VirtualAddress,
    pub mem_size: u64,
    pub data: &'a [u8],
    /// File position of `data`.
    pub file_offset: u64,
    pub flags: VmaFlags,
}

impl Segment<'_> {
    /// Page-aligned start of the area covering the segment.
    #[must_use]
    pub const fn area_start(&self) -> VirtualAddress {
        VirtualAddress::new(align_down(self.vaddr.as_u64(), PAGE_SIZE))
    }

    /// Page-aligned end of the area covering the segment.
    #[must_use]
    pub fn area_end(&self) -> Option<VirtualAddress> {
        self.vaddr
            .as_u64()
            .checked_add(self.mem_size)
            .and_then(|end| checked_align_up(end, PAGE_SIZE))
            .map(VirtualAddress::new)
    }

    /// What backs the covering area: the file if the segment carries data.
    #[must_use]
    pub const fn kind(&self) -> VmaKind {
        if self.data.is_empty() {
            VmaKind::Anonymous
        } else {
            let lead = self.vaddr.as_u64() - self.area_start().as_u64();
            VmaKind::File {
                offset: self.file_offset.saturating_sub(lead),
            }
        }
    }
}

/// Where the program header table is visible to the program.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct ProgramHeaders {
    pub addr: VirtualAddress,
    pub entry_size: u64,
    pub count: u64,
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Image<'a> {
    pub entry: VirtualAddress,
    pub program_headers: Option<ProgramHeaders>,
    pub segments: Vec<Segment<'a>>,
}

impl Image<'_> {
    /// First page above every segment; the heap starts here.
    #[must_use]
    pub fn end(&self) -> VirtualAddress {
        self.segments
            .iter()
            .filter_map(Segment::area_end)
            .max()
            .unwrap_or_else(VirtualAddress::zero)
    }
}

pub trait ImageLoader {
    /// # Errors
    /// [`ImageError`] for anything that can't be loaded.
    fn parse<'a>(&self, bytes: &'a [u8]) -> Result<Image<'a>, ImageError>;
}
