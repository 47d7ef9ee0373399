//! # ELF64 executables
//!
//! Reads the file and program headers in place (no copies, every access
//! bounds-checked) and reports each `PT_LOAD` header as a [`Segment`].
//!
//! `ET_EXEC` images load at their link addresses. `ET_DYN` (position
//! independent) images are shifted by [`PIE_LOAD_BIAS`]; there is no
//! randomization.

use crate::image::{Image, ImageError, ImageLoader, ProgramHeaders, Segment};
use alloc::vec::Vec;
use bitfield_struct::bitfield;
use kernel_memory_addresses::{USER_HALF_END, VirtualAddress};
use kernel_vmem::VmaFlags;
use log::debug;

/// Where position-independent images are placed.
pub const PIE_LOAD_BIAS: u64 = 0x5555_5555_4000;

const ET_EXEC: u16 = 2;
const ET_DYN: u16 = 3;
const EM_X86_64: u16 = 62;
const PT_LOAD: u32 = 1;
const PT_PHDR: u32 = 6;

const EHDR_SIZE: usize = 64;
const PHDR_SIZE: usize = 56;

#[derive(Copy, Clone, Debug)]
#[allow(clippy::struct_field_names)]
struct Eh64 {
    e_type: u16,
    e_machine: u16,
    e_version: u32,
    e_entry: u64,
    e_phoff: u64,
    e_ehsize: u16,
    e_phentsize: u16,
    e_phnum: u16,
}

#[derive(Copy, Clone, Debug)]
#[allow(clippy::struct_field_names)]
struct Ph64 {
    p_type: u32,
    p_flags: PFlags,
    p_offset: u64,
    p_vaddr: u64,
    p_filesz: u64,
    p_memsz: u64,
}

/// `Elf64_Phdr.p_flags` (SVr4): bit0=X, bit1=W, bit2=R.
#[bitfield(u32)]
struct PFlags {
    execute: bool, // PF_X = 1
    write: bool,   // PF_W = 2
    read: bool,    // PF_R = 4
    #[bits(29)]
    __: u32,
}

impl PFlags {
    fn area_flags(self) -> VmaFlags {
        let mut flags = VmaFlags::USER;
        flags.set(VmaFlags::READ, self.read());
        flags.set(VmaFlags::WRITE, self.write());
        flags.set(VmaFlags::EXEC, self.execute());
        flags
    }
}

#[inline]
fn le16(x: &[u8]) -> u16 {
    u16::from_le_bytes([x[0], x[1]])
}

#[inline]
fn le32(x: &[u8]) -> u32 {
    u32::from_le_bytes([x[0], x[1], x[2], x[3]])
}

#[inline]
fn le64(x: &[u8]) -> u64 {
    u64::from_le_bytes([x[0], x[1], x[2], x[3], x[4], x[5], x[6], x[7]])
}

struct ElfView<'a> {
    bytes: &'a [u8],
    eh: Eh64,
}

impl<'a> ElfView<'a> {
    fn new(bytes: &'a [u8]) -> Result<Self, ImageError> {
        use ImageError::{BadClass, BadHeader, BadMachine, BadMagic, OutOfBounds, TooShort};
        if bytes.len() < EHDR_SIZE {
            return Err(TooShort);
        }

        // e_ident
        if &bytes[0..4] != b"\x7FELF" {
            return Err(BadMagic);
        }

        // ELFCLASS64
        if bytes[4] != 2 {
            return Err(BadClass);
        }

        // little-endian
        if bytes[5] != 1 {
            return Err(BadHeader);
        }

        let eh = Eh64 {
            e_type: le16(&bytes[16..18]),
            e_machine: le16(&bytes[18..20]),
            e_version: le32(&bytes[20..24]),
            e_entry: le64(&bytes[24..32]),
            e_phoff: le64(&bytes[32..40]),
            e_ehsize: le16(&bytes[52..54]),
            e_phentsize: le16(&bytes[54..56]),
            e_phnum: le16(&bytes[56..58]),
        };

        if !(eh.e_type == ET_EXEC || eh.e_type == ET_DYN) {
            return Err(BadHeader);
        }
        if eh.e_machine != EM_X86_64 {
            return Err(BadMachine);
        }
        if eh.e_version != 1 || eh.e_ehsize as usize > bytes.len() {
            return Err(BadHeader);
        }
        if eh.e_phentsize as usize != PHDR_SIZE {
            return Err(BadHeader);
        }

        let phoff = usize::try_from(eh.e_phoff).map_err(|_| OutOfBounds)?;
        let need = (eh.e_phnum as usize)
            .checked_mul(PHDR_SIZE)
            .and_then(|n| n.checked_add(phoff))
            .ok_or(OutOfBounds)?;
        if need > bytes.len() {
            return Err(OutOfBounds);
        }

        Ok(Self { bytes, eh })
    }

    const fn is_pie(&self) -> bool {
        self.eh.e_type == ET_DYN
    }

    fn program_header(&self, i: usize) -> Option<Ph64> {
        if i >= self.eh.e_phnum as usize {
            return None;
        }
        let p = usize::try_from(self.eh.e_phoff).ok()? + i * PHDR_SIZE;
        let s = self.bytes.get(p..p + PHDR_SIZE)?;
        Some(Ph64 {
            p_type: le32(&s[0..4]),
            p_flags: PFlags::from_bits(le32(&s[4..8])),
            p_offset: le64(&s[8..16]),
            p_vaddr: le64(&s[16..24]),
            p_filesz: le64(&s[32..40]),
            p_memsz: le64(&s[40..48]),
        })
    }

    fn program_headers(&self) -> impl Iterator<Item = Ph64> + '_ {
        (0..self.eh.e_phnum as usize).filter_map(|i| self.program_header(i))
    }

    /// The file bytes backing a `PT_LOAD` (`p_filesz` may be below `p_memsz`).
    fn segment_file_bytes(&self, ph: &Ph64) -> Result<&'a [u8], ImageError> {
        let off = usize::try_from(ph.p_offset).map_err(|_| ImageError::OutOfBounds)?;
        let sz = usize::try_from(ph.p_filesz).map_err(|_| ImageError::OutOfBounds)?;
        let end = off.checked_add(sz).ok_or(ImageError::OutOfBounds)?;
        self.bytes.get(off..end).ok_or(ImageError::OutOfBounds)
    }

    /// Unbiased address of the program header table: `PT_PHDR` if present,
    /// otherwise wherever the `PT_LOAD` containing `e_phoff` puts it.
    fn program_header_vaddr(&self) -> Option<u64> {
        if let Some(ph) = self.program_headers().find(|ph| ph.p_type == PT_PHDR) {
            return Some(ph.p_vaddr);
        }
        let phoff = self.eh.e_phoff;
        self.program_headers()
            .filter(|ph| ph.p_type == PT_LOAD)
            .find(|ph| ph.p_offset <= phoff && phoff - ph.p_offset < ph.p_filesz)
            .map(|ph| ph.p_vaddr + (phoff - ph.p_offset))
    }
}

/// Loader for x86-64 ELF64 executables.
#[derive(Copy, Clone, Debug, Default)]
pub struct ElfLoader;

impl ImageLoader for ElfLoader {
    fn parse<'a>(&self, bytes: &'a [u8]) -> Result<Image<'a>, ImageError> {
        let view = ElfView::new(bytes)?;
        let bias = if view.is_pie() { PIE_LOAD_BIAS } else { 0 };

        let mut segments = Vec::new();
        for ph in view.program_headers().filter(|ph| ph.p_type == PT_LOAD) {
            if ph.p_filesz > ph.p_memsz {
                return Err(ImageError::BadProgramHeader);
            }
            if ph.p_memsz == 0 {
                continue;
            }
            let vaddr = ph
                .p_vaddr
                .checked_add(bias)
                .filter(|v| {
                    v.checked_add(ph.p_memsz)
                        .is_some_and(|end| end <= USER_HALF_END)
                })
                .ok_or(ImageError::BadProgramHeader)?;
            segments.push(Segment {
                vaddr: VirtualAddress::new(vaddr),
                mem_size: ph.p_memsz,
                data: view.segment_file_bytes(&ph)?,
                file_offset: ph.p_offset,
                flags: ph.p_flags.area_flags(),
            });
        }
        if segments.is_empty() {
            return Err(ImageError::NoLoadableSegments);
        }

        let program_headers = view.program_header_vaddr().map(|v| ProgramHeaders {
            addr: VirtualAddress::new(v.wrapping_add(bias)),
            entry_size: PHDR_SIZE as u64,
            count: u64::from(view.eh.e_phnum),
        });
        let entry = VirtualAddress::new(view.eh.e_entry.wrapping_add(bias));
        debug!(
            "ELF image: entry {entry}, {} loadable segments{}",
            segments.len(),
            if view.is_pie() { ", position independent" } else { "" }
        );
        Ok(Image {
            entry,
            program_headers,
            segments,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Seg<'a> {
        vaddr: u64,
        flags: u32,
        data: &'a [u8],
        mem: u64,
    }

    /// Header, program headers, then each segment's bytes back to back.
    /// With `headers_at`, a leading `PT_LOAD` maps the header block there.
    #[allow(clippy::cast_possible_truncation)]
    fn build(e_type: u16, entry: u64, headers_at: Option<u64>, segs: &[Seg<'_>]) -> Vec<u8> {
        let phnum = segs.len() + usize::from(headers_at.is_some());
        let header_len = EHDR_SIZE + phnum * PHDR_SIZE;
        let mut out = vec![0u8; header_len];
        out[0..4].copy_from_slice(b"\x7FELF");
        out[4] = 2;
        out[5] = 1;
        out[6] = 1;
        out[16..18].copy_from_slice(&e_type.to_le_bytes());
        out[18..20].copy_from_slice(&EM_X86_64.to_le_bytes());
        out[20..24].copy_from_slice(&1u32.to_le_bytes());
        out[24..32].copy_from_slice(&entry.to_le_bytes());
        out[32..40].copy_from_slice(&(EHDR_SIZE as u64).to_le_bytes());
        out[52..54].copy_from_slice(&(EHDR_SIZE as u16).to_le_bytes());
        out[54..56].copy_from_slice(&(PHDR_SIZE as u16).to_le_bytes());
        out[56..58].copy_from_slice(&(phnum as u16).to_le_bytes());

        let mut write_ph = |i: usize, flags: u32, offset: u64, vaddr: u64, filesz: u64, memsz: u64| {
            let p = EHDR_SIZE + i * PHDR_SIZE;
            out[p..p + 4].copy_from_slice(&PT_LOAD.to_le_bytes());
            out[p + 4..p + 8].copy_from_slice(&flags.to_le_bytes());
            out[p + 8..p + 16].copy_from_slice(&offset.to_le_bytes());
            out[p + 16..p + 24].copy_from_slice(&vaddr.to_le_bytes());
            out[p + 32..p + 40].copy_from_slice(&filesz.to_le_bytes());
            out[p + 40..p + 48].copy_from_slice(&memsz.to_le_bytes());
        };

        let mut i = 0;
        if let Some(at) = headers_at {
            write_ph(0, 4, 0, at, header_len as u64, header_len as u64);
            i = 1;
        }
        let mut offset = header_len as u64;
        for s in segs {
            write_ph(i, s.flags, offset, s.vaddr, s.data.len() as u64, s.mem);
            offset += s.data.len() as u64;
            i += 1;
        }
        for s in segs {
            out.extend_from_slice(s.data);
        }
        out
    }

    #[test]
    fn reports_load_segments_and_entry() {
        let text = [0x90u8; 32];
        let data = [7u8; 8];
        let bytes = build(
            ET_EXEC,
            0x40_1000,
            None,
            &[
                Seg { vaddr: 0x40_1000, flags: 5, data: &text, mem: 32 },
                Seg { vaddr: 0x40_3000, flags: 6, data: &data, mem: 0x1800 },
            ],
        );
        let image = ElfLoader.parse(&bytes).unwrap();
        assert_eq!(image.entry, VirtualAddress::new(0x40_1000));
        assert_eq!(image.segments.len(), 2);
        assert_eq!(image.program_headers, None);

        let t = &image.segments[0];
        assert_eq!(t.flags, VmaFlags::READ | VmaFlags::EXEC | VmaFlags::USER);
        assert_eq!(t.data, &text);
        let d = &image.segments[1];
        assert_eq!(d.flags, VmaFlags::USER_RW);
        assert_eq!(d.mem_size, 0x1800);
        assert_eq!(image.end(), VirtualAddress::new(0x40_5000));
    }

    #[test]
    fn program_headers_are_found_through_their_load_segment() {
        let text = [0xC3u8; 4];
        let bytes = build(
            ET_DYN,
            0x1000,
            Some(0),
            &[Seg { vaddr: 0x1000, flags: 5, data: &text, mem: 4 }],
        );
        let image = ElfLoader.parse(&bytes).unwrap();
        assert_eq!(image.entry, VirtualAddress::new(PIE_LOAD_BIAS + 0x1000));
        assert_eq!(
            image.program_headers,
            Some(ProgramHeaders {
                addr: VirtualAddress::new(PIE_LOAD_BIAS + EHDR_SIZE as u64),
                entry_size: PHDR_SIZE as u64,
                count: 2,
            })
        );
        assert_eq!(image.segments[0].vaddr, VirtualAddress::new(PIE_LOAD_BIAS));
    }

    #[test]
    fn malformed_images_are_rejected() {
        assert_eq!(ElfLoader.parse(&[0x7F, b'E']), Err(ImageError::TooShort));

        let good = build(
            ET_EXEC,
            0x40_1000,
            None,
            &[Seg { vaddr: 0x40_1000, flags: 5, data: &[1, 2, 3], mem: 3 }],
        );

        let mut bad = good.clone();
        bad[0] = 0;
        assert_eq!(ElfLoader.parse(&bad), Err(ImageError::BadMagic));

        let mut bad = good.clone();
        bad[4] = 1;
        assert_eq!(ElfLoader.parse(&bad), Err(ImageError::BadClass));

        let mut bad = good.clone();
        bad[18] = 3;
        assert_eq!(ElfLoader.parse(&bad), Err(ImageError::BadMachine));

        // p_filesz larger than p_memsz
        let mut bad = good.clone();
        let memsz = EHDR_SIZE + 40;
        bad[memsz..memsz + 8].copy_from_slice(&1u64.to_le_bytes());
        assert_eq!(ElfLoader.parse(&bad), Err(ImageError::BadProgramHeader));

        // Segment data runs past the end of the file.
        assert_eq!(
            ElfLoader.parse(&good[..good.len() - 1]),
            Err(ImageError::OutOfBounds)
        );

        let empty = build(ET_EXEC, 0x40_1000, None, &[]);
        assert_eq!(ElfLoader.parse(&empty), Err(ImageError::NoLoadableSegments));
    }
}
