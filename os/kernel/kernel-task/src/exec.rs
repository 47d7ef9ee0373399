//! # Initial user stack
//!
//! What a program finds on its stack at the entry point, System V x86-64
//! style. Built as a byte image first so `exec` can fail before touching the
//! caller's address space.
//!
//! ```text
//! top ─► ┌─────────────────────────────┐
//!        │ 16 random bytes (AT_RANDOM) │
//!        │ argv strings, envp strings  │
//!        │ padding to 16 bytes         │
//!        │ auxv pairs, AT_NULL         │
//!        │ envp pointers, NULL         │
//!        │ argv pointers, NULL         │
//! sp ──► │ argc                        │
//!        └─────────────────────────────┘
//! ```

use crate::error::TaskError;
use crate::image::ProgramHeaders;
use alloc::vec::Vec;
use kernel_info::memory::{ARG_MAX, PAGE_SIZE};
use kernel_memory_addresses::VirtualAddress;

pub mod auxv {
    pub const AT_NULL: u64 = 0;
    pub const AT_PHDR: u64 = 3;
    pub const AT_PHENT: u64 = 4;
    pub const AT_PHNUM: u64 = 5;
    pub const AT_PAGESZ: u64 = 6;
    pub const AT_ENTRY: u64 = 9;
    pub const AT_RANDOM: u64 = 25;
}

/// The image facts handed to the program through the auxiliary vector.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct EntryInfo {
    pub entry: VirtualAddress,
    pub program_headers: Option<ProgramHeaders>,
    pub random: [u8; 16],
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct InitialStack {
    /// Contents of `[sp, top)`.
    pub bytes: Vec<u8>,
    /// Stack pointer at entry; points at `argc`.
    pub sp: VirtualAddress,
}

/// Lay out argc, argv, envp and auxv below `top`.
///
/// # Errors
/// [`TaskError::ArgumentsTooLarge`] beyond [`ARG_MAX`] bytes in total.
#[allow(clippy::cast_possible_truncation)]
pub fn initial_stack(
    top: VirtualAddress,
    argv: &[&str],
    envp: &[&str],
    info: &EntryInfo,
) -> Result<InitialStack, TaskError> {
    let strings: usize = argv.iter().chain(envp).map(|s| s.len() + 1).sum();
    if strings + info.random.len() > ARG_MAX {
        return Err(TaskError::ArgumentsTooLarge);
    }

    let mut aux = Vec::with_capacity(7);
    if let Some(ph) = info.program_headers {
        aux.push((auxv::AT_PHDR, ph.addr.as_u64()));
        aux.push((auxv::AT_PHENT, ph.entry_size));
        aux.push((auxv::AT_PHNUM, ph.count));
    }
    aux.push((auxv::AT_PAGESZ, PAGE_SIZE));
    aux.push((auxv::AT_ENTRY, info.entry.as_u64()));

    let top = top.as_u64();
    let random_at = top - info.random.len() as u64;
    aux.push((auxv::AT_RANDOM, random_at));
    aux.push((auxv::AT_NULL, 0));

    // Strings go right below the random bytes, argv first.
    let mut cursor = random_at;
    let mut placed = Vec::with_capacity(argv.len() + envp.len());
    for s in argv.iter().chain(envp) {
        cursor -= s.len() as u64 + 1;
        placed.push((cursor, *s));
    }

    let words = 1 + argv.len() + 1 + envp.len() + 1 + 2 * aux.len();
    let sp = (cursor - 8 * words as u64) & !0xF;
    let len = usize::try_from(top - sp).map_err(|_| TaskError::ArgumentsTooLarge)?;
    if len > ARG_MAX {
        return Err(TaskError::ArgumentsTooLarge);
    }

    let mut bytes = alloc::vec![0u8; len];
    let at = |va: u64| (va - sp) as usize;

    bytes[at(random_at)..].copy_from_slice(&info.random);
    for (va, s) in &placed {
        let i = at(*va);
        bytes[i..i + s.len()].copy_from_slice(s.as_bytes());
    }

    let mut vector = Vec::with_capacity(words);
    vector.push(argv.len() as u64);
    vector.extend(placed[..argv.len()].iter().map(|(va, _)| *va));
    vector.push(0);
    vector.extend(placed[argv.len()..].iter().map(|(va, _)| *va));
    vector.push(0);
    for (key, value) in &aux {
        vector.push(*key);
        vector.push(*value);
    }
    for (i, word) in vector.iter().enumerate() {
        bytes[i * 8..i * 8 + 8].copy_from_slice(&word.to_le_bytes());
    }

    Ok(InitialStack {
        bytes,
        sp: VirtualAddress::new(sp),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    const TOP: u64 = 0x7fff_ffff_f000;

    fn word(stack: &InitialStack, va: u64) -> u64 {
        let i = (va - stack.sp.as_u64()) as usize;
        u64::from_le_bytes(stack.bytes[i..i + 8].try_into().unwrap())
    }

    fn c_str(stack: &InitialStack, va: u64) -> &str {
        let i = (va - stack.sp.as_u64()) as usize;
        let n = stack.bytes[i..].iter().position(|&b| b == 0).unwrap();
        core::str::from_utf8(&stack.bytes[i..i + n]).unwrap()
    }

    #[test]
    fn vectors_point_at_their_strings() {
        let info = EntryInfo {
            entry: VirtualAddress::new(0x40_1000),
            program_headers: Some(ProgramHeaders {
                addr: VirtualAddress::new(0x40_0040),
                entry_size: 56,
                count: 3,
            }),
            random: [0xAB; 16],
        };
        let stack =
            initial_stack(VirtualAddress::new(TOP), &["init", "-v"], &["TERM=vt100"], &info)
                .unwrap();
        let sp = stack.sp.as_u64();
        assert_eq!(sp % 16, 0);
        assert_eq!(sp + stack.bytes.len() as u64, TOP);

        assert_eq!(word(&stack, sp), 2);
        assert_eq!(c_str(&stack, word(&stack, sp + 8)), "init");
        assert_eq!(c_str(&stack, word(&stack, sp + 16)), "-v");
        assert_eq!(word(&stack, sp + 24), 0);
        assert_eq!(c_str(&stack, word(&stack, sp + 32)), "TERM=vt100");
        assert_eq!(word(&stack, sp + 40), 0);

        let mut aux = Vec::new();
        let mut at = sp + 48;
        loop {
            let (k, v) = (word(&stack, at), word(&stack, at + 8));
            aux.push((k, v));
            at += 16;
            if k == auxv::AT_NULL {
                break;
            }
        }
        assert_eq!(
            aux,
            [
                (auxv::AT_PHDR, 0x40_0040),
                (auxv::AT_PHENT, 56),
                (auxv::AT_PHNUM, 3),
                (auxv::AT_PAGESZ, 4096),
                (auxv::AT_ENTRY, 0x40_1000),
                (auxv::AT_RANDOM, TOP - 16),
                (auxv::AT_NULL, 0),
            ]
        );
        assert_eq!(&stack.bytes[stack.bytes.len() - 16..], &[0xAB; 16]);
    }

    #[test]
    fn oversized_arguments_are_refused() {
        let info = EntryInfo {
            entry: VirtualAddress::new(0x40_1000),
            program_headers: None,
            random: [0; 16],
        };
        let big = "x".repeat(ARG_MAX);
        assert_eq!(
            initial_stack(VirtualAddress::new(TOP), &[&big], &[], &info),
            Err(TaskError::ArgumentsTooLarge)
        );
    }
}
