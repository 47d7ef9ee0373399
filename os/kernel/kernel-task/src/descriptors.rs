//! # Descriptor tables
//!
//! The core does not know what a descriptor refers to. It only keeps opaque
//! [`Handle`]s in numbered slots so that `fork` can clone the table, threads
//! can share it and `exec` can drop close-on-exec entries.

use alloc::sync::Arc;
use alloc::vec::Vec;
use kernel_sync::SpinMutex;

/// Highest number of open descriptors per table.
pub const MAX_DESCRIPTORS: usize = 256;

/// A table shared by the threads of one process.
pub type SharedDescriptors = Arc<SpinMutex<DescriptorTable>>;

bitflags::bitflags! {
    #[derive(Copy, Clone, Debug, Default, Eq, PartialEq, Hash)]
    pub struct DescriptorFlags: u32 {
        /// Closed by `exec`.
        const CLOEXEC = 1 << 0;
    }
}

/// Whatever the owning subsystem stores for an open descriptor.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub struct Handle(pub u64);

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct Descriptor {
    pub handle: Handle,
    pub flags: DescriptorFlags,
}

#[derive(Debug, thiserror::Error, Copy, Clone, Eq, PartialEq)]
pub enum DescriptorError {
    #[error("descriptor table is full")]
    TableFull,
    #[error("bad descriptor {0}")]
    BadDescriptor(usize),
}

#[derive(Clone, Debug, Default)]
pub struct DescriptorTable {
    slots: Vec<Option<Descriptor>>,
}

impl DescriptorTable {
    #[must_use]
    pub const fn new() -> Self {
        Self { slots: Vec::new() }
    }

    /// Store `handle` in the lowest free slot and return its number.
    ///
    /// # Errors
    /// [`DescriptorError::TableFull`].
    pub fn install(
        &mut self,
        handle: Handle,
        flags: DescriptorFlags,
    ) -> Result<usize, DescriptorError> {
        let fd = match self.slots.iter().position(Option::is_none) {
            Some(fd) => fd,
            None if self.slots.len() < MAX_DESCRIPTORS => {
                self.slots.push(None);
                self.slots.len() - 1
            }
            None => return Err(DescriptorError::TableFull),
        };
        self.slots[fd] = Some(Descriptor { handle, flags });
        Ok(fd)
    }

    /// Store `handle` at `fd`, returning what was there.
    ///
    /// # Errors
    /// [`DescriptorError::BadDescriptor`] past the table limit.
    pub fn install_at(
        &mut self,
        fd: usize,
        handle: Handle,
        flags: DescriptorFlags,
    ) -> Result<Option<Descriptor>, DescriptorError> {
        if fd >= MAX_DESCRIPTORS {
            return Err(DescriptorError::BadDescriptor(fd));
        }
        if fd >= self.slots.len() {
            self.slots.resize(fd + 1, None);
        }
        Ok(self.slots[fd].replace(Descriptor { handle, flags }))
    }

    #[must_use]
    pub fn get(&self, fd: usize) -> Option<Descriptor> {
        self.slots.get(fd).copied().flatten()
    }

    /// # Errors
    /// [`DescriptorError::BadDescriptor`] if `fd` is not open.
    pub fn close(&mut self, fd: usize) -> Result<Descriptor, DescriptorError> {
        let closed = self
            .slots
            .get_mut(fd)
            .and_then(Option::take)
            .ok_or(DescriptorError::BadDescriptor(fd))?;
        while self.slots.last().is_some_and(Option::is_none) {
            self.slots.pop();
        }
        Ok(closed)
    }

    /// # Errors
    /// [`DescriptorError::BadDescriptor`] if `fd` is not open.
    pub fn set_flags(&mut self, fd: usize, flags: DescriptorFlags) -> Result<(), DescriptorError> {
        let d = self
            .slots
            .get_mut(fd)
            .and_then(Option::as_mut)
            .ok_or(DescriptorError::BadDescriptor(fd))?;
        d.flags = flags;
        Ok(())
    }

    /// Close every close-on-exec entry and return what was closed.
    pub fn close_on_exec(&mut self) -> Vec<(usize, Descriptor)> {
        let doomed: Vec<usize> = self
            .iter()
            .filter(|(_, d)| d.flags.contains(DescriptorFlags::CLOEXEC))
            .map(|(fd, _)| fd)
            .collect();
        doomed
            .into_iter()
            .filter_map(|fd| self.close(fd).ok().map(|d| (fd, d)))
            .collect()
    }

    /// Number of open descriptors.
    #[must_use]
    pub fn len(&self) -> usize {
        self.slots.iter().flatten().count()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn iter(&self) -> impl Iterator<Item = (usize, Descriptor)> + '_ {
        self.slots
            .iter()
            .enumerate()
            .filter_map(|(fd, d)| d.map(|d| (fd, d)))
    }
}
