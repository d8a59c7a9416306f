//! Installed code blocks.
//!
//! Finished code goes into a fresh page-aligned mapping as little-endian
//! words. The block starts writable so the runtime can patch the object
//! literal slots, then flips to read+execute. The protection change is
//! one-way; code that must change again is recompiled into a new block.

use std::ptr::NonNull;

use crate::asm::assembler::ObjReloc;
use crate::vm::refs::ObjRef;

#[derive(Debug)]
pub enum MemoryError {
    /// The operating system refused the mapping.
    MapFailed,
    /// The read+execute protection change failed.
    ProtectFailed,
    /// A word position outside the installed code, or a write after the
    /// block went executable.
    BadPatch,
    /// Zero-length code cannot be installed.
    Empty,
}

impl std::fmt::Display for MemoryError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MemoryError::MapFailed => write!(f, "code mapping failed"),
            MemoryError::ProtectFailed => write!(f, "protection change failed"),
            MemoryError::BadPatch => write!(f, "patch outside the writable code block"),
            MemoryError::Empty => write!(f, "empty code block"),
        }
    }
}

impl std::error::Error for MemoryError {}

/// A block of installed code, word-addressed.
pub struct ExecutableMemory {
    ptr: NonNull<u8>,
    map_len: usize,
    word_count: usize,
    executable: bool,
}

impl ExecutableMemory {
    /// Map a writable block and copy `code` into it.
    pub fn load(code: &[u32]) -> Result<Self, MemoryError> {
        if code.is_empty() {
            return Err(MemoryError::Empty);
        }
        let page = page_len();
        let map_len = (code.len() * 4).div_ceil(page) * page;
        let ptr = map_rw(map_len)?;
        let mut block = ExecutableMemory { ptr, map_len, word_count: code.len(), executable: false };
        for (pos, &word) in code.iter().enumerate() {
            block.patch_word(pos, word)?;
        }
        Ok(block)
    }

    /// Length of the installed code in words (the mapping itself is padded
    /// to a page boundary).
    pub fn word_count(&self) -> usize {
        self.word_count
    }

    pub fn as_ptr(&self) -> *const u8 {
        self.ptr.as_ptr()
    }

    pub fn is_executable(&self) -> bool {
        self.executable
    }

    /// Overwrite one code word, little-endian. Fails once the block is
    /// executable or past the installed code.
    pub fn patch_word(&mut self, word_pos: usize, word: u32) -> Result<(), MemoryError> {
        if self.executable || word_pos >= self.word_count {
            return Err(MemoryError::BadPatch);
        }
        let bytes = word.to_le_bytes();
        unsafe {
            std::ptr::copy_nonoverlapping(bytes.as_ptr(), self.ptr.as_ptr().add(word_pos * 4), 4);
        }
        Ok(())
    }

    /// Write every object-literal slot. `resolve` maps a handle to the
    /// object's current address.
    pub fn apply_relocs(
        &mut self,
        relocs: &[ObjReloc],
        mut resolve: impl FnMut(ObjRef) -> u32,
    ) -> Result<(), MemoryError> {
        for r in relocs {
            let addr = resolve(r.handle).wrapping_add_signed(r.offset);
            self.patch_word(r.word_pos, addr)?;
        }
        Ok(())
    }

    /// Flip the block to read+execute. One-way; later patches fail.
    pub fn make_executable(&mut self) -> Result<(), MemoryError> {
        if self.executable {
            return Ok(());
        }
        protect_rx(self.ptr, self.map_len)?;
        self.executable = true;
        Ok(())
    }

    /// Entry function pointer, once executable.
    ///
    /// # Safety
    /// `F` must be a function pointer type matching the installed code's
    /// calling convention, and the block must hold valid code.
    pub unsafe fn as_fn<F: Copy>(&self) -> Option<F> {
        if !self.executable || std::mem::size_of::<F>() != std::mem::size_of::<fn()>() {
            return None;
        }
        // SAFETY: the caller vouches for the code behind the pointer
        Some(unsafe { std::mem::transmute_copy(&self.ptr.as_ptr()) })
    }
}

impl Drop for ExecutableMemory {
    fn drop(&mut self) {
        #[cfg(unix)]
        {
            unsafe { libc::munmap(self.ptr.as_ptr().cast(), self.map_len) };
        }
        #[cfg(not(unix))]
        {
            let layout = std::alloc::Layout::from_size_align(self.map_len, page_len())
                .expect("layout was valid at allocation");
            unsafe { std::alloc::dealloc(self.ptr.as_ptr(), layout) };
        }
    }
}

// The mapping is privately owned and the pointer never escapes unshared.
unsafe impl Send for ExecutableMemory {}
unsafe impl Sync for ExecutableMemory {}

#[cfg(unix)]
fn page_len() -> usize {
    unsafe { libc::sysconf(libc::_SC_PAGESIZE) as usize }
}

#[cfg(not(unix))]
fn page_len() -> usize {
    4096
}

#[cfg(unix)]
fn map_rw(len: usize) -> Result<NonNull<u8>, MemoryError> {
    let ptr = unsafe {
        libc::mmap(
            std::ptr::null_mut(),
            len,
            libc::PROT_READ | libc::PROT_WRITE,
            libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
            -1,
            0,
        )
    };
    if ptr == libc::MAP_FAILED {
        return Err(MemoryError::MapFailed);
    }
    NonNull::new(ptr.cast()).ok_or(MemoryError::MapFailed)
}

#[cfg(not(unix))]
fn map_rw(len: usize) -> Result<NonNull<u8>, MemoryError> {
    // Plain allocation; the block still serves tools that never execute it.
    let layout = std::alloc::Layout::from_size_align(len, page_len())
        .map_err(|_| MemoryError::MapFailed)?;
    NonNull::new(unsafe { std::alloc::alloc_zeroed(layout) }).ok_or(MemoryError::MapFailed)
}

#[cfg(unix)]
fn protect_rx(ptr: NonNull<u8>, len: usize) -> Result<(), MemoryError> {
    let rc =
        unsafe { libc::mprotect(ptr.as_ptr().cast(), len, libc::PROT_READ | libc::PROT_EXEC) };
    if rc == 0 {
        Ok(())
    } else {
        Err(MemoryError::ProtectFailed)
    }
}

#[cfg(not(unix))]
fn protect_rx(_ptr: NonNull<u8>, _len: usize) -> Result<(), MemoryError> {
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn word_at(mem: &ExecutableMemory, pos: usize) -> u32 {
        let mut bytes = [0u8; 4];
        unsafe {
            std::ptr::copy_nonoverlapping(mem.as_ptr().add(pos * 4), bytes.as_mut_ptr(), 4)
        };
        u32::from_le_bytes(bytes)
    }

    #[test]
    fn test_load_round_trips_words() {
        let code = [0x1234_5678, 0x9abc_def0, 0x0000_0001];
        let mem = ExecutableMemory::load(&code).unwrap();
        assert_eq!(mem.word_count(), 3);
        assert!(!mem.is_executable());
        for (pos, &w) in code.iter().enumerate() {
            assert_eq!(word_at(&mem, pos), w);
        }
    }

    #[test]
    fn test_empty_code_rejected() {
        assert!(matches!(ExecutableMemory::load(&[]), Err(MemoryError::Empty)));
    }

    #[test]
    fn test_relocation_patches_literal_slots() {
        let mut mem = ExecutableMemory::load(&[0, 0, 0]).unwrap();
        let relocs = [
            ObjReloc { word_pos: 1, handle: ObjRef(7), offset: 8 },
            ObjReloc { word_pos: 2, handle: ObjRef(9), offset: -4 },
        ];
        mem.apply_relocs(&relocs, |h| 0x1000 + h.0 * 0x100).unwrap();
        assert_eq!(word_at(&mem, 0), 0);
        assert_eq!(word_at(&mem, 1), 0x1708);
        assert_eq!(word_at(&mem, 2), 0x18fc);
    }

    #[test]
    fn test_patch_is_bounds_checked() {
        let mut mem = ExecutableMemory::load(&[0]).unwrap();
        assert!(matches!(mem.patch_word(1, 1), Err(MemoryError::BadPatch)));
    }

    #[test]
    fn test_protection_is_one_way() {
        let mut mem = ExecutableMemory::load(&[0]).unwrap();
        mem.make_executable().unwrap();
        assert!(mem.is_executable());
        assert!(matches!(mem.patch_word(0, 1), Err(MemoryError::BadPatch)));
        // repeated calls stay idempotent
        mem.make_executable().unwrap();
    }
}
