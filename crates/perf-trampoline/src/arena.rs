//! Executable-memory arenas for trampoline stubs.
//!
//! Requesting a fresh mapping per stub would be wasteful, so stubs are
//! handed out from large arenas mapped in one go. An arena is populated with
//! template copies in every slot while still writable, flipped to
//! read+execute exactly once, and never written again; on AArch64 that means
//! a single instruction-cache invalidation per arena rather than one per
//! stub. Exhausted arenas stay mapped (stub addresses must outlive the
//! arena's write cursor) and new ones are pushed onto a newest-first list.

use std::ptr;

use anyhow::{Context, Result};
use rustix::mm::{MapFlags, MprotectFlags, ProtFlags, mmap_anonymous, mprotect, munmap};

/// Size of every arena mapping. Non-trivial programs typically need 64 to
/// 256 KiB of stubs.
const ARENA_SIZE: usize = 4096 * 16;

struct Arena {
    base: *mut u8,
    cursor: *mut u8,
    size: usize,
    size_left: usize,
    prev: Option<Box<Arena>>,
}

// Arena pointers are only dereferenced by copied-in machine code; the
// bookkeeping itself is plain data.
unsafe impl Send for Arena {}

/// The arena list plus the slot geometry shared by newly mapped arenas.
pub(crate) struct CodeArenas {
    head: Option<Box<Arena>>,
    template: &'static [u8],
    slot_size: usize,
}

impl CodeArenas {
    pub fn new(template: &'static [u8], padding: usize) -> CodeArenas {
        assert_eq!(ARENA_SIZE % rustix::param::page_size(), 0);
        CodeArenas {
            head: None,
            template,
            slot_size: round_up(template.len() + padding, 16),
        }
    }

    /// Size of the machine code at the start of every slot.
    pub fn code_size(&self) -> usize {
        self.template.len()
    }

    /// Number of arenas currently mapped.
    pub fn arena_count(&self) -> usize {
        let mut count = 0;
        let mut next = self.head.as_deref();
        while let Some(arena) = next {
            count += 1;
            next = arena.prev.as_deref();
        }
        count
    }

    /// Whether `addr` points into one of the arenas.
    pub fn contains(&self, addr: *const u8) -> bool {
        let addr = addr.addr();
        let mut next = self.head.as_deref();
        while let Some(arena) = next {
            let base = arena.base.addr();
            if addr >= base && addr < base + arena.size {
                return true;
            }
            next = arena.prev.as_deref();
        }
        false
    }

    /// Change the per-slot padding. Only affects arenas mapped from now on;
    /// the current arena's remaining slots were laid out with the old
    /// geometry, so it is retired.
    pub fn set_slot_padding(&mut self, padding: usize) {
        let slot_size = round_up(self.template.len() + padding, 16);
        if slot_size != self.slot_size {
            self.slot_size = slot_size;
            if let Some(head) = self.head.as_mut() {
                head.size_left = 0;
            }
        }
    }

    /// Map the first arena if none exists yet, surfacing mapping failures at
    /// activation time rather than on the first dispatch.
    pub fn ensure_mapped(&mut self) -> Result<()> {
        if self.head.is_none() {
            self.map_arena()?;
        }
        Ok(())
    }

    /// Hand out the next executable slot, mapping a new arena if the current
    /// one cannot fit another slot.
    ///
    /// The returned address starts with a copy of the template and stays
    /// valid until [`CodeArenas::free_all`].
    pub fn acquire_slot(&mut self) -> Result<*const u8> {
        if self
            .head
            .as_ref()
            .is_none_or(|arena| arena.size_left < self.slot_size)
        {
            self.map_arena()?;
        }
        let arena = self.head.as_mut().unwrap();
        let slot = arena.cursor;
        arena.cursor = unsafe { arena.cursor.add(self.slot_size) };
        arena.size_left -= self.slot_size;
        Ok(slot)
    }

    fn map_arena(&mut self) -> Result<()> {
        let memory = unsafe {
            mmap_anonymous(
                ptr::null_mut(),
                ARENA_SIZE,
                ProtFlags::READ | ProtFlags::WRITE,
                MapFlags::PRIVATE,
            )
            .context("failed to map a trampoline arena")?
        };
        let base = memory.cast::<u8>();

        // Populate every slot while the pages are still writable so nothing
        // touches the arena after it turns executable.
        let slots = ARENA_SIZE / self.slot_size;
        for i in 0..slots {
            unsafe {
                ptr::copy_nonoverlapping(
                    self.template.as_ptr(),
                    base.add(i * self.slot_size),
                    self.template.len(),
                );
            }
        }

        if let Err(err) =
            unsafe { mprotect(memory, ARENA_SIZE, MprotectFlags::READ | MprotectFlags::EXEC) }
        {
            unsafe {
                let _ = munmap(memory, ARENA_SIZE);
            }
            return Err(err).context("failed to make a trampoline arena executable");
        }

        invalidate_icache(base, ARENA_SIZE);

        self.head = Some(Box::new(Arena {
            base,
            cursor: base,
            size: ARENA_SIZE,
            size_left: ARENA_SIZE,
            prev: self.head.take(),
        }));
        Ok(())
    }

    /// Unmap every arena.
    ///
    /// Callers must guarantee that no stub handed out from any arena can run
    /// again and that stored slot addresses are no longer read.
    pub fn free_all(&mut self) {
        let mut next = self.head.take();
        while let Some(mut arena) = next {
            unsafe {
                let _ = munmap(arena.base.cast(), arena.size);
            }
            next = arena.prev.take();
        }
    }
}

impl Drop for CodeArenas {
    fn drop(&mut self) {
        self.free_all();
    }
}

cfg_if::cfg_if! {
    if #[cfg(target_arch = "aarch64")] {
        unsafe extern "C" {
            fn __clear_cache(start: *mut core::ffi::c_char, end: *mut core::ffi::c_char);
        }

        // Freshly copied code must be evicted from the instruction cache
        // before its first execution on this architecture.
        fn invalidate_icache(base: *mut u8, len: usize) {
            unsafe { __clear_cache(base.cast(), base.add(len).cast()) }
        }
    } else {
        fn invalidate_icache(_base: *mut u8, _len: usize) {}
    }
}

fn round_up(value: usize, multiple: usize) -> usize {
    if multiple == 0 {
        return value;
    }
    let remainder = value % multiple;
    if remainder == 0 {
        value
    } else {
        value + (multiple - remainder)
    }
}
