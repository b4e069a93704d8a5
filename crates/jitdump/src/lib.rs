//! Jitdump emission for perf profiling of trampoline stubs.
//!
//! The jitdump format is the binary side-channel `perf inject -j` consumes
//! to attribute samples landing in runtime-generated code. Format definition:
//! <https://git.kernel.org/pub/scm/linux/kernel/git/torvalds/linux.git/tree/tools/perf/Documentation/jitdump-specification.txt>
//!
//! Usage example:
//!     Record
//!         perf record -k 1 -e cycles:u -- opal script.py
//!     Combine
//!         perf inject -j -i perf.data -o perf.jit.data
//!     Report
//!         perf report -i perf.jit.data
//!
//! Every stub produces a record pair: a `UnwindingInfo` record carrying a
//! synthetic CIE/FDE plus `.eh_frame_hdr` (see [`dwarf`]), followed by a
//! `CodeLoad` record carrying the symbol name and the stub's machine code.
//! `perf inject` turns each pair into a standalone DSO; the caller must
//! reserve [`CODE_PADDING`] bytes of address space after each stub so those
//! DSOs never overlap.

pub mod arch;
pub mod dwarf;

use std::ffi::c_void;
use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::Path;
use std::process;
use std::ptr;
use std::sync::Mutex;
use std::time::{SystemTime, UNIX_EPOCH};

use anyhow::{Context, Result};
use rustix::mm::{MapFlags, ProtFlags, mmap, munmap};

use crate::dwarf::{EH_FRAME_HDR_SIZE, EhFrame, round_up};

/// Address-space padding each stub slot must reserve after its code so the
/// DSOs synthesized by `perf inject` have room for their unwind data without
/// overlapping the next stub.
pub const CODE_PADDING: usize = 0x100;

const JITDUMP_MAGIC: u32 = 0x4A69_5444;
const JITDUMP_VERSION: u32 = 1;

/// Record types understood by `perf inject -j`.
#[repr(u32)]
enum RecordKind {
    CodeLoad = 0,
    UnwindingInfo = 4,
}

/// Fixed-size header at the start of the file.
#[derive(Debug, Default, Clone, Copy)]
#[repr(C)]
struct FileHeader {
    magic: u32,
    version: u32,
    /// Size in bytes of this header.
    size: u32,
    /// ELF architecture encoding (`e_machine`).
    e_machine: u32,
    reserved: u32,
    pid: u32,
    /// Microseconds since the epoch; everything else in the file uses the
    /// monotonic clock.
    timestamp: u64,
    flags: u64,
}

unsafe impl object::Pod for FileHeader {}

/// Fixed-size prefix of every record.
#[derive(Debug, Default, Clone, Copy)]
#[repr(C)]
struct RecordHeader {
    kind: u32,
    /// Size in bytes of the record, header and padding included.
    size: u32,
    timestamp: u64,
}

unsafe impl object::Pod for RecordHeader {}

/// Describes one loaded span of generated code. Followed in the file by the
/// NUL-terminated symbol name and the code bytes themselves.
#[derive(Debug, Default, Clone, Copy)]
#[repr(C)]
struct CodeLoadRecord {
    header: RecordHeader,
    pid: u32,
    tid: u32,
    vma: u64,
    code_addr: u64,
    code_size: u64,
    code_id: u64,
}

unsafe impl object::Pod for CodeLoadRecord {}

/// Describes the unwind data for the next `CodeLoad` record. Followed in the
/// file by the CIE/FDE bytes and the `.eh_frame_hdr`.
#[derive(Debug, Default, Clone, Copy)]
#[repr(C)]
struct UnwindingInfoRecord {
    header: RecordHeader,
    unwind_data_size: u64,
    eh_frame_hdr_size: u64,
    mapped_size: u64,
}

unsafe impl object::Pod for UnwindingInfoRecord {}

/// Writer for one perf jitdump stream.
///
/// Writes are serialized by an internal mutex so a record pair is never
/// interleaved with another stub's records, and `code_id` values appear in
/// file order.
pub struct JitdumpFile {
    state: Mutex<State>,
}

struct State {
    file: BufWriter<File>,
    _marker: HandshakeMapping,
    code_id: u64,
}

/// Executable mapping of the file's first page.
///
/// Profilers treat the presence of a `PROT_EXEC` mapping of a `jit-<pid>.dump`
/// file as the signal that the file is a live jitdump, so the mapping must
/// outlive every record written.
struct HandshakeMapping {
    ptr: *mut c_void,
    len: usize,
}

unsafe impl Send for HandshakeMapping {}

impl Drop for HandshakeMapping {
    fn drop(&mut self) {
        unsafe {
            munmap(self.ptr, self.len).expect("failed to unmap jitdump handshake page");
        }
    }
}

impl JitdumpFile {
    /// Create `/tmp/jit-<pid>.dump`, perform the handshake mapping, and
    /// write the file header.
    pub fn new() -> Result<JitdumpFile> {
        JitdumpFile::with_path(format!("/tmp/jit-{}.dump", process::id()))
    }

    /// Like [`JitdumpFile::new`] but at an explicit path.
    pub fn with_path(path: impl AsRef<Path>) -> Result<JitdumpFile> {
        let path = path.as_ref();
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)
            .with_context(|| format!("failed to create jitdump file at {}", path.display()))?;

        let page_size = rustix::param::page_size();
        let ptr = unsafe {
            mmap(
                ptr::null_mut(),
                page_size,
                ProtFlags::READ | ProtFlags::EXEC,
                MapFlags::PRIVATE,
                &file,
                0,
            )
            .context("failed to map the jitdump handshake page")?
        };
        let marker = HandshakeMapping {
            ptr,
            len: page_size,
        };

        let mut state = State {
            file: BufWriter::with_capacity(2 * 1024 * 1024, file),
            _marker: marker,
            code_id: 0,
        };
        state.write_file_header()?;
        state.file.flush()?;
        Ok(JitdumpFile {
            state: Mutex::new(state),
        })
    }

    /// Emit the record pair for one stub: unwind info first, then the code
    /// load carrying `name` and the bytes of `code`.
    ///
    /// The stub's load address is taken from `code.as_ptr()`.
    pub fn write_entry(&self, name: &str, code: &[u8]) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        state.write_unwinding_info(code.len())?;
        state.write_code_load(name, code)?;
        state.file.flush()?;
        Ok(())
    }
}

impl State {
    fn write_file_header(&mut self) -> Result<()> {
        let header = FileHeader {
            magic: JITDUMP_MAGIC,
            version: JITDUMP_VERSION,
            size: size_of::<FileHeader>() as u32,
            e_machine: arch::ELF_MACHINE,
            reserved: 0,
            pid: process::id(),
            timestamp: wall_clock_micros(),
            flags: 0,
        };
        self.file.write_all(object::bytes_of(&header))?;
        Ok(())
    }

    fn write_unwinding_info(&mut self, code_size: usize) -> Result<()> {
        let eh_frame = EhFrame::new(code_size as u32);
        let unwind_data_size = (EH_FRAME_HDR_SIZE + eh_frame.len()) as u64;
        // The synthesized DSO must fit its unwind data inside the slot
        // padding reserved after the stub's code.
        assert!(unwind_data_size <= CODE_PADDING as u64);

        let content_size =
            size_of::<UnwindingInfoRecord>() + eh_frame.len() + EH_FRAME_HDR_SIZE;
        let record_size = round_up(content_size as u64, 8) as usize;
        let record = UnwindingInfoRecord {
            header: RecordHeader {
                kind: RecordKind::UnwindingInfo as u32,
                size: record_size as u32,
                timestamp: monotonic_nanos(),
            },
            unwind_data_size,
            eh_frame_hdr_size: EH_FRAME_HDR_SIZE as u64,
            mapped_size: round_up(unwind_data_size, 16),
        };

        self.file.write_all(object::bytes_of(&record))?;
        self.file.write_all(eh_frame.bytes())?;
        self.file.write_all(&eh_frame.header(code_size as u32))?;
        self.file.write_all(&ZEROS[..record_size - content_size])?;
        Ok(())
    }

    fn write_code_load(&mut self, name: &str, code: &[u8]) -> Result<()> {
        let content_size = size_of::<CodeLoadRecord>() + name.len() + 1 + code.len();
        let record_size = round_up(content_size as u64, 8) as usize;
        self.code_id += 1;
        let record = CodeLoadRecord {
            header: RecordHeader {
                kind: RecordKind::CodeLoad as u32,
                size: record_size as u32,
                timestamp: monotonic_nanos(),
            },
            pid: process::id(),
            tid: gettid(),
            vma: code.as_ptr() as u64,
            code_addr: code.as_ptr() as u64,
            code_size: code.len() as u64,
            code_id: self.code_id,
        };

        self.file.write_all(object::bytes_of(&record))?;
        self.file.write_all(name.as_bytes())?;
        self.file.write_all(b"\0")?;
        self.file.write_all(code)?;
        self.file.write_all(&ZEROS[..record_size - content_size])?;
        Ok(())
    }
}

const ZEROS: [u8; 8] = [0; 8];

/// Nanoseconds on the monotonic clock, the timebase perf uses for records.
fn monotonic_nanos() -> u64 {
    let ts = rustix::time::clock_gettime(rustix::time::ClockId::Monotonic);
    ts.tv_sec as u64 * 1_000_000_000 + ts.tv_nsec as u64
}

fn wall_clock_micros() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_micros() as u64)
        .unwrap_or(0)
}

fn gettid() -> u32 {
    rustix::thread::gettid().as_raw_nonzero().get() as u32
}
