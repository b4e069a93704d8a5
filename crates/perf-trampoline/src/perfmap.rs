//! The classic perf map: a text file mapping stub addresses to symbols.
//!
//! `perf report` resolves otherwise-unknown code addresses through
//! `/tmp/perf-<pid>.map` (name and location fixed by the tool), one entry
//! per line:
//!
//! ```text
//! <hex address> <hex size> <symbol>
//! ```

use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::PathBuf;
use std::process;
use std::sync::Mutex;

use anyhow::{Context, Result};

/// Append-only writer for this process's perf map.
pub struct PerfMapFile {
    file: Mutex<File>,
}

impl PerfMapFile {
    /// Open (or create) `/tmp/perf-<pid>.map` for appending.
    pub fn open() -> Result<PerfMapFile> {
        let path = PerfMapFile::path_for(process::id());
        let file = OpenOptions::new()
            .append(true)
            .create(true)
            .open(&path)
            .with_context(|| format!("failed to open perf map at {}", path.display()))?;
        Ok(PerfMapFile {
            file: Mutex::new(file),
        })
    }

    /// The fixed perf map location for a process.
    pub fn path_for(pid: u32) -> PathBuf {
        PathBuf::from(format!("/tmp/perf-{pid}.map"))
    }

    /// Append one symbol entry.
    pub fn write_entry(&self, addr: usize, size: usize, name: &str) -> std::io::Result<()> {
        let mut file = self.file.lock().unwrap();
        writeln!(file, "{addr:x} {size:x} {name}")
    }

    /// Replace this process's map with the parent's, so a forked child keeps
    /// the parent's stubs resolvable without regenerating them.
    pub fn copy_from_parent() -> Result<()> {
        let parent = rustix::process::getppid().context("no parent process to copy from")?;
        let source = PerfMapFile::path_for(parent.as_raw_nonzero().get() as u32);
        let dest = PerfMapFile::path_for(process::id());
        std::fs::copy(&source, &dest)
            .with_context(|| format!("failed to copy {} to {}", source.display(), dest.display()))?;
        Ok(())
    }
}
