//! Profiler side-channel sinks.
//!
//! A sink is told about every stub exactly once, right after the stub's slot
//! is acquired and before the owning code object learns its address. Sink
//! failures must never disturb interpretation, so writes swallow errors into
//! log messages; a sink whose backing file could not be opened retries once
//! on the first write and degrades into doing nothing after that.

use opal_jitdump::JitdumpFile;

use crate::perfmap::PerfMapFile;

/// Which profiler side-channel receives stub notifications.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SinkKind {
    /// Text symbol map at `/tmp/perf-<pid>.map`.
    Perfmap,
    /// Binary jitdump stream at `/tmp/jit-<pid>.dump`, with unwind info.
    Jitdump,
}

pub(crate) enum Sink {
    Perfmap {
        file: Option<PerfMapFile>,
        retried: bool,
    },
    Jitdump {
        file: Option<JitdumpFile>,
        retried: bool,
    },
}

impl Sink {
    /// Initialize the side-channel file for `kind`. Failure to open it is
    /// recorded, not propagated.
    pub fn init(kind: SinkKind) -> Sink {
        match kind {
            SinkKind::Perfmap => Sink::Perfmap {
                file: log_init_failure(PerfMapFile::open()),
                retried: false,
            },
            SinkKind::Jitdump => Sink::Jitdump {
                file: log_init_failure(JitdumpFile::new()),
                retried: false,
            },
        }
    }

    /// Slot padding the sink needs reserved after each stub's code.
    pub fn padding(kind: SinkKind) -> usize {
        match kind {
            SinkKind::Perfmap => 0,
            SinkKind::Jitdump => opal_jitdump::CODE_PADDING,
        }
    }

    /// Record one freshly compiled stub. Must be called at most once per
    /// stub address.
    pub fn write(&mut self, name: &str, code: &[u8]) {
        match self {
            Sink::Perfmap { file, retried } => {
                if file.is_none() && !*retried {
                    *retried = true;
                    *file = log_init_failure(PerfMapFile::open());
                }
                if let Some(map) = file {
                    if let Err(err) = map.write_entry(code.as_ptr() as usize, code.len(), name) {
                        log::warn!("failed to append a perf map entry: {err}");
                    }
                }
            }
            Sink::Jitdump { file, retried } => {
                if file.is_none() && !*retried {
                    *retried = true;
                    *file = log_init_failure(JitdumpFile::new());
                }
                if let Some(jitdump) = file {
                    if let Err(err) = jitdump.write_entry(name, code) {
                        log::warn!("failed to write a jitdump record pair: {err:#}");
                    }
                }
            }
        }
    }
}

fn log_init_failure<T, E: std::fmt::Display>(result: Result<T, E>) -> Option<T> {
    match result {
        Ok(value) => Some(value),
        Err(err) => {
            log::warn!("profiler sink initialization failed: {err:#}");
            None
        }
    }
}

/// Symbol name for a stub: `py::<qualname>:<filename>`, with missing parts
/// left empty.
pub(crate) fn symbol_name(qualname: Option<&str>, filename: Option<&str>) -> String {
    format!("py::{}:{}", qualname.unwrap_or(""), filename.unwrap_or(""))
}
