//! Trampolines that make interpreted frames visible to native profilers.
//!
//! Sampling profilers like Linux `perf` can only unwind native frames. Every
//! interpreted function, however, executes inside the same native evaluator
//! routine, so each sample attributes all interpreted work to that one
//! symbol and the per-function identity of the stack is lost.
//!
//! This crate restores that identity by giving each code object a private
//! copy of a tiny native stub that does nothing but call the real evaluator
//! with its arguments forwarded. Interpreted calls are routed through the
//! stub belonging to their code object, so the profiler observes a distinct
//! return address per interpreted function. The mapping from stub address
//! back to `qualname:filename` is published through a side-channel the
//! profiler already understands: either the classic `/tmp/perf-<pid>.map`
//! text file, or a binary jitdump stream carrying synthetic unwind info for
//! `perf inject -j` (see [`SinkKind`]).
//!
//! Stub copies are handed out from 64 KiB read+execute arenas that are
//! populated with the template up front, so steady-state compilation of a
//! trampoline is a pointer bump plus one side-channel write. Profiler
//! machinery must never break interpretation: any failure on the dispatch
//! path falls back to calling the default evaluator directly.
//!
//! For useful profiles the embedding interpreter should be built with frame
//! pointers (`-fno-omit-frame-pointer` equivalents) so unwinding can walk
//! the frame chain through the stubs.
//!
//! The subsystem assumes its embedder serializes calls the way a global
//! interpreter lock does: all methods take `&mut self` and the only
//! internal locking is in the sinks, whose files outlive individual calls.

mod arena;
mod host;
mod perfmap;
mod sink;
mod template;

pub use crate::host::{EvalFn, Host, TrampolineFn};
pub use crate::perfmap::PerfMapFile;
pub use crate::sink::SinkKind;

use std::ffi::c_void;
use std::mem;

use anyhow::{Context, Result, bail};

use crate::arena::CodeArenas;
use crate::sink::{Sink, symbol_name};

/// Lifecycle state of the subsystem.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Status {
    /// Not activated; dispatch falls through to the default evaluator.
    NoInit,
    /// Activated; dispatch compiles and uses trampolines.
    Ok,
    /// An arena mapping failed. Sticky: dispatch permanently falls back.
    Failed,
}

/// The perf trampoline subsystem for one interpreter.
///
/// Owns the executable arenas, the active profiler sink, and the lifecycle
/// state; talks to the interpreter exclusively through `H`.
pub struct PerfTrampoline<H: Host> {
    host: H,
    status: Status,
    extra_index: Option<u32>,
    arenas: CodeArenas,
    sink: Option<Sink>,
    sink_kind: SinkKind,
    persist_after_fork: bool,
}

impl<H: Host> PerfTrampoline<H> {
    /// Create an inactive subsystem around `host`, defaulting to the perf
    /// map sink.
    pub fn new(host: H) -> PerfTrampoline<H> {
        PerfTrampoline {
            host,
            status: Status::NoInit,
            extra_index: None,
            arenas: CodeArenas::new(template::template(), Sink::padding(SinkKind::Perfmap)),
            sink: None,
            sink_kind: SinkKind::Perfmap,
            persist_after_fork: false,
        }
    }

    /// The embedded host handle.
    pub fn host(&self) -> &H {
        &self.host
    }

    /// Whether the trampoline evaluator is installed and operational.
    pub fn is_active(&self) -> bool {
        self.status == Status::Ok && self.host.eval_hook_installed()
    }

    /// Select which profiler side-channel receives stub notifications.
    ///
    /// A live sink is finalized first, which also deactivates the
    /// subsystem; call [`PerfTrampoline::init`] again to resume with the new
    /// sink.
    pub fn set_sink(&mut self, kind: SinkKind) {
        if self.sink.is_some() {
            self.fini();
        }
        self.sink_kind = kind;
    }

    /// The currently selected sink.
    pub fn sink_kind(&self) -> SinkKind {
        self.sink_kind
    }

    /// Whether a forked child keeps the parent's perf map instead of
    /// starting over.
    pub fn set_persist_after_fork(&mut self, enable: bool) {
        self.persist_after_fork = enable;
    }

    /// Activate or deactivate the subsystem.
    ///
    /// Activation installs the evaluator hook, maps the first arena,
    /// reserves the code extra-slot index, and initializes the selected
    /// sink. Fails if a foreign evaluator hook is installed; arena mapping
    /// failure leaves the subsystem in its sticky failed state.
    ///
    /// Deactivation (`activate == false`) merely uninstalls the hook.
    pub fn init(&mut self, activate: bool) -> Result<()> {
        if !activate {
            self.host.uninstall_eval_hook();
            self.status = Status::NoInit;
            return Ok(());
        }

        self.host
            .install_eval_hook()
            .context("cannot activate the perf trampoline")?;
        self.arenas.set_slot_padding(Sink::padding(self.sink_kind));
        if let Err(err) = self.arenas.ensure_mapped() {
            self.status = Status::Failed;
            return Err(err);
        }
        self.extra_index = Some(
            self.host
                .request_code_extra_index()
                .context("no code extra-slot index available")?,
        );
        if self.sink.is_none() {
            self.sink = Some(Sink::init(self.sink_kind));
        }
        self.status = Status::Ok;
        Ok(())
    }

    /// Deactivate the subsystem: uninstall the hook and finalize the sink.
    ///
    /// Arenas stay mapped so trampoline addresses already stored on code
    /// objects remain valid; reclaim them with
    /// [`PerfTrampoline::free_arenas`] once no such address can be used
    /// again.
    pub fn fini(&mut self) {
        if self.status != Status::Ok {
            return;
        }
        if self.host.eval_hook_installed() {
            self.host.uninstall_eval_hook();
        }
        self.sink = None;
        self.extra_index = None;
        self.status = Status::NoInit;
    }

    /// Unmap every arena.
    ///
    /// Callers must guarantee that no stub can run again and that no code
    /// object's stored trampoline address will be dereferenced.
    pub fn free_arenas(&mut self) {
        self.arenas.free_all();
    }

    /// Number of arenas currently mapped.
    pub fn arena_count(&self) -> usize {
        self.arenas.arena_count()
    }

    /// Whether `addr` points into one of the subsystem's arenas.
    pub fn owns_stub(&self, addr: *const c_void) -> bool {
        self.arenas.contains(addr.cast())
    }

    /// Evaluate `frame`, routing the call through the frame's per-code-object
    /// trampoline and compiling one on first sight.
    ///
    /// Any failure to produce a trampoline falls back to the default
    /// evaluator, so the result is always exactly what the default evaluator
    /// returns.
    ///
    /// # Safety
    ///
    /// `thread_state` and `frame` must be handles accepted by the host's
    /// default evaluator, and `frame` must be live for
    /// [`Host::frame_code`].
    pub unsafe fn evaluate(
        &mut self,
        thread_state: *mut c_void,
        frame: *mut c_void,
        throw_flag: i32,
    ) -> *mut c_void {
        let default_eval = self.host.default_eval();
        if self.status != Status::Ok {
            return unsafe { default_eval(thread_state, frame, throw_flag) };
        }
        let code = unsafe { self.host.frame_code(frame) };
        match unsafe { self.stub_for(code) } {
            Some(stub) => unsafe { stub(thread_state, frame, throw_flag, default_eval) },
            None => unsafe { default_eval(thread_state, frame, throw_flag) },
        }
    }

    /// Eagerly materialize a trampoline for `code` without evaluating it,
    /// notifying the sink as usual. Used to warm up code objects ahead of
    /// profiling.
    ///
    /// Returns whether `code` has a trampoline afterwards.
    ///
    /// # Safety
    ///
    /// `code` must be a live code-object handle.
    pub unsafe fn compile_code(&mut self, code: *mut c_void) -> bool {
        if self.status != Status::Ok {
            return false;
        }
        unsafe { self.stub_for(code) }.is_some()
    }

    /// Look up the memoized trampoline for `code`, compiling one on first
    /// sight.
    unsafe fn stub_for(&mut self, code: *mut c_void) -> Option<TrampolineFn> {
        let index = self.extra_index?;
        let existing = unsafe { self.host.code_extra(code, index) };
        if !existing.is_null() {
            return Some(unsafe { mem::transmute::<*mut c_void, TrampolineFn>(existing) });
        }

        let slot = match self.arenas.acquire_slot() {
            Ok(slot) => slot,
            Err(err) => {
                log::warn!("disabling the perf trampoline: {err:#}");
                self.status = Status::Failed;
                return None;
            }
        };
        unsafe {
            self.notify_sink(slot, code);
            self.host.code_set_extra(code, index, slot.cast_mut().cast());
        }
        Some(unsafe { mem::transmute::<*const u8, TrampolineFn>(slot) })
    }

    unsafe fn notify_sink(&mut self, slot: *const u8, code: *mut c_void) {
        if self.sink.is_none() {
            return;
        }
        let name = unsafe {
            symbol_name(
                self.host.code_qualname(code).as_deref(),
                self.host.code_filename(code).as_deref(),
            )
        };
        // The slot's leading bytes are the template copied in at arena
        // construction; that is exactly the code the profiler will sample.
        let code_bytes = unsafe { std::slice::from_raw_parts(slot, self.arenas.code_size()) };
        if let Some(sink) = self.sink.as_mut() {
            sink.write(&name, code_bytes);
        }
    }

    /// Reconcile inherited profiler state in a freshly forked child.
    ///
    /// With [`PerfTrampoline::set_persist_after_fork`] enabled and the perf
    /// map sink active, the child adopts the parent's map file and stays
    /// deactivated. Otherwise the subsystem restarts from scratch: fresh
    /// side-channel files and, if it was active in the parent, a fresh
    /// activation.
    pub fn after_fork_child(&mut self) -> Result<()> {
        if self.persist_after_fork {
            if self.sink_kind != SinkKind::Perfmap {
                bail!("only the perf map sink can persist across fork");
            }
            self.fini();
            PerfMapFile::copy_from_parent().context("failed to adopt the parent's perf map")?;
        } else {
            let was_active = self.is_active();
            self.fini();
            if was_active {
                self.init(true)?;
            }
        }
        Ok(())
    }

    /// Force the sticky failure state, as an irrecoverable arena mapping
    /// failure would.
    #[doc(hidden)]
    pub fn mark_failed(&mut self) {
        self.status = Status::Failed;
    }
}
