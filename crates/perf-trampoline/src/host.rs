//! The interpreter-facing boundary of the trampoline subsystem.

use std::borrow::Cow;
use std::ffi::c_void;

use anyhow::Result;

/// Signature of the interpreter's frame evaluator.
///
/// `thread_state` and `frame` are opaque interpreter handles; `throw_flag`
/// selects exception-resume evaluation.
pub type EvalFn =
    unsafe extern "C" fn(thread_state: *mut c_void, frame: *mut c_void, throw_flag: i32) -> *mut c_void;

/// Signature of a compiled trampoline stub.
///
/// The evaluator is passed last so the template can forward its first three
/// arguments unchanged; the stub's only observable effect is calling the
/// evaluator from a unique code address.
pub type TrampolineFn =
    unsafe extern "C" fn(*mut c_void, *mut c_void, i32, EvalFn) -> *mut c_void;

/// What the subsystem requires from its embedding interpreter.
///
/// Frames and code objects cross this boundary as opaque pointers and are
/// never dereferenced by the subsystem itself. Implementations are expected
/// to be cheap handles into interpreter state, not owners of it.
pub trait Host {
    /// Route frame evaluation through the trampoline dispatcher.
    ///
    /// Fails if a foreign evaluator hook is already installed; installing
    /// over our own hook is a no-op.
    fn install_eval_hook(&mut self) -> Result<()>;

    /// Restore the default evaluator.
    fn uninstall_eval_hook(&mut self);

    /// Whether the trampoline dispatcher is the currently installed hook.
    fn eval_hook_installed(&self) -> bool;

    /// Reserve a per-code-object extra-slot index for trampoline pointers.
    ///
    /// The returned index must stay valid for the life of the interpreter.
    fn request_code_extra_index(&mut self) -> Result<u32>;

    /// The evaluator used when no trampoline intervenes.
    fn default_eval(&self) -> EvalFn;

    /// The code object executed by `frame`.
    ///
    /// # Safety
    ///
    /// `frame` must be a live frame handle as passed to
    /// [`PerfTrampoline::evaluate`](crate::PerfTrampoline::evaluate).
    unsafe fn frame_code(&self, frame: *mut c_void) -> *mut c_void;

    /// Read `code`'s extra-slot value at `index`; null when nothing is
    /// stored.
    ///
    /// # Safety
    ///
    /// `code` must be a live code-object handle and `index` one returned by
    /// [`Host::request_code_extra_index`].
    unsafe fn code_extra(&self, code: *mut c_void, index: u32) -> *mut c_void;

    /// Store `value` in `code`'s extra slot at `index`. No ownership is
    /// transferred; the value is an address into memory the subsystem keeps
    /// alive.
    ///
    /// # Safety
    ///
    /// Same requirements as [`Host::code_extra`].
    unsafe fn code_set_extra(&self, code: *mut c_void, index: u32, value: *mut c_void);

    /// Qualified name of `code`, if it has one.
    ///
    /// # Safety
    ///
    /// `code` must be a live code-object handle.
    unsafe fn code_qualname(&self, code: *mut c_void) -> Option<Cow<'_, str>>;

    /// Source filename of `code`, if it has one.
    ///
    /// # Safety
    ///
    /// `code` must be a live code-object handle.
    unsafe fn code_filename(&self, code: *mut c_void) -> Option<Cow<'_, str>>;
}
