//! A minimal mock interpreter for exercising the dispatch path.

#![allow(dead_code)]

use std::borrow::Cow;
use std::ffi::c_void;
use std::ptr;

use anyhow::{Result, bail};
use opal_perf_trampoline::{EvalFn, Host};

pub const EXTRA_SLOTS: usize = 4;

/// A code object as the mock interpreter stores it. Tests keep the box alive
/// for as long as its handle circulates.
pub struct MockCode {
    pub qualname: Option<String>,
    pub filename: Option<String>,
    pub extra: [*mut c_void; EXTRA_SLOTS],
}

pub fn code(qualname: Option<&str>, filename: Option<&str>) -> Box<MockCode> {
    Box::new(MockCode {
        qualname: qualname.map(str::to_owned),
        filename: filename.map(str::to_owned),
        extra: [ptr::null_mut(); EXTRA_SLOTS],
    })
}

/// The opaque handle the subsystem sees for both the frame and its code
/// object; the mock uses the code object itself as the frame.
pub fn handle(code: &mut MockCode) -> *mut c_void {
    ptr::from_mut(code).cast()
}

pub struct MockHost {
    eval: EvalFn,
    hook_installed: bool,
    foreign_hook: bool,
    next_index: u32,
}

impl MockHost {
    pub fn new(eval: EvalFn) -> MockHost {
        MockHost {
            eval,
            hook_installed: false,
            foreign_hook: false,
            next_index: 0,
        }
    }

    pub fn with_foreign_hook(eval: EvalFn) -> MockHost {
        MockHost {
            foreign_hook: true,
            ..MockHost::new(eval)
        }
    }
}

impl Host for MockHost {
    fn install_eval_hook(&mut self) -> Result<()> {
        if self.foreign_hook {
            bail!("a custom evaluator hook is already installed");
        }
        self.hook_installed = true;
        Ok(())
    }

    fn uninstall_eval_hook(&mut self) {
        self.hook_installed = false;
    }

    fn eval_hook_installed(&self) -> bool {
        self.hook_installed
    }

    fn request_code_extra_index(&mut self) -> Result<u32> {
        let index = self.next_index;
        self.next_index += 1;
        assert!((index as usize) < EXTRA_SLOTS);
        Ok(index)
    }

    fn default_eval(&self) -> EvalFn {
        self.eval
    }

    unsafe fn frame_code(&self, frame: *mut c_void) -> *mut c_void {
        frame
    }

    unsafe fn code_extra(&self, code: *mut c_void, index: u32) -> *mut c_void {
        unsafe { (*code.cast::<MockCode>()).extra[index as usize] }
    }

    unsafe fn code_set_extra(&self, code: *mut c_void, index: u32, value: *mut c_void) {
        unsafe {
            (*code.cast::<MockCode>()).extra[index as usize] = value;
        }
    }

    unsafe fn code_qualname(&self, code: *mut c_void) -> Option<Cow<'_, str>> {
        unsafe { (*code.cast::<MockCode>()).qualname.as_deref().map(Cow::Borrowed) }
    }

    unsafe fn code_filename(&self, code: *mut c_void) -> Option<Cow<'_, str>> {
        unsafe { (*code.cast::<MockCode>()).filename.as_deref().map(Cow::Borrowed) }
    }
}

/// Evaluator returning a fixed sentinel.
pub unsafe extern "C" fn eval_const(
    _thread_state: *mut c_void,
    _frame: *mut c_void,
    _throw_flag: i32,
) -> *mut c_void {
    42 as *mut c_void
}

/// Evaluator echoing its first argument, to observe forwarding through the
/// stub.
pub unsafe extern "C" fn eval_thread_state(
    thread_state: *mut c_void,
    _frame: *mut c_void,
    _throw_flag: i32,
) -> *mut c_void {
    thread_state
}

/// Evaluator echoing its second argument.
pub unsafe extern "C" fn eval_frame(
    _thread_state: *mut c_void,
    frame: *mut c_void,
    _throw_flag: i32,
) -> *mut c_void {
    frame
}

/// Evaluator echoing its third argument.
pub unsafe extern "C" fn eval_throw_flag(
    _thread_state: *mut c_void,
    _frame: *mut c_void,
    throw_flag: i32,
) -> *mut c_void {
    throw_flag as usize as *mut c_void
}

/// Read this process's perf map, empty if it does not exist yet.
pub fn read_perf_map() -> String {
    let path = opal_perf_trampoline::PerfMapFile::path_for(std::process::id());
    std::fs::read_to_string(path).unwrap_or_default()
}
