//! Bounded call-stack capture on top of glibc's `backtrace`.

use libc::{c_int, c_void};

use crate::consts::MAX_STACK_DEPTH;

/// Instruction pointers of a captured call stack, innermost first.
#[derive(Clone, Debug, Default)]
pub struct CallStack {
    frames: Vec<usize>,
}

impl CallStack {
    /// Capture the calling thread's stack, at most
    /// [`MAX_STACK_DEPTH`] frames deep.
    pub fn capture() -> Self {
        let mut buf = [std::ptr::null_mut::<c_void>(); MAX_STACK_DEPTH];
        let depth =
            unsafe { libc::backtrace(buf.as_mut_ptr(), MAX_STACK_DEPTH as c_int) };
        let depth = if depth < 0 { 0 } else { depth as usize };
        CallStack {
            frames: buf[..depth].iter().map(|p| *p as usize).collect(),
        }
    }

    pub fn frames(&self) -> &[usize] {
        &self.frames
    }

    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }
}

/// glibc's `backtrace` may load libgcc (and allocate) on first use.
/// One throwaway capture before any PLT entry is rewritten keeps that
/// first use out of the interposers.
pub fn warm_up() {
    let _ = CallStack::capture();
}

#[test]
fn capture_is_bounded() {
    let stack = CallStack::capture();
    assert!(!stack.is_empty());
    assert!(stack.frames().len() <= MAX_STACK_DEPTH);
}
