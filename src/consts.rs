/// Maximum number of frames captured per call stack.
pub const MAX_STACK_DEPTH: usize = 16;

/// Substring identifying the detector's own shared object; frames from
/// modules containing it are suppressed in reports.
pub const SELF_MARKER: &str = "libdetective";

pub const DETECT_MEMORY: u32 = 1;
pub const DETECT_LOCK: u32 = 2;

pub const OUTPUT_CONSOLE: u32 = 1;
pub const OUTPUT_FILE: u32 = 2;

#[test]
fn masks_are_disjoint() {
    assert_eq!(DETECT_MEMORY & DETECT_LOCK, 0);
    assert_eq!(OUTPUT_CONSOLE & OUTPUT_FILE, 0);
}
