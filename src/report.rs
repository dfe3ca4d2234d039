//! Turns tracker snapshots into the human-readable report.
//!
//! Frames are resolved through `dladdr`; frames belonging to the
//! detector itself are suppressed so reports foreground user code.
//! Source lines come from the external `addr2line` helper and degrade
//! to module+offset when it is unavailable.

use std::ffi::CStr;
use std::mem;
use std::process::Command;

use libc::c_void;

use crate::consts::SELF_MARKER;
use crate::lock::{DeadlockCycle, LockRecordView, LockSnapshot};
use crate::memory::MemorySnapshot;
use crate::output::{color, output_sink};
use crate::stack::CallStack;

struct FrameInfo {
    module: String,
    base: usize,
}

fn resolve_frame(addr: usize) -> Option<FrameInfo> {
    let mut info: libc::Dl_info = unsafe { mem::zeroed() };
    if unsafe { libc::dladdr(addr as *const c_void, &mut info) } == 0 {
        return None;
    }
    if info.dli_fname.is_null() {
        return None;
    }
    let module = unsafe { CStr::from_ptr(info.dli_fname) }
        .to_string_lossy()
        .into_owned();
    Some(FrameInfo {
        module,
        base: info.dli_fbase as usize,
    })
}

fn symbolize(module: &str, relative: usize) -> Option<String> {
    let output = Command::new("addr2line")
        .arg("-e")
        .arg(module)
        .arg("-f")
        .arg("-C")
        .arg("-p")
        .arg(format!("{:#x}", relative))
        .output()
        .ok()?;
    if !output.status.success() {
        return None;
    }
    let line = String::from_utf8_lossy(&output.stdout)
        .lines()
        .next()?
        .trim()
        .to_string();
    if line.is_empty() || line.starts_with("??") {
        None
    } else {
        Some(line)
    }
}

/// Print a captured stack, numbering only the frames that survive
/// self-suppression. With `highlight_first`, the first surviving frame
/// (the likely origin site) is emphasized.
fn write_stack(stack: &CallStack, highlight_first: bool) {
    let sink = output_sink();
    let mut frame_index = 0usize;
    for &addr in stack.frames() {
        match resolve_frame(addr) {
            Some(frame) => {
                if frame.module.contains(SELF_MARKER) {
                    continue;
                }
                let relative = addr.wrapping_sub(frame.base);
                let line = format!(
                    "[{}] Absolute: {:#x}, Relative: {:#x}",
                    frame_index, addr, relative
                );
                sink.write("  ");
                if highlight_first && frame_index == 0 {
                    sink.write_colored(color::BOLD_CYAN, &line);
                } else {
                    sink.write(&line);
                }
                sink.write("\n");
                sink.write(&format!("      Module: {}\n", frame.module));
                if let Some(source) = symbolize(&frame.module, relative) {
                    sink.write("      ");
                    if highlight_first && frame_index == 0 {
                        sink.write_colored(color::BOLD_CYAN, &format!("Source: {}", source));
                    } else {
                        sink.write(&format!("Source: {}", source));
                    }
                    sink.write("\n");
                }
                frame_index += 1;
            }
            None => {
                sink.write(&format!("  [{}] {:#x}\n", frame_index, addr));
                frame_index += 1;
            }
        }
    }
}

pub fn report_memory(snapshot: &MemorySnapshot) {
    let sink = output_sink();
    sink.write("\n\n=== Memory Tracker Status ===\n");
    sink.write(&format!("Total allocated: {} bytes\n", snapshot.total_allocated));
    sink.write(&format!("Total freed: {} bytes\n", snapshot.total_freed));
    sink.write(&format!("Active allocations: {}\n", snapshot.active));

    sink.write("Potential leaks: ");
    let count_color = if snapshot.live.is_empty() {
        color::GREEN
    } else {
        color::BOLD_RED
    };
    sink.write_colored(count_color, &format!("{}", snapshot.live.len()));
    sink.write("\n");

    if !snapshot.live.is_empty() {
        sink.write("\n");
        sink.write_colored(color::BOLD_YELLOW, "Detailed leak information:");
        sink.write("\n");
        for (ptr, info) in snapshot.live.iter() {
            sink.write("\n");
            sink.write_colored(
                color::BOLD_RED,
                &format!("Leak at {:#x} (size: {} bytes)", ptr, info.size),
            );
            sink.write("\nCallstack:\n");
            write_stack(&info.stack, true);
        }
    }
    sink.write("\n===========================\n");
}

fn write_lock_record(view: &LockRecordView) {
    let sink = output_sink();
    sink.write(&format!(
        "Lock {:#x} (Mutex) held by thread {}\n",
        view.addr, view.owner
    ));
    sink.write("Acquired at:\n");
    write_stack(&view.stack, false);
    if !view.waiting_for.is_empty() {
        sink.write("Waiting for locks:");
        for &(waited, owner) in view.waiting_for.iter() {
            match owner {
                Some(owner) => {
                    sink.write(&format!(" {:#x} (held by thread {})", waited, owner))
                }
                None => sink.write(&format!(" {:#x} (unknown)", waited)),
            }
        }
        sink.write("\n");
    }
}

/// Emitted from inside the tracker the moment the search closes a
/// chain; detection is advisory and nothing is aborted.
pub fn emit_deadlock(cycle: &DeadlockCycle) {
    let sink = output_sink();
    sink.write("\n");
    sink.write_colored(color::BOLD_RED, "=== Potential Deadlock Detected! ===");
    sink.write("\nLock chain:\n");
    for view in cycle.chain.iter() {
        write_lock_record(view);
        sink.write("\n");
    }
}

pub fn report_locks(snapshot: &LockSnapshot) {
    let sink = output_sink();
    sink.write("\n=== Lock Detector Status ===\n");
    sink.write(&format!("Active locks: {}\n", snapshot.locks.len()));
    sink.write(&format!("Active threads: {}\n", snapshot.threads.len()));

    if !snapshot.locks.is_empty() {
        sink.write("\nDetailed lock information:\n");
        for view in snapshot.locks.iter() {
            sink.write("\n");
            write_lock_record(view);
        }
    }

    if !snapshot.threads.is_empty() {
        sink.write("\nThread Information:\n");
        for thread in snapshot.threads.iter() {
            sink.write(&format!("\nThread {}:\n", thread.thread));
            sink.write("  Held locks:");
            for &held in thread.held.iter() {
                sink.write(&format!(" {:#x}", held));
            }
            sink.write("\n  Waiting for locks:");
            for &(waited, owner) in thread.waiting.iter() {
                match owner {
                    Some(owner) => {
                        sink.write(&format!(" {:#x} (held by thread {})", waited, owner))
                    }
                    None => sink.write(&format!(" {:#x}", waited)),
                }
            }
            sink.write("\n");
        }
    }

    if !snapshot.cycles.is_empty() {
        sink.write(&format!(
            "\nDeadlock cycles reported so far: {}\n",
            snapshot.cycles.len()
        ));
        for cycle in snapshot.cycles.iter() {
            emit_deadlock(cycle);
        }
    }

    sink.write("\n===========================\n");
}

/// Hook summary printed once per registered object at Start.
pub fn report_start_summary(hooked: &[&str], skipped: &[&str]) {
    let sink = output_sink();
    sink.write_colored(color::GREEN, "Successfully hooked functions: ");
    sink.write(&hooked.join(", "));
    sink.write("\n");
    if !skipped.is_empty() {
        sink.write_colored(color::YELLOW, "Skipped functions (not in PLT): ");
        sink.write(&skipped.join(", "));
        sink.write("\n");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn own_frames_resolve_to_this_module() {
        let addr = resolve_frame as usize;
        let frame = resolve_frame(addr).expect("dladdr must know our own code");
        assert!(!frame.module.is_empty());
        assert!(frame.base <= addr);
    }

    #[test]
    fn unmapped_addresses_do_not_resolve() {
        // page zero is never mapped
        assert!(resolve_frame(0x10).is_none());
    }
}
