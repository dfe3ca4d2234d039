//! The thin C ABI façade driving the detector.
//!
//! ```c
//! detector_init("./logs", DETECT_MEMORY | DETECT_LOCK, OUTPUT_CONSOLE | OUTPUT_FILE);
//! detector_register_main();
//! detector_start();
//! /* ... exercise the program ... */
//! detector_detect();
//! ```

use std::ffi::CStr;
use std::sync::atomic::{AtomicU32, Ordering};

use libc::c_char;

use crate::consts::{DETECT_LOCK, DETECT_MEMORY};
use crate::lock::{lock_detect, lock_tracker};
use crate::memory::{memory_detect, memory_tracker};
use crate::output::{log_file_path, output_sink};
use crate::{report, stack};

static DETECT_MASK: AtomicU32 = AtomicU32::new(DETECT_MEMORY | DETECT_LOCK);

/// Configure the sink and detection mask. `detect_mask`: bit 0 =
/// memory, bit 1 = lock. `output_mask`: 1 = console, 2 = file, 3 =
/// both. The log file is `<work_dir>/detector_<epoch>.log`; `work_dir`
/// is created if absent.
#[no_mangle]
pub extern "C" fn detector_init(work_dir: *const c_char, detect_mask: u32, output_mask: u32) {
    let _ = setup_logger();
    DETECT_MASK.store(detect_mask, Ordering::SeqCst);

    let dir = if work_dir.is_null() {
        String::from(".")
    } else {
        unsafe { CStr::from_ptr(work_dir) }
            .to_string_lossy()
            .into_owned()
    };
    let path = log_file_path(&dir);
    if let Err(err) = output_sink().configure(output_mask, Some(&path)) {
        log::error!("cannot configure output sink at {:?}: {}", path, err);
    }

    // First use of the capture primitive may allocate; do it now,
    // before any PLT entry is rewritten.
    stack::warm_up();
}

/// Add a shared object to the registration list. Null is a no-op.
#[no_mangle]
pub extern "C" fn detector_register(path: *const c_char) {
    if path.is_null() {
        return;
    }
    let path = unsafe { CStr::from_ptr(path) }.to_string_lossy();
    let mask = DETECT_MASK.load(Ordering::SeqCst);
    if mask & DETECT_MEMORY != 0 {
        memory_detect().register(&path);
    }
    if mask & DETECT_LOCK != 0 {
        lock_detect().register(&path);
    }
    log::info!("registered {}", path);
}

/// Add the main executable to the registration list.
#[no_mangle]
pub extern "C" fn detector_register_main() {
    let mask = DETECT_MASK.load(Ordering::SeqCst);
    if mask & DETECT_MEMORY != 0 {
        memory_detect().register_main();
    }
    if mask & DETECT_LOCK != 0 {
        lock_detect().register_main();
    }
    log::info!("registered main executable");
}

/// Rewrite the PLT of every registered target. Expected to be driven
/// single-threaded, before the workload starts.
#[no_mangle]
pub extern "C" fn detector_start() {
    let mask = DETECT_MASK.load(Ordering::SeqCst);
    if mask & DETECT_MEMORY != 0 {
        memory_detect().start();
    }
    if mask & DETECT_LOCK != 0 {
        lock_detect().start();
    }
}

/// Emit the report for every enabled detector.
#[no_mangle]
pub extern "C" fn detector_detect() {
    let mask = DETECT_MASK.load(Ordering::SeqCst);
    if mask & DETECT_MEMORY != 0 {
        report::report_memory(&memory_tracker().snapshot());
    }
    if mask & DETECT_LOCK != 0 {
        report::report_locks(&lock_tracker().snapshot());
    }
}

fn setup_logger() -> Result<(), log::SetLoggerError> {
    let level = match std::env::var("DETECTIVE_LOG").ok().as_deref() {
        Some("error") => log::LevelFilter::Error,
        Some("warn") => log::LevelFilter::Warn,
        Some("info") => log::LevelFilter::Info,
        Some("debug") => log::LevelFilter::Debug,
        Some("trace") => log::LevelFilter::Trace,
        _ => log::LevelFilter::Warn,
    };
    fern::Dispatch::new()
        .level(level)
        .format(|out, message, record| {
            out.finish(format_args!("[{:<5}] {}", record.level(), message))
        })
        .chain(std::io::stderr())
        .apply()
}
