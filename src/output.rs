//! Report sink: console, file, or both. Every formatted write is
//! flushed; interleaving callers get per-record atomicity, not
//! whole-report atomicity.

use std::fs::{self, File};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::{SystemTime, UNIX_EPOCH};

use crate::consts::{OUTPUT_CONSOLE, OUTPUT_FILE};
use crate::errors::Result;

/// ANSI escape codes used by the reporter.
pub mod color {
    pub const RESET: &str = "\x1b[0m";
    pub const RED: &str = "\x1b[31m";
    pub const GREEN: &str = "\x1b[32m";
    pub const YELLOW: &str = "\x1b[33m";
    pub const BOLD_RED: &str = "\x1b[1;31m";
    pub const BOLD_YELLOW: &str = "\x1b[1;33m";
    pub const BOLD_CYAN: &str = "\x1b[1;36m";
}

struct SinkState {
    mask: u32,
    file: Option<File>,
}

pub struct OutputSink {
    state: Mutex<SinkState>,
}

impl OutputSink {
    fn new() -> Self {
        OutputSink {
            state: Mutex::new(SinkState {
                mask: OUTPUT_CONSOLE,
                file: None,
            }),
        }
    }

    /// Select targets; when the mask includes the file bit, open
    /// `path` for writing, creating its directory if absent. A
    /// previously opened file is dropped first.
    pub fn configure(&self, mask: u32, path: Option<&Path>) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        state.mask = mask;
        state.file = None;
        if mask & OUTPUT_FILE != 0 {
            if let Some(path) = path {
                if let Some(dir) = path.parent() {
                    fs::create_dir_all(dir)?;
                }
                state.file = Some(File::create(path)?);
            }
        }
        Ok(())
    }

    pub fn write(&self, text: &str) {
        let mut state = self.state.lock().unwrap();
        if state.mask & OUTPUT_CONSOLE != 0 {
            print!("{}", text);
            let _ = io::stdout().flush();
        }
        if state.mask & OUTPUT_FILE != 0 {
            if let Some(file) = state.file.as_mut() {
                let _ = file.write_all(text.as_bytes());
                let _ = file.flush();
            }
        }
    }

    pub fn write_colored(&self, color: &str, text: &str) {
        self.write(&format!("{}{}{}", color, text, color::RESET));
    }
}

lazy_static! {
    static ref OUTPUT_SINK: OutputSink = OutputSink::new();
}

/// The process-wide report sink. Defaults to console-only until
/// configured.
pub fn output_sink() -> &'static OutputSink {
    &OUTPUT_SINK
}

/// `<work_dir>/detector_<epoch_seconds>.log`
pub fn log_file_path(work_dir: &str) -> PathBuf {
    let epoch = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0);
    PathBuf::from(work_dir).join(format!("detector_{}.log", epoch))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn log_path_is_under_the_work_dir() {
        let path = log_file_path("/tmp/detective-logs");
        assert!(path.starts_with("/tmp/detective-logs"));
        let name = path.file_name().unwrap().to_string_lossy().into_owned();
        assert!(name.starts_with("detector_"));
        assert!(name.ends_with(".log"));
    }

    #[test]
    fn file_sink_creates_work_dir_and_flushes() -> Result<()> {
        let dir = std::env::temp_dir().join(format!("detective-test-{}", std::process::id()));
        let path = dir.join("detector_0.log");
        let sink = OutputSink::new();
        sink.configure(OUTPUT_FILE, Some(&path))?;
        sink.write("one record\n");
        let written = fs::read_to_string(&path)?;
        assert_eq!(written, "one record\n");
        let _ = fs::remove_dir_all(&dir);
        Ok(())
    }
}
