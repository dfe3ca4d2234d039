//! Replace a named import of one loaded object by rewriting the GOT
//! word its PLT stub routes through.

use std::ffi::CString;
use std::sync::atomic::{AtomicUsize, Ordering};

use libc::c_void;
use nix::sys::mman::{mprotect, ProtFlags};
use nix::unistd::{sysconf, SysconfVar};

use crate::errors::{Error, Result};
use crate::image::ImageInspector;
use crate::proc::MemoryMapView;

lazy_static! {
    static ref PAGE_SIZE: usize = sysconf(SysconfVar::PAGE_SIZE)
        .ok()
        .and_then(|v| v)
        .map(|v| v as usize)
        .unwrap_or(4096);
}

/// Per-object patcher: an inspector over the object's PLT relocations
/// plus a protection snapshot taken at construction.
pub struct PltPatcher {
    inspector: ImageInspector,
    maps: MemoryMapView,
}

impl PltPatcher {
    /// `None` targets the main executable; `Some(path)` a shared
    /// object that must already be loaded.
    pub fn for_object(path: Option<&str>) -> Result<Self> {
        let inspector = match path {
            Some(p) => ImageInspector::for_object(p)?,
            None => ImageInspector::main_executable()?,
        };
        let maps = MemoryMapView::snapshot()?;
        Ok(PltPatcher { inspector, maps })
    }

    /// Divert `name` to `new_fn` and return the previously resolved
    /// address.
    ///
    /// The prior address comes from `dlsym(RTLD_DEFAULT)` rather than
    /// the GOT word itself, which may still point at the linker's lazy
    /// resolver. The GOT write is a single aligned store, atomic on
    /// x86-64; concurrent callers observe either address.
    pub fn replace_function(&self, name: &str, new_fn: *const c_void) -> Result<*const c_void> {
        let cname = CString::new(name)
            .map_err(|_| Error::InvalidArgument(format!("nul in symbol name: {:?}", name)).record())?;
        let original = unsafe { libc::dlsym(libc::RTLD_DEFAULT, cname.as_ptr()) };
        if original.is_null() {
            return Err(Error::FunctionNotFound(name.to_string()).record());
        }

        let mut pos = 0;
        loop {
            let entry = match self.inspector.enumerate(&mut pos) {
                Ok(entry) => entry,
                Err(Error::EndOfEnumeration) => break,
                Err(err) => return Err(err),
            };
            if !symbol_matches(entry.name, name) {
                continue;
            }

            let slot = entry.got_slot as usize;
            let page = slot & !(*PAGE_SIZE - 1);
            let prot = self.maps.protection_at(slot).ok_or_else(|| {
                Error::InternalError(format!("could not get memory protection at {:#x}", page))
                    .record()
            })?;

            let guard = ProtGuard::widen(page, prot)?;
            unsafe {
                (*(slot as *const AtomicUsize)).store(new_fn as usize, Ordering::SeqCst);
            }
            guard.restore()?;
            return Ok(original as *const c_void);
        }

        Err(Error::FunctionNotFound(name.to_string()).record())
    }
}

/// A PLT name matches when it equals the wanted symbol exactly or up
/// to a `@VERSION` suffix.
fn symbol_matches(entry: &str, wanted: &str) -> bool {
    match entry.strip_prefix(wanted) {
        Some(rest) => rest.is_empty() || rest.starts_with('@'),
        None => false,
    }
}

/// Temporary write permission on one page. `restore()` surfaces a
/// re-narrowing failure; if the guard is dropped without it (early
/// error exit), restoration is attempted best-effort.
struct ProtGuard {
    page: usize,
    prot: i32,
    widened: bool,
    restored: bool,
}

impl ProtGuard {
    fn widen(page: usize, prot: i32) -> Result<Self> {
        let widened = prot & libc::PROT_WRITE == 0;
        if widened {
            mprotect_page(page, prot | libc::PROT_WRITE).map_err(|err| {
                Error::InternalError(format!(
                    "could not change memory protection at {:#x}: {}",
                    page, err
                ))
                .record()
            })?;
        }
        Ok(ProtGuard {
            page,
            prot,
            widened,
            restored: false,
        })
    }

    fn restore(mut self) -> Result<()> {
        self.restored = true;
        if self.widened {
            mprotect_page(self.page, self.prot).map_err(|err| {
                Error::InternalError(format!(
                    "could not restore memory protection at {:#x}: {}",
                    self.page, err
                ))
                .record()
            })?;
        }
        Ok(())
    }
}

impl Drop for ProtGuard {
    fn drop(&mut self) {
        if self.widened && !self.restored {
            let _ = mprotect_page(self.page, self.prot);
        }
    }
}

fn mprotect_page(page: usize, prot: i32) -> nix::Result<()> {
    unsafe {
        mprotect(
            page as *mut c_void,
            *PAGE_SIZE,
            ProtFlags::from_bits_truncate(prot),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn version_suffixes_match() {
        assert!(symbol_matches("malloc", "malloc"));
        assert!(symbol_matches("malloc@GLIBC_2.2.5", "malloc"));
        assert!(!symbol_matches("mallocx", "malloc"));
        assert!(!symbol_matches("mall", "malloc"));
        assert!(!symbol_matches("free", "malloc"));
    }

    #[test]
    fn missing_symbol_reports_function_not_found() {
        let patcher = PltPatcher::for_object(None).unwrap();
        match patcher.replace_function("detective_no_such_symbol", super::mprotect_page as *const c_void) {
            Err(Error::FunctionNotFound(name)) => {
                assert_eq!(name, "detective_no_such_symbol");
            }
            other => panic!("expected FunctionNotFound, got {:?}", other.map(|_| ())),
        }
    }

    unsafe extern "C" fn answer_getpid() -> libc::pid_t {
        4242
    }

    /// Patch-then-restore on the test binary's own PLT: installing the
    /// previously captured address must return the slot to behavior
    /// indistinguishable from pre-patch.
    #[test]
    fn patch_and_restore_round_trip() -> Result<()> {
        let real_pid = unsafe { libc::getpid() };
        let patcher = PltPatcher::for_object(None)?;

        let original = patcher.replace_function("getpid", answer_getpid as *const c_void)?;
        assert_eq!(unsafe { libc::getpid() }, 4242);

        patcher.replace_function("getpid", original)?;
        assert_eq!(unsafe { libc::getpid() }, real_pid);
        Ok(())
    }
}
