//! Locate a loaded object's dynamic tables through the dynamic
//! linker's own bookkeeping, without mapping anything new.

use std::ffi::{CStr, CString};
use std::ptr;

use goblin::elf::dynamic::{DT_JMPREL, DT_NULL, DT_PLTRELSZ, DT_STRSZ, DT_STRTAB, DT_SYMTAB};
use goblin::elf::reloc::R_X86_64_JUMP_SLOT;
use goblin::elf64::dynamic::Dyn;
use goblin::elf64::reloc::{self, Rela};
use goblin::elf64::sym::Sym;
use libc::{c_char, c_void};

use crate::errors::{Error, Result};

/// `struct link_map` from `<link.h>`; only the leading fields glibc
/// guarantees are mirrored here.
#[repr(C)]
struct LinkMap {
    l_addr: u64,
    l_name: *const c_char,
    l_ld: *const Dyn,
    l_next: *mut LinkMap,
    l_prev: *mut LinkMap,
}

/// One JUMP_SLOT relocation of the inspected object: the imported
/// symbol's name and the GOT word the PLT stub routes through.
pub struct PltEntry<'a> {
    pub name: &'a str,
    pub got_slot: *mut usize,
}

/// Dynamic-table addresses of one loaded object.
///
/// The pointers reference the dynamic linker's in-memory tables, which
/// live until process exit.
pub struct ImageInspector {
    base: u64,
    dynsym: *const Sym,
    dynstr: *const c_char,
    dynstr_len: usize,
    rela_plt: *const Rela,
    rela_plt_len: usize,
}

// The referenced tables are immutable loader state with process
// lifetime; moving the inspector across threads is sound.
unsafe impl Send for ImageInspector {}

impl ImageInspector {
    /// Inspect an already-loaded shared object. The object is looked
    /// up with `RTLD_NOLOAD`; an object that is not resident fails
    /// with [`Error::FileNotFound`].
    pub fn for_object(path: &str) -> Result<Self> {
        let cpath = CString::new(path)
            .map_err(|_| Error::InvalidArgument(format!("nul in path: {:?}", path)).record())?;
        let handle =
            unsafe { libc::dlopen(cpath.as_ptr(), libc::RTLD_LAZY | libc::RTLD_NOLOAD) };
        if handle.is_null() {
            return Err(
                Error::FileNotFound(format!("{}: {}", path, dlerror_string())).record()
            );
        }
        let lmap = link_map_of(handle);
        unsafe { libc::dlclose(handle) };
        unsafe { Self::from_link_map(&*lmap?) }
    }

    /// Inspect the main executable: take any handle's `link_map` and
    /// walk the list back to its head.
    pub fn main_executable() -> Result<Self> {
        let handle = unsafe { libc::dlopen(ptr::null(), libc::RTLD_LAZY) };
        if handle.is_null() {
            return Err(
                Error::InternalError(format!("dlopen(self): {}", dlerror_string())).record()
            );
        }
        let lmap = link_map_of(handle);
        unsafe { libc::dlclose(handle) };
        let mut lmap = lmap?;
        unsafe {
            while !(*lmap).l_prev.is_null() {
                lmap = (*lmap).l_prev;
            }
            Self::from_link_map(&*lmap)
        }
    }

    unsafe fn from_link_map(lmap: &LinkMap) -> Result<Self> {
        let dynsym = find_dynamic_entry(lmap.l_ld, DT_SYMTAB)
            .ok_or_else(|| Error::InternalError("DT_SYMTAB missing".into()).record())?;
        let dynstr = find_dynamic_entry(lmap.l_ld, DT_STRTAB)
            .ok_or_else(|| Error::InternalError("DT_STRTAB missing".into()).record())?;
        let dynstr_len = find_dynamic_entry(lmap.l_ld, DT_STRSZ)
            .ok_or_else(|| Error::InternalError("DT_STRSZ missing".into()).record())?;
        let rela_plt = find_dynamic_entry(lmap.l_ld, DT_JMPREL)
            .ok_or_else(|| Error::InternalError("DT_JMPREL missing".into()).record())?;
        let rela_plt_sz = find_dynamic_entry(lmap.l_ld, DT_PLTRELSZ)
            .ok_or_else(|| Error::InternalError("DT_PLTRELSZ missing".into()).record())?;

        Ok(ImageInspector {
            base: lmap.l_addr,
            dynsym: dynsym as *const Sym,
            dynstr: dynstr as *const c_char,
            dynstr_len: dynstr_len as usize,
            rela_plt: rela_plt as *const Rela,
            rela_plt_len: rela_plt_sz as usize / std::mem::size_of::<Rela>(),
        })
    }

    /// Yield the next JUMP_SLOT entry at or after `*pos`, advancing
    /// the cursor past it. Relocations of other types are skipped.
    /// Exhaustion is the benign [`Error::EndOfEnumeration`].
    pub fn enumerate(&self, pos: &mut usize) -> Result<PltEntry> {
        while *pos < self.rela_plt_len {
            let rela = unsafe { &*self.rela_plt.add(*pos) };
            *pos += 1;
            if reloc::r_type(rela.r_info) as u32 != R_X86_64_JUMP_SLOT {
                continue;
            }
            let sym_idx = reloc::r_sym(rela.r_info) as usize;
            let sym = unsafe { &*self.dynsym.add(sym_idx) };
            let name = self.symbol_name(sym.st_name as usize)?;
            return Ok(PltEntry {
                name,
                got_slot: (self.base + rela.r_offset) as *mut usize,
            });
        }
        Err(Error::EndOfEnumeration)
    }

    fn symbol_name(&self, offset: usize) -> Result<&str> {
        if offset >= self.dynstr_len {
            return Err(Error::InternalError(format!(
                "symbol name offset {} beyond string table ({} bytes)",
                offset, self.dynstr_len
            ))
            .record());
        }
        unsafe { CStr::from_ptr(self.dynstr.add(offset)) }
            .to_str()
            .map_err(|_| Error::InternalError("non-utf8 symbol name".into()).record())
    }
}

fn link_map_of(handle: *mut c_void) -> Result<*mut LinkMap> {
    let mut lmap: *mut LinkMap = ptr::null_mut();
    let rc = unsafe {
        libc::dlinfo(
            handle,
            libc::RTLD_DI_LINKMAP,
            &mut lmap as *mut *mut LinkMap as *mut c_void,
        )
    };
    if rc != 0 || lmap.is_null() {
        return Err(Error::InternalError(format!("dlinfo: {}", dlerror_string())).record());
    }
    Ok(lmap)
}

fn find_dynamic_entry(dynamic: *const Dyn, tag: u64) -> Option<u64> {
    let mut cur = dynamic;
    unsafe {
        while (*cur).d_tag != DT_NULL {
            if (*cur).d_tag == tag {
                return Some((*cur).d_val);
            }
            cur = cur.add(1);
        }
    }
    None
}

fn dlerror_string() -> String {
    let msg = unsafe { libc::dlerror() };
    if msg.is_null() {
        String::from("unknown dl error")
    } else {
        unsafe { CStr::from_ptr(msg) }.to_string_lossy().into_owned()
    }
}

#[test]
fn main_executable_has_plt_relocations() -> Result<()> {
    let inspector = ImageInspector::main_executable()?;
    let mut pos = 0;
    let mut seen = 0;
    loop {
        match inspector.enumerate(&mut pos) {
            Ok(entry) => {
                assert!(!entry.name.is_empty());
                assert!(!entry.got_slot.is_null());
                seen += 1;
            }
            Err(Error::EndOfEnumeration) => break,
            Err(other) => return Err(other),
        }
    }
    assert!(seen > 0);
    Ok(())
}

#[test]
fn absent_object_is_file_not_found() {
    match ImageInspector::for_object("libdetective-no-such-object.so") {
        Err(Error::FileNotFound(_)) => {}
        other => panic!("expected FileNotFound, got {:?}", other.map(|_| ())),
    }
}
