//! Live-allocation tracking and the allocator interposers.

use std::collections::HashMap;
use std::sync::Mutex;

use libc::{c_void, size_t};

use crate::patch::PltPatcher;
use crate::report;
use crate::stack::CallStack;

/// What is known about one live allocation.
#[derive(Clone)]
pub struct AllocationInfo {
    pub size: usize,
    pub stack: CallStack,
}

#[derive(Default)]
struct MemoryState {
    allocations: HashMap<usize, AllocationInfo>,
    total_allocated: usize,
    total_freed: usize,
    active: usize,
}

/// Counters and live records handed to the reporter.
pub struct MemorySnapshot {
    pub total_allocated: usize,
    pub total_freed: usize,
    pub active: usize,
    pub live: Vec<(usize, AllocationInfo)>,
}

/// Map from live pointer to allocation record, guarded by one mutex
/// together with the three counters.
///
/// The tracker's own bookkeeping allocates through the detector's
/// unpatched PLT, so interposer calls do not re-enter it.
pub struct MemoryTracker {
    state: Mutex<MemoryState>,
}

impl MemoryTracker {
    pub fn new() -> Self {
        MemoryTracker {
            state: Mutex::new(MemoryState::default()),
        }
    }

    /// Record an allocator call that returned `ptr`. Null is a no-op.
    /// A stale entry under the same key (a missed free) is overwritten.
    pub fn record_allocation(&self, ptr: usize, size: usize) {
        if ptr == 0 {
            return;
        }
        let stack = CallStack::capture();
        let mut state = match self.state.lock() {
            Ok(state) => state,
            Err(_) => return,
        };
        state.total_allocated += size;
        state.active += 1;
        state.allocations.insert(ptr, AllocationInfo { size, stack });
    }

    /// Record the free of `ptr`. Null and unknown pointers are no-ops.
    pub fn record_deallocation(&self, ptr: usize) {
        if ptr == 0 {
            return;
        }
        let mut state = match self.state.lock() {
            Ok(state) => state,
            Err(_) => return,
        };
        if let Some(info) = state.allocations.remove(&ptr) {
            state.total_freed += info.size;
            state.active -= 1;
        }
    }

    /// An in-place `realloc`: same key, new size, stack re-captured at
    /// the current call. Unknown pointers are no-ops.
    pub fn update_allocation_size(&self, ptr: usize, new_size: usize) {
        if ptr == 0 {
            return;
        }
        let stack = CallStack::capture();
        let mut state = match self.state.lock() {
            Ok(state) => state,
            Err(_) => return,
        };
        let old_size = match state.allocations.get(&ptr) {
            Some(info) => info.size,
            None => return,
        };
        state.total_allocated = state.total_allocated - old_size + new_size;
        state.allocations.insert(
            ptr,
            AllocationInfo {
                size: new_size,
                stack,
            },
        );
    }

    pub fn snapshot(&self) -> MemorySnapshot {
        let state = self.state.lock().unwrap();
        MemorySnapshot {
            total_allocated: state.total_allocated,
            total_freed: state.total_freed,
            active: state.active,
            live: state
                .allocations
                .iter()
                .map(|(&ptr, info)| (ptr, info.clone()))
                .collect(),
        }
    }

    pub fn has_leaks(&self) -> bool {
        !self.state.lock().unwrap().allocations.is_empty()
    }

    pub fn total_allocated(&self) -> usize {
        self.state.lock().unwrap().total_allocated
    }

    pub fn active_allocations(&self) -> usize {
        self.state.lock().unwrap().active
    }
}

lazy_static! {
    static ref MEMORY_TRACKER: MemoryTracker = MemoryTracker::new();
}

/// The process-wide allocation tracker.
pub fn memory_tracker() -> &'static MemoryTracker {
    &MEMORY_TRACKER
}

pub unsafe extern "C" fn malloc_hook(size: size_t) -> *mut c_void {
    let ptr = libc::malloc(size);
    memory_tracker().record_allocation(ptr as usize, size);
    ptr
}

pub unsafe extern "C" fn free_hook(ptr: *mut c_void) {
    memory_tracker().record_deallocation(ptr as usize);
    libc::free(ptr);
}

pub unsafe extern "C" fn calloc_hook(nmemb: size_t, size: size_t) -> *mut c_void {
    let ptr = libc::calloc(nmemb, size);
    memory_tracker().record_allocation(ptr as usize, nmemb.wrapping_mul(size));
    ptr
}

/// The returned pointer decides the bookkeeping: identity and non-null
/// is an in-place resize; anything else is a free of the old pointer
/// followed by an allocation at the new one. `realloc(NULL, n)` and
/// `realloc(p, 0)` fall out of the same rule.
pub unsafe extern "C" fn realloc_hook(old_ptr: *mut c_void, new_size: size_t) -> *mut c_void {
    let old_addr = old_ptr as usize;
    let new_ptr = libc::realloc(old_ptr, new_size);
    if new_ptr as usize == old_addr && !new_ptr.is_null() {
        memory_tracker().update_allocation_size(old_addr, new_size);
    } else {
        memory_tracker().record_deallocation(old_addr);
        memory_tracker().record_allocation(new_ptr as usize, new_size);
    }
    new_ptr
}

// Itanium-ABI manglings: _Znwm / _Znam are operator new / new[],
// _ZdlPv / _ZdaPv are operator delete / delete[]. All forward to the
// C allocator, as the PLT entries they replace ultimately do.

pub unsafe extern "C" fn operator_new_hook(size: size_t) -> *mut c_void {
    let ptr = libc::malloc(size);
    memory_tracker().record_allocation(ptr as usize, size);
    ptr
}

pub unsafe extern "C" fn operator_delete_hook(ptr: *mut c_void) {
    memory_tracker().record_deallocation(ptr as usize);
    libc::free(ptr);
}

pub unsafe extern "C" fn operator_new_array_hook(size: size_t) -> *mut c_void {
    let ptr = libc::malloc(size);
    memory_tracker().record_allocation(ptr as usize, size);
    ptr
}

pub unsafe extern "C" fn operator_delete_array_hook(ptr: *mut c_void) {
    memory_tracker().record_deallocation(ptr as usize);
    libc::free(ptr);
}

#[derive(Default)]
pub struct MemoryDetect {
    targets: Mutex<Vec<Option<String>>>,
}

lazy_static! {
    static ref MEMORY_DETECT: MemoryDetect = MemoryDetect::default();
}

pub fn memory_detect() -> &'static MemoryDetect {
    &MEMORY_DETECT
}

impl MemoryDetect {
    pub fn register(&self, path: &str) {
        self.targets.lock().unwrap().push(Some(path.to_string()));
    }

    pub fn register_main(&self) {
        self.targets.lock().unwrap().push(None);
    }

    /// Patch the allocator symbols of every registered object.
    /// `malloc`/`free` failures are errors; the remaining symbols are
    /// optional and accumulate into the skipped list.
    pub fn start(&self) {
        for target in self.targets.lock().unwrap().iter() {
            let label = target.as_deref().unwrap_or("<main>");
            let patcher = match PltPatcher::for_object(target.as_deref()) {
                Ok(patcher) => patcher,
                Err(err) => {
                    log::error!("memory hooks: cannot inspect {}: {}", label, err);
                    continue;
                }
            };
            install_hooks(&patcher, label);
        }
    }
}

fn install_hooks(patcher: &PltPatcher, label: &str) {
    let mut hooked: Vec<&str> = Vec::new();
    let mut skipped: Vec<&str> = Vec::new();

    match patcher.replace_function("malloc", malloc_hook as *const c_void) {
        Ok(_) => hooked.push("malloc"),
        Err(err) => log::error!("{}: failed to hook malloc: {}", label, err),
    }
    match patcher.replace_function("free", free_hook as *const c_void) {
        Ok(_) => hooked.push("free"),
        Err(err) => log::error!("{}: failed to hook free: {}", label, err),
    }

    let optional: [(&str, *const c_void, &str); 6] = [
        ("calloc", calloc_hook as *const c_void, "calloc"),
        ("realloc", realloc_hook as *const c_void, "realloc"),
        ("_Znwm", operator_new_hook as *const c_void, "operator new"),
        ("_ZdlPv", operator_delete_hook as *const c_void, "operator delete"),
        ("_Znam", operator_new_array_hook as *const c_void, "operator new[]"),
        ("_ZdaPv", operator_delete_array_hook as *const c_void, "operator delete[]"),
    ];
    for &(symbol, hook, display) in optional.iter() {
        match patcher.replace_function(symbol, hook) {
            Ok(_) => hooked.push(display),
            Err(_) => skipped.push(display),
        }
    }

    report::report_start_summary(&hooked, &skipped);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn null_pointers_are_no_ops() {
        let tracker = MemoryTracker::new();
        tracker.record_allocation(0, 64);
        tracker.record_deallocation(0);
        tracker.update_allocation_size(0, 64);
        let snap = tracker.snapshot();
        assert_eq!(snap.active, 0);
        assert_eq!(snap.total_allocated, 0);
        assert_eq!(snap.total_freed, 0);
    }

    #[test]
    fn live_set_is_allocations_minus_frees() {
        let tracker = MemoryTracker::new();
        tracker.record_allocation(0x1000, 64);
        tracker.record_allocation(0x2000, 128);
        tracker.record_allocation(0x3000, 256);
        tracker.record_deallocation(0x2000);

        let snap = tracker.snapshot();
        assert_eq!(snap.active, 2);
        assert_eq!(snap.total_allocated, 448);
        assert_eq!(snap.total_freed, 128);
        let live_bytes: usize = snap.live.iter().map(|(_, info)| info.size).sum();
        assert_eq!(live_bytes, 320);
        assert_eq!(snap.total_allocated - snap.total_freed, live_bytes);
    }

    #[test]
    fn unknown_pointers_are_ignored() {
        let tracker = MemoryTracker::new();
        tracker.record_deallocation(0xdead);
        tracker.update_allocation_size(0xdead, 32);
        assert_eq!(tracker.snapshot().active, 0);
    }

    #[test]
    fn update_resizes_in_place() {
        let tracker = MemoryTracker::new();
        tracker.record_allocation(0x4000, 1024);
        tracker.update_allocation_size(0x4000, 2048);

        let snap = tracker.snapshot();
        assert_eq!(snap.active, 1);
        assert_eq!(snap.total_allocated, 2048);
        assert_eq!(snap.live[0].0, 0x4000);
        assert_eq!(snap.live[0].1.size, 2048);
    }

    #[test]
    fn same_size_update_leaves_counters_unchanged() {
        let tracker = MemoryTracker::new();
        tracker.record_allocation(0x5000, 64);
        let before = tracker.snapshot();
        tracker.update_allocation_size(0x5000, 64);
        let after = tracker.snapshot();
        assert_eq!(before.total_allocated, after.total_allocated);
        assert_eq!(before.active, after.active);
        assert_eq!(after.live[0].0, 0x5000);
    }

    #[test]
    fn stale_entry_is_overwritten() {
        let tracker = MemoryTracker::new();
        tracker.record_allocation(0x6000, 8);
        tracker.record_allocation(0x6000, 16);
        let snap = tracker.snapshot();
        // the missed free still counted once
        assert_eq!(snap.active, 2);
        assert_eq!(snap.live.len(), 1);
        assert_eq!(snap.live[0].1.size, 16);
    }

    fn live_entry(ptr: usize) -> Option<AllocationInfo> {
        memory_tracker()
            .snapshot()
            .live
            .into_iter()
            .find(|&(p, _)| p == ptr)
            .map(|(_, info)| info)
    }

    #[test]
    fn malloc_hook_records_a_leakable_block() {
        let ptr = unsafe { malloc_hook(100) };
        assert!(!ptr.is_null());
        let info = live_entry(ptr as usize).expect("block must be tracked");
        assert_eq!(info.size, 100);
        assert!(!info.stack.is_empty());

        unsafe { free_hook(ptr) };
        assert!(live_entry(ptr as usize).is_none());
    }

    #[test]
    fn realloc_hook_follows_the_block() {
        let ptr = unsafe { malloc_hook(64) };
        let moved = unsafe { realloc_hook(ptr, 1 << 20) };
        assert!(!moved.is_null());

        let info = live_entry(moved as usize).expect("resized block must be tracked");
        assert_eq!(info.size, 1 << 20);
        if moved != ptr {
            assert!(live_entry(ptr as usize).is_none());
        }
        unsafe { free_hook(moved) };
    }

    #[test]
    fn realloc_hook_from_null_is_an_allocation() {
        let ptr = unsafe { realloc_hook(std::ptr::null_mut(), 77) };
        assert!(!ptr.is_null());
        assert_eq!(live_entry(ptr as usize).unwrap().size, 77);

        // glibc realloc(p, 0) frees and returns null
        let gone = unsafe { realloc_hook(ptr, 0) };
        assert!(gone.is_null());
        assert!(live_entry(ptr as usize).is_none());
    }

    #[test]
    fn calloc_hook_tracks_total_bytes() {
        let ptr = unsafe { calloc_hook(4, 32) };
        assert!(!ptr.is_null());
        assert_eq!(live_entry(ptr as usize).unwrap().size, 128);
        unsafe { free_hook(ptr) };
    }
}
