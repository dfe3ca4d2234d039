//! Lock tracking and deadlock detection over `pthread_mutex_t`
//! acquire-intent / acquire-success / release events.

use std::collections::{HashMap, HashSet};
use std::mem;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

use libc::{c_int, c_void, pthread_mutex_t, pthread_t};

use crate::patch::PltPatcher;
use crate::report;
use crate::stack::CallStack;

struct LockInfo {
    owner: pthread_t,
    stack: CallStack,
    waiting_for: HashSet<usize>,
    acquired: bool,
}

impl LockInfo {
    fn pending(stack: CallStack) -> Self {
        LockInfo {
            owner: 0,
            stack,
            waiting_for: HashSet::new(),
            acquired: false,
        }
    }
}

#[derive(Default)]
struct ThreadInfo {
    held: Vec<usize>,
    waiting: Vec<usize>,
}

#[derive(Default)]
struct LockState {
    active: HashMap<usize, LockInfo>,
    threads: HashMap<pthread_t, ThreadInfo>,
    cycles: Vec<DeadlockCycle>,
}

/// Reporter-facing copy of one lock record. `waiting_for` pairs each
/// waited address with its owner, when the record still exists.
#[derive(Clone)]
pub struct LockRecordView {
    pub addr: usize,
    pub owner: pthread_t,
    pub stack: CallStack,
    pub waiting_for: Vec<(usize, Option<pthread_t>)>,
    pub acquired: bool,
}

#[derive(Clone)]
pub struct ThreadView {
    pub thread: pthread_t,
    pub held: Vec<usize>,
    pub waiting: Vec<(usize, Option<pthread_t>)>,
}

/// A wait-for cycle, as the chain of lock records the depth-first
/// search walked through; the final entry closes the loop.
#[derive(Clone)]
pub struct DeadlockCycle {
    pub chain: Vec<LockRecordView>,
}

pub struct LockSnapshot {
    pub locks: Vec<LockRecordView>,
    pub threads: Vec<ThreadView>,
    pub cycles: Vec<DeadlockCycle>,
}

/// Active-lock and per-thread maps, guarded by one mutex. The guard is
/// never held across a call into a patched primitive; the real lock
/// call happens between the intent and success notifications.
pub struct LockTracker {
    state: Mutex<LockState>,
}

impl LockTracker {
    pub fn new() -> Self {
        LockTracker {
            state: Mutex::new(LockState::default()),
        }
    }

    pub fn record_acquire_intent(&self, mutex: usize) {
        self.acquire_intent_as(mutex, unsafe { libc::pthread_self() });
    }

    pub fn record_acquired(&self, mutex: usize) {
        self.acquired_as(mutex, unsafe { libc::pthread_self() });
    }

    pub fn record_release(&self, mutex: usize) {
        self.release_as(mutex, unsafe { libc::pthread_self() });
    }

    /// A thread is about to block on `mutex`. If the mutex is held by
    /// another thread, record the wait edges and search for a cycle;
    /// if the mutex is unknown, create its intent record.
    fn acquire_intent_as(&self, mutex: usize, thread: pthread_t) {
        if mutex == 0 {
            return;
        }
        let stack = CallStack::capture();
        let mut guard = match self.state.lock() {
            Ok(guard) => guard,
            Err(_) => return,
        };
        let state = &mut *guard;

        match state.active.get(&mutex) {
            Some(info) if info.acquired && info.owner != thread => {
                let thread_info = state.threads.entry(thread).or_default();
                thread_info.waiting.push(mutex);
                let held = thread_info.held.clone();
                for held_lock in held {
                    if let Some(held_info) = state.active.get_mut(&held_lock) {
                        held_info.waiting_for.insert(mutex);
                    }
                }
                if let Some(chain) = detect_deadlock(&state.active, mutex, thread) {
                    let cycle = DeadlockCycle {
                        chain: chain
                            .iter()
                            .map(|&(addr, _)| lock_view(&state.active, addr))
                            .collect(),
                    };
                    report::emit_deadlock(&cycle);
                    state.cycles.push(cycle);
                }
            }
            Some(_) => {}
            None => {
                state.active.insert(mutex, LockInfo::pending(stack));
            }
        }
    }

    /// The real lock call returned success: `mutex` now belongs to
    /// `thread`.
    fn acquired_as(&self, mutex: usize, thread: pthread_t) {
        if mutex == 0 {
            return;
        }
        let stack = CallStack::capture();
        let mut guard = match self.state.lock() {
            Ok(guard) => guard,
            Err(_) => return,
        };
        let state = &mut *guard;

        let info = state
            .active
            .entry(mutex)
            .or_insert_with(|| LockInfo::pending(stack));
        info.owner = thread;
        info.acquired = true;

        let thread_info = state.threads.entry(thread).or_default();
        thread_info.held.push(mutex);
        thread_info.waiting.retain(|&waited| waited != mutex);
    }

    /// Release erases the lock record; edges pointing at it dangle and
    /// are skipped by the search. Thread records are dropped once both
    /// their lists are empty.
    fn release_as(&self, mutex: usize, thread: pthread_t) {
        if mutex == 0 {
            return;
        }
        let mut guard = match self.state.lock() {
            Ok(guard) => guard,
            Err(_) => return,
        };
        let state = &mut *guard;

        state.active.remove(&mutex);
        let drop_thread = match state.threads.get_mut(&thread) {
            Some(thread_info) => {
                thread_info.held.retain(|&held| held != mutex);
                thread_info.held.is_empty() && thread_info.waiting.is_empty()
            }
            None => false,
        };
        if drop_thread {
            state.threads.remove(&thread);
        }
    }

    pub fn snapshot(&self) -> LockSnapshot {
        let state = self.state.lock().unwrap();
        LockSnapshot {
            locks: state
                .active
                .keys()
                .map(|&addr| lock_view(&state.active, addr))
                .collect(),
            threads: state
                .threads
                .iter()
                .map(|(&thread, info)| ThreadView {
                    thread,
                    held: info.held.clone(),
                    waiting: info
                        .waiting
                        .iter()
                        .map(|&waited| (waited, owner_of(&state.active, waited)))
                        .collect(),
                })
                .collect(),
            cycles: state.cycles.clone(),
        }
    }
}

fn owner_of(active: &HashMap<usize, LockInfo>, addr: usize) -> Option<pthread_t> {
    active.get(&addr).map(|info| info.owner)
}

fn lock_view(active: &HashMap<usize, LockInfo>, addr: usize) -> LockRecordView {
    match active.get(&addr) {
        Some(info) => LockRecordView {
            addr,
            owner: info.owner,
            stack: info.stack.clone(),
            waiting_for: info
                .waiting_for
                .iter()
                .map(|&waited| (waited, owner_of(active, waited)))
                .collect(),
            acquired: info.acquired,
        },
        None => LockRecordView {
            addr,
            owner: 0,
            stack: CallStack::default(),
            waiting_for: Vec::new(),
            acquired: false,
        },
    }
}

/// Depth-first search over the wait-for graph, rooted at the would-be
/// waiter. Re-visiting a thread on the current path is a cycle; the
/// re-entered pair is appended to close the chain. Edges to released
/// locks are skipped.
fn detect_deadlock(
    active: &HashMap<usize, LockInfo>,
    mutex: usize,
    thread: pthread_t,
) -> Option<Vec<(usize, pthread_t)>> {
    let mut visited = HashSet::new();
    let mut chain = Vec::new();
    if walk(active, mutex, thread, &mut visited, &mut chain) {
        Some(chain)
    } else {
        None
    }
}

fn walk(
    active: &HashMap<usize, LockInfo>,
    lock: usize,
    thread: pthread_t,
    visited: &mut HashSet<pthread_t>,
    chain: &mut Vec<(usize, pthread_t)>,
) -> bool {
    if visited.contains(&thread) {
        chain.push((lock, thread));
        return true;
    }
    visited.insert(thread);
    chain.push((lock, thread));

    if let Some(info) = active.get(&lock) {
        for &waited in info.waiting_for.iter() {
            if let Some(waited_info) = active.get(&waited) {
                if walk(active, waited, waited_info.owner, visited, chain) {
                    return true;
                }
            }
        }
    }

    visited.remove(&thread);
    chain.pop();
    false
}

lazy_static! {
    static ref LOCK_TRACKER: LockTracker = LockTracker::new();
}

/// The process-wide lock tracker.
pub fn lock_tracker() -> &'static LockTracker {
    &LOCK_TRACKER
}

type PthreadMutexFn = unsafe extern "C" fn(*mut pthread_mutex_t) -> c_int;

// Originally-resolved pthread entry points, captured at patch time. A
// zero slot (before Start, or after a failed patch) falls back to the
// direct libc symbol, which resolves through the detector's own PLT.
static ORIG_MUTEX_LOCK: AtomicUsize = AtomicUsize::new(0);
static ORIG_MUTEX_UNLOCK: AtomicUsize = AtomicUsize::new(0);
static ORIG_MUTEX_TRYLOCK: AtomicUsize = AtomicUsize::new(0);

unsafe fn forward(
    slot: &AtomicUsize,
    fallback: PthreadMutexFn,
    mutex: *mut pthread_mutex_t,
) -> c_int {
    match slot.load(Ordering::Acquire) {
        0 => fallback(mutex),
        addr => mem::transmute::<usize, PthreadMutexFn>(addr)(mutex),
    }
}

pub unsafe extern "C" fn pthread_mutex_lock_hook(mutex: *mut pthread_mutex_t) -> c_int {
    lock_tracker().record_acquire_intent(mutex as usize);
    let rc = forward(&ORIG_MUTEX_LOCK, libc::pthread_mutex_lock, mutex);
    if rc == 0 {
        lock_tracker().record_acquired(mutex as usize);
    }
    rc
}

/// Release is recorded before forwarding so the record is gone before
/// another thread can re-acquire.
pub unsafe extern "C" fn pthread_mutex_unlock_hook(mutex: *mut pthread_mutex_t) -> c_int {
    lock_tracker().record_release(mutex as usize);
    forward(&ORIG_MUTEX_UNLOCK, libc::pthread_mutex_unlock, mutex)
}

/// Trylock never waits, so it cannot be the contended edge: only the
/// successful acquire is recorded.
pub unsafe extern "C" fn pthread_mutex_trylock_hook(mutex: *mut pthread_mutex_t) -> c_int {
    let rc = forward(&ORIG_MUTEX_TRYLOCK, libc::pthread_mutex_trylock, mutex);
    if rc == 0 {
        lock_tracker().record_acquired(mutex as usize);
    }
    rc
}

#[derive(Default)]
pub struct LockDetect {
    targets: Mutex<Vec<Option<String>>>,
}

lazy_static! {
    static ref LOCK_DETECT: LockDetect = LockDetect::default();
}

pub fn lock_detect() -> &'static LockDetect {
    &LOCK_DETECT
}

impl LockDetect {
    pub fn register(&self, path: &str) {
        self.targets.lock().unwrap().push(Some(path.to_string()));
    }

    pub fn register_main(&self) {
        self.targets.lock().unwrap().push(None);
    }

    /// Patch the mutex symbols of every registered object. Lock and
    /// unlock are mandatory; trylock is optional.
    pub fn start(&self) {
        for target in self.targets.lock().unwrap().iter() {
            let label = target.as_deref().unwrap_or("<main>");
            let patcher = match PltPatcher::for_object(target.as_deref()) {
                Ok(patcher) => patcher,
                Err(err) => {
                    log::error!("lock hooks: cannot inspect {}: {}", label, err);
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

    match patcher.replace_function("pthread_mutex_lock", pthread_mutex_lock_hook as *const c_void)
    {
        Ok(orig) => {
            ORIG_MUTEX_LOCK.store(orig as usize, Ordering::Release);
            hooked.push("pthread_mutex_lock");
        }
        Err(err) => log::error!("{}: failed to hook pthread_mutex_lock: {}", label, err),
    }
    match patcher
        .replace_function("pthread_mutex_unlock", pthread_mutex_unlock_hook as *const c_void)
    {
        Ok(orig) => {
            ORIG_MUTEX_UNLOCK.store(orig as usize, Ordering::Release);
            hooked.push("pthread_mutex_unlock");
        }
        Err(err) => log::error!("{}: failed to hook pthread_mutex_unlock: {}", label, err),
    }
    match patcher
        .replace_function("pthread_mutex_trylock", pthread_mutex_trylock_hook as *const c_void)
    {
        Ok(orig) => {
            ORIG_MUTEX_TRYLOCK.store(orig as usize, Ordering::Release);
            hooked.push("pthread_mutex_trylock");
        }
        Err(_) => skipped.push("pthread_mutex_trylock"),
    }

    report::report_start_summary(&hooked, &skipped);
}

#[cfg(test)]
mod tests {
    use super::*;

    const MUTEX_A: usize = 0xa000;
    const MUTEX_B: usize = 0xb000;
    const T1: pthread_t = 1;
    const T2: pthread_t = 2;

    #[test]
    fn opposite_order_produces_a_cycle_of_two() {
        let tracker = LockTracker::new();
        tracker.acquire_intent_as(MUTEX_A, T1);
        tracker.acquired_as(MUTEX_A, T1);
        tracker.acquire_intent_as(MUTEX_B, T2);
        tracker.acquired_as(MUTEX_B, T2);

        // T1 blocks on B: edge A -> B, no cycle yet
        tracker.acquire_intent_as(MUTEX_B, T1);
        assert!(tracker.snapshot().cycles.is_empty());

        // T2 blocks on A: edge B -> A closes the loop
        tracker.acquire_intent_as(MUTEX_A, T2);
        let snap = tracker.snapshot();
        assert_eq!(snap.cycles.len(), 1);

        let chain = &snap.cycles[0].chain;
        let addrs: HashSet<usize> = chain.iter().map(|view| view.addr).collect();
        assert!(addrs.contains(&MUTEX_A));
        assert!(addrs.contains(&MUTEX_B));
        let owners: HashSet<pthread_t> = chain.iter().map(|view| view.owner).collect();
        assert!(owners.contains(&T1));
        assert!(owners.contains(&T2));
    }

    #[test]
    fn same_order_is_clean_and_state_drains() {
        let tracker = LockTracker::new();

        tracker.acquire_intent_as(MUTEX_A, T1);
        tracker.acquired_as(MUTEX_A, T1);
        // T2 contends on A without holding anything
        tracker.acquire_intent_as(MUTEX_A, T2);
        tracker.acquire_intent_as(MUTEX_B, T1);
        tracker.acquired_as(MUTEX_B, T1);
        tracker.release_as(MUTEX_B, T1);
        tracker.release_as(MUTEX_A, T1);

        tracker.acquired_as(MUTEX_A, T2);
        tracker.acquire_intent_as(MUTEX_B, T2);
        tracker.acquired_as(MUTEX_B, T2);
        tracker.release_as(MUTEX_B, T2);
        tracker.release_as(MUTEX_A, T2);

        let snap = tracker.snapshot();
        assert!(snap.cycles.is_empty());
        assert!(snap.locks.is_empty());
        assert!(snap.threads.is_empty());
    }

    #[test]
    fn intent_without_success_stays_recorded() {
        let tracker = LockTracker::new();
        tracker.acquire_intent_as(MUTEX_A, T1);

        let snap = tracker.snapshot();
        assert_eq!(snap.locks.len(), 1);
        assert_eq!(snap.locks[0].addr, MUTEX_A);
        assert!(!snap.locks[0].acquired);
    }

    #[test]
    fn dangling_edges_are_skipped() {
        let tracker = LockTracker::new();
        tracker.acquire_intent_as(MUTEX_A, T1);
        tracker.acquired_as(MUTEX_A, T1);
        tracker.acquire_intent_as(MUTEX_B, T2);
        tracker.acquired_as(MUTEX_B, T2);

        // edge A -> B, then B disappears
        tracker.acquire_intent_as(MUTEX_B, T1);
        tracker.release_as(MUTEX_B, T2);

        // the search crosses the dangling edge without reporting
        tracker.acquire_intent_as(MUTEX_A, T2);
        assert!(tracker.snapshot().cycles.is_empty());
    }

    #[test]
    fn recursive_relock_by_owner_is_not_contention() {
        let tracker = LockTracker::new();
        tracker.acquire_intent_as(MUTEX_A, T1);
        tracker.acquired_as(MUTEX_A, T1);
        tracker.acquire_intent_as(MUTEX_A, T1);

        let snap = tracker.snapshot();
        assert!(snap.cycles.is_empty());
        assert!(snap.threads.iter().all(|t| t.waiting.is_empty()));
    }

    #[test]
    fn release_drops_idle_thread_records() {
        let tracker = LockTracker::new();
        tracker.acquire_intent_as(MUTEX_A, T1);
        tracker.acquired_as(MUTEX_A, T1);
        assert_eq!(tracker.snapshot().threads.len(), 1);
        tracker.release_as(MUTEX_A, T1);
        assert!(tracker.snapshot().threads.is_empty());
    }
}
