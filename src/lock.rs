//! Fair ticket lock with futex-assisted sleeping.
//!
//! To promote fairness under contention we hand out tickets instead of
//! letting threads race a single flag: waiters enter the critical section
//! in the exact order they asked for it. The lock is recursive (command
//! handlers re-enter via subroutines) and participates in a process-wide
//! deadlock detector.
//!
//! Layout: one packed 32-bit word holds `(active, available)` as two
//! 16-bit halves so a single atomic load observes both, plus a 32-bit
//! bitset of parked tickets. On Linux, waiters that spin too long sleep
//! on a bitset futex keyed by the packed word; elsewhere they keep
//! spinning with a pause hint.

use std::cell::{Cell, UnsafeCell};
use std::collections::HashMap;
use std::ops::{Deref, DerefMut};
use std::sync::atomic::{fence, AtomicI32, AtomicU32, AtomicU64, Ordering};
use std::sync::OnceLock;

/// Owner value while the lock is not held.
const UNLOCKED: i32 = -1;
/// Owner value after `free()`; any further operation is a bug.
const DESTROYED: i32 = -2;

/// Spin iterations between futex parks.
const SPIN_LIMIT: u32 = 1 << 20;

const ACTIVE_MASK: u32 = 0xffff;
const AVAIL_ONE: u32 = 1 << 16;

/// Process-wide count of long waits (a waiter parked on the futex).
static LONG_WAITS: AtomicU64 = AtomicU64::new(0);

/// Number of times any fair-lock waiter had to park. Monotonic.
pub fn long_wait_count() -> u64 {
    LONG_WAITS.load(Ordering::Relaxed)
}

/// Cached OS thread id. -1 is never a valid id.
pub fn current_tid() -> i32 {
    thread_local! {
        static TID: Cell<i32> = const { Cell::new(-1) };
    }
    TID.with(|t| {
        let mut tid = t.get();
        if tid == -1 {
            tid = os_tid();
            t.set(tid);
        }
        tid
    })
}

#[cfg(target_os = "linux")]
fn os_tid() -> i32 {
    // SAFETY: gettid has no memory side effects.
    unsafe { libc::syscall(libc::SYS_gettid) as i32 }
}

#[cfg(not(target_os = "linux"))]
fn os_tid() -> i32 {
    static NEXT: AtomicI32 = AtomicI32::new(1);
    NEXT.fetch_add(1, Ordering::Relaxed)
}

#[cfg(target_os = "linux")]
fn futex_wait_bitset(word: &AtomicU32, expected: u32, mask: u32) {
    // SAFETY: word points to a live 32-bit futex word for the duration of
    // the call; a spurious wake is handled by the caller's retry loop.
    unsafe {
        libc::syscall(
            libc::SYS_futex,
            word.as_ptr(),
            libc::FUTEX_WAIT_BITSET | libc::FUTEX_PRIVATE_FLAG,
            expected,
            std::ptr::null::<libc::timespec>(),
            std::ptr::null::<u32>(),
            mask,
        );
    }
}

#[cfg(target_os = "linux")]
fn futex_wake_bitset(word: &AtomicU32, mask: u32) -> i64 {
    // SAFETY: see futex_wait_bitset.
    unsafe {
        libc::syscall(
            libc::SYS_futex,
            word.as_ptr(),
            libc::FUTEX_WAKE_BITSET | libc::FUTEX_PRIVATE_FLAG,
            i32::MAX,
            std::ptr::null::<libc::timespec>(),
            std::ptr::null::<u32>(),
            mask,
        ) as i64
    }
}

/// A fair, recursive ticket lock.
///
/// `lock`/`unlock` must be paired on the same thread. After `free()` the
/// lock must not be touched again; the debug owner sentinel catches
/// unlock-after-free.
pub struct FairLock {
    /// Packed (active: low 16, available: high 16).
    ticket: AtomicU32,
    /// Bit `ticket % 32` set while that ticket's holder is parked.
    futex_bits: AtomicU32,
    /// Thread id of the holder, or `UNLOCKED`/`DESTROYED`.
    owner: AtomicI32,
    /// Recursion depth; written only by the owning thread.
    depth: AtomicU32,
}

impl FairLock {
    pub const fn new() -> FairLock {
        FairLock {
            ticket: AtomicU32::new(0),
            futex_bits: AtomicU32::new(0),
            owner: AtomicI32::new(UNLOCKED),
            depth: AtomicU32::new(0),
        }
    }

    /// Acquire the lock, blocking until it is available.
    pub fn lock(&self) {
        let tid = current_tid();
        if self.owner.load(Ordering::Acquire) == tid {
            let d = self.depth.load(Ordering::Relaxed);
            self.depth.store(d + 1, Ordering::Relaxed);
            return;
        }

        let my = (self.ticket.fetch_add(AVAIL_ONE, Ordering::Release) >> 16) as u16;
        let mut packed = self.ticket.load(Ordering::Acquire);
        if (packed & ACTIVE_MASK) as u16 != my {
            detector().register_wait(self, tid);
            let mut spins: u32 = 0;
            loop {
                packed = self.ticket.load(Ordering::Acquire);
                if (packed & ACTIVE_MASK) as u16 == my {
                    break;
                }
                std::hint::spin_loop();
                spins = spins.wrapping_add(1);
                if spins % SPIN_LIMIT == 0 {
                    #[cfg(target_os = "linux")]
                    {
                        let mask = 1u32 << (my as u32 % 32);
                        self.futex_bits.fetch_or(mask, Ordering::Acquire);
                        futex_wait_bitset(&self.ticket, packed, mask);
                        self.futex_bits.fetch_and(!mask, Ordering::Release);
                    }
                    LONG_WAITS.fetch_add(1, Ordering::Relaxed);
                }
            }
            detector().clear_wait(tid);
        }

        self.depth.store(1, Ordering::Relaxed);
        self.owner.store(tid, Ordering::Release);
        fence(Ordering::Acquire);
    }

    /// Try to acquire the lock without waiting. With `weak` the underlying
    /// compare-exchange may fail spuriously, which is cheaper on some
    /// architectures; callers in a retry loop should prefer it.
    pub fn try_lock(&self, weak: bool) -> bool {
        let tid = current_tid();
        if self.owner.load(Ordering::Acquire) == tid {
            let d = self.depth.load(Ordering::Relaxed);
            self.depth.store(d + 1, Ordering::Relaxed);
            return true;
        }

        // Cheap test before attempting the CAS.
        let packed = self.ticket.load(Ordering::Acquire);
        let active = packed & ACTIVE_MASK;
        let avail = packed >> 16;
        if active != avail {
            return false;
        }

        let next = ((avail.wrapping_add(1) & ACTIVE_MASK) << 16) | active;
        let claimed = if weak {
            self.ticket
                .compare_exchange_weak(packed, next, Ordering::Acquire, Ordering::Relaxed)
                .is_ok()
        } else {
            self.ticket
                .compare_exchange(packed, next, Ordering::Acquire, Ordering::Relaxed)
                .is_ok()
        };
        if claimed {
            self.depth.store(1, Ordering::Relaxed);
            self.owner.store(tid, Ordering::Release);
            fence(Ordering::Acquire);
        }
        claimed
    }

    /// Release the lock, or pop one level of recursion.
    pub fn unlock(&self) {
        let d = self.depth.load(Ordering::Relaxed);
        if d > 1 {
            self.depth.store(d - 1, Ordering::Relaxed);
            return;
        }
        assert!(
            self.owner.load(Ordering::Relaxed) >= 0,
            "fair lock unlocked after free or while not held"
        );
        self.depth.store(0, Ordering::Relaxed);
        self.owner.store(UNLOCKED, Ordering::Release);
        fence(Ordering::Release);

        // Publish the next ticket. `available` may move concurrently, so
        // bump the low half with a CAS loop rather than a blind add that
        // could carry into it.
        let mut packed = self.ticket.load(Ordering::Relaxed);
        let new_active = loop {
            let active = (packed & ACTIVE_MASK) as u16;
            let bumped = active.wrapping_add(1);
            let next = (packed & !ACTIVE_MASK) | bumped as u32;
            match self.ticket.compare_exchange_weak(
                packed,
                next,
                Ordering::Release,
                Ordering::Relaxed,
            ) {
                Ok(_) => break bumped,
                Err(cur) => packed = cur,
            }
        };

        #[cfg(target_os = "linux")]
        self.wake_next(new_active);
        #[cfg(not(target_os = "linux"))]
        let _ = new_active;
    }

    #[cfg(target_os = "linux")]
    fn wake_next(&self, active: u16) {
        let mask = 1u32 << (active as u32 % 32);
        if self.futex_bits.load(Ordering::Relaxed) & mask == 0 {
            return;
        }
        loop {
            if self.futex_bits.load(Ordering::Acquire) & mask == 0 {
                break;
            }
            if futex_wake_bitset(&self.ticket, mask) == 1 {
                break;
            }
        }
    }

    /// Release all recursion levels at once, returning the saved depth
    /// for a later `lock_recursive`.
    pub fn unlock_recursive(&self) -> u32 {
        let d = self.depth.load(Ordering::Relaxed);
        self.depth.store(1, Ordering::Relaxed);
        self.unlock();
        d
    }

    /// Re-acquire and restore a depth saved by `unlock_recursive`.
    pub fn lock_recursive(&self, depth: u32) {
        self.lock();
        self.depth.store(depth, Ordering::Relaxed);
    }

    /// Does the calling thread hold this lock?
    pub fn owned(&self) -> bool {
        self.owner.load(Ordering::Relaxed) == current_tid()
    }

    /// Mark the lock destroyed. The lock must be unlocked, or held by the
    /// caller with nobody else waiting.
    pub fn free(&self) {
        let packed = self.ticket.load(Ordering::Relaxed);
        let active = packed & ACTIVE_MASK;
        let avail = packed >> 16;
        assert!(
            active == avail || (self.owned() && active == avail.wrapping_sub(1) & ACTIVE_MASK),
            "fair lock freed while contended"
        );
        self.owner.store(DESTROYED, Ordering::Release);
    }

    pub(crate) fn recursion_depth(&self) -> u32 {
        self.depth.load(Ordering::Relaxed)
    }

    #[cfg(test)]
    fn counts(&self) -> (u16, u16) {
        let packed = self.ticket.load(Ordering::Acquire);
        ((packed & ACTIVE_MASK) as u16, (packed >> 16) as u16)
    }
}

impl Default for FairLock {
    fn default() -> Self {
        FairLock::new()
    }
}

/* ---------------------------------------------------------------------------
 * Deadlock detector
 * ------------------------------------------------------------------------ */

/// Map from waiting thread to the lock it waits on, walked on every
/// registration to find cycles through lock owners. The detector's own
/// lock never registers itself.
struct DeadlockDetector {
    lock: FairLock,
    waits: UnsafeCell<HashMap<i32, *const FairLock>>,
}

// SAFETY: `waits` is only touched with `lock` held, and the raw pointers
// stored in it are kept live by their registered waiters.
unsafe impl Send for DeadlockDetector {}
unsafe impl Sync for DeadlockDetector {}

impl DeadlockDetector {
    fn register_wait(&self, waiting_on: &FairLock, tid: i32) {
        if std::ptr::eq(waiting_on, &self.lock) {
            return;
        }
        self.lock.lock();
        let mut cycle = false;
        {
            // SAFETY: detector lock held.
            let waits = unsafe { &mut *self.waits.get() };
            waits.insert(tid, waiting_on as *const FairLock);

            let mut check = tid;
            loop {
                let Some(&held) = waits.get(&check) else {
                    break;
                };
                // SAFETY: a registered lock outlives its wait entry.
                check = unsafe { (*held).owner.load(Ordering::Relaxed) };
                if check == tid {
                    cycle = true;
                    break;
                }
            }
        }
        self.lock.unlock();
        if cycle {
            panic!("deadlock detected: lock cycle across threads");
        }
    }

    fn clear_wait(&self, tid: i32) {
        self.lock.lock();
        // SAFETY: detector lock held.
        unsafe { &mut *self.waits.get() }.remove(&tid);
        self.lock.unlock();
    }
}

fn detector() -> &'static DeadlockDetector {
    static DETECTOR: OnceLock<DeadlockDetector> = OnceLock::new();
    DETECTOR.get_or_init(|| DeadlockDetector {
        lock: FairLock::new(),
        waits: UnsafeCell::new(HashMap::new()),
    })
}

/* ---------------------------------------------------------------------------
 * FairMutex: data guarded by a FairLock
 * ------------------------------------------------------------------------ */

/// A value guarded by a [`FairLock`], with a scoped guard.
///
/// Unlike the raw lock this wrapper is not reentrant: handing out a second
/// `&mut T` on the same thread would alias. Nested acquisition is a bug
/// and trips a debug assertion.
pub struct FairMutex<T> {
    raw: FairLock,
    value: UnsafeCell<T>,
}

// SAFETY: the guard grants exclusive access to T.
unsafe impl<T: Send> Send for FairMutex<T> {}
unsafe impl<T: Send> Sync for FairMutex<T> {}

impl<T> FairMutex<T> {
    pub const fn new(value: T) -> FairMutex<T> {
        FairMutex {
            raw: FairLock::new(),
            value: UnsafeCell::new(value),
        }
    }

    pub fn lock(&self) -> FairMutexGuard<'_, T> {
        self.raw.lock();
        debug_assert_eq!(self.raw.recursion_depth(), 1, "FairMutex is not reentrant");
        FairMutexGuard { owner: self }
    }

    pub fn try_lock(&self) -> Option<FairMutexGuard<'_, T>> {
        if self.raw.owned() {
            return None;
        }
        if self.raw.try_lock(false) {
            Some(FairMutexGuard { owner: self })
        } else {
            None
        }
    }

    /// The underlying raw lock, for ownership assertions.
    pub fn raw(&self) -> &FairLock {
        &self.raw
    }
}

pub struct FairMutexGuard<'a, T> {
    owner: &'a FairMutex<T>,
}

impl<T> Deref for FairMutexGuard<'_, T> {
    type Target = T;
    fn deref(&self) -> &T {
        // SAFETY: the lock is held for the guard's lifetime.
        unsafe { &*self.owner.value.get() }
    }
}

impl<T> DerefMut for FairMutexGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        // SAFETY: the lock is held for the guard's lifetime.
        unsafe { &mut *self.owner.value.get() }
    }
}

impl<T> Drop for FairMutexGuard<'_, T> {
    fn drop(&mut self) {
        self.owner.raw.unlock();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicBool;
    use std::sync::{Arc, Mutex};
    use std::thread;
    use std::time::Duration;

    #[test]
    fn lock_basic() {
        let lock = FairLock::new();
        lock.lock();
        assert!(lock.owned());
        lock.unlock();
        assert!(!lock.owned());
    }

    #[test]
    fn recursion_depth_restored() {
        let lock = FairLock::new();
        lock.lock();
        lock.lock();
        lock.lock();
        assert_eq!(lock.recursion_depth(), 3);
        lock.unlock();
        assert_eq!(lock.recursion_depth(), 2);
        assert!(lock.owned());
        let saved = lock.unlock_recursive();
        assert_eq!(saved, 2);
        assert!(!lock.owned());
        lock.lock_recursive(saved);
        assert_eq!(lock.recursion_depth(), 2);
        lock.unlock();
        lock.unlock();
    }

    #[test]
    fn try_lock_contended() {
        let lock = Arc::new(FairLock::new());
        lock.lock();

        let l2 = Arc::clone(&lock);
        let h = thread::spawn(move || l2.try_lock(false));
        assert!(!h.join().unwrap());

        lock.unlock();
        let l3 = Arc::clone(&lock);
        let h = thread::spawn(move || {
            let ok = l3.try_lock(false);
            if ok {
                l3.unlock();
            }
            ok
        });
        assert!(h.join().unwrap());
    }

    #[test]
    fn fifo_ordering() {
        // Admit waiters one at a time, observing the available counter so
        // the arrival order at fetch_add is the spawn order.
        const WAITERS: u16 = 8;
        let lock = Arc::new(FairLock::new());
        let order = Arc::new(Mutex::new(Vec::new()));

        lock.lock();
        let mut handles = Vec::new();
        for i in 0..WAITERS {
            let lock_clone = Arc::clone(&lock);
            let order = Arc::clone(&order);
            handles.push(thread::spawn(move || {
                lock_clone.lock();
                order.lock().unwrap().push(i);
                lock_clone.unlock();
            }));
            // Wait until this thread has drawn its ticket.
            while lock.counts().1 != i + 2 {
                std::hint::spin_loop();
            }
        }
        lock.unlock();
        for h in handles {
            h.join().unwrap();
        }

        let order = order.lock().unwrap();
        assert_eq!(*order, (0..WAITERS).collect::<Vec<_>>());
    }

    #[test]
    fn mutual_exclusion() {
        let lock = Arc::new(FairLock::new());
        let inside = Arc::new(AtomicBool::new(false));
        let mut handles = Vec::new();
        for _ in 0..4 {
            let lock = Arc::clone(&lock);
            let inside = Arc::clone(&inside);
            handles.push(thread::spawn(move || {
                for _ in 0..1000 {
                    lock.lock();
                    assert!(!inside.swap(true, Ordering::SeqCst));
                    assert!(lock.owned());
                    inside.store(false, Ordering::SeqCst);
                    lock.unlock();
                }
            }));
        }
        for h in handles {
            h.join().unwrap();
        }
    }

    #[test]
    fn deadlock_detected() {
        use std::panic::{catch_unwind, AssertUnwindSafe};
        use std::sync::mpsc;

        let a = Arc::new(FairLock::new());
        let b = Arc::new(FairLock::new());
        let (tx, rx) = mpsc::channel();

        // Whichever thread closes the cycle panics in register_wait; the
        // other stays parked forever, so neither thread is joined.
        let (a1, b1, tx1) = (Arc::clone(&a), Arc::clone(&b), tx.clone());
        thread::spawn(move || {
            a1.lock();
            thread::sleep(Duration::from_millis(100));
            if catch_unwind(AssertUnwindSafe(|| b1.lock())).is_err() {
                tx1.send(()).ok();
            }
        });
        thread::sleep(Duration::from_millis(30));
        let (a2, b2) = (Arc::clone(&a), Arc::clone(&b));
        thread::spawn(move || {
            b2.lock();
            thread::sleep(Duration::from_millis(100));
            if catch_unwind(AssertUnwindSafe(|| a2.lock())).is_err() {
                tx.send(()).ok();
            }
        });

        rx.recv_timeout(Duration::from_secs(10))
            .expect("no deadlock detected within the bound");
    }

    #[test]
    fn long_wait_counter_is_monotonic() {
        let before = long_wait_count();
        let lock = Arc::new(FairLock::new());
        lock.lock();
        let l2 = Arc::clone(&lock);
        let h = thread::spawn(move || {
            l2.lock();
            l2.unlock();
        });
        // Hold long enough that the waiter spins past the park threshold.
        thread::sleep(Duration::from_millis(200));
        lock.unlock();
        h.join().unwrap();
        assert!(long_wait_count() >= before);
    }

    #[test]
    fn fair_mutex_guard() {
        let m = Arc::new(FairMutex::new(0u64));
        let mut handles = Vec::new();
        for _ in 0..4 {
            let m = Arc::clone(&m);
            handles.push(thread::spawn(move || {
                for _ in 0..1000 {
                    *m.lock() += 1;
                }
            }));
        }
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(*m.lock(), 4000);
    }
}
