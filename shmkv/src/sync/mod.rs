use std::io;
use std::ptr;

use crate::errors::StoreError;

/// Process-shared binary semaphore living inside the mapped segment.
/// Waits block without timeout; `EINTR` is retried.
pub(crate) struct Semaphore {
    sem: *mut libc::sem_t,
}

impl Semaphore {
    /// Initializes the semaphore bytes at `sem` for cross-process use.
    /// Must run exactly once per segment lifetime, before any attacher
    /// touches the gate.
    pub unsafe fn init(sem: *mut libc::sem_t, value: u32) -> Result<(), StoreError> {
        if libc::sem_init(sem, 1, value) != 0 {
            return Err(StoreError::Semaphore(io::Error::last_os_error()));
        }
        Ok(())
    }

    /// Binds to an already-initialized semaphore inside the mapping.
    /// `sem` must stay mapped for the lifetime of the handle.
    pub unsafe fn attach(sem: *mut libc::sem_t) -> Semaphore {
        Semaphore { sem }
    }

    pub fn wait(&self) -> Result<(), StoreError> {
        loop {
            if unsafe { libc::sem_wait(self.sem) } == 0 {
                return Ok(());
            }
            let err = io::Error::last_os_error();
            if err.raw_os_error() != Some(libc::EINTR) {
                return Err(StoreError::Semaphore(err));
            }
        }
    }

    pub fn post(&self) -> Result<(), StoreError> {
        if unsafe { libc::sem_post(self.sem) } != 0 {
            return Err(StoreError::Semaphore(io::Error::last_os_error()));
        }
        Ok(())
    }

    /// Teardown only. Any process still blocked on the gate afterwards
    /// is the deleting caller's contract violation.
    pub unsafe fn destroy(&self) {
        libc::sem_destroy(self.sem);
    }
}

/// Reader-preference reader/writer lock over one pod, built from the
/// pod's two embedded semaphores.
///
/// The read gate only guards the reader counter. The write gate is held
/// either by one writer or collectively by the reader cohort: the first
/// reader in takes it, the last reader out posts it, so the posting
/// process can differ from the acquiring one. A continuous stream of
/// overlapping readers therefore keeps a writer waiting indefinitely;
/// that trade-off is kept on purpose.
pub(crate) struct PodLock {
    read_gate: Semaphore,
    write_gate: Semaphore,
    num_readers: *mut u32,
}

impl PodLock {
    /// Both gates must already be initialized and `num_readers` must
    /// point into the same pod's header.
    pub unsafe fn attach(
        read_gate: *mut libc::sem_t,
        write_gate: *mut libc::sem_t,
        num_readers: *mut u32,
    ) -> PodLock {
        PodLock {
            read_gate: Semaphore::attach(read_gate),
            write_gate: Semaphore::attach(write_gate),
            num_readers,
        }
    }

    fn acquire_read(&self) -> Result<(), StoreError> {
        self.read_gate.wait()?;
        let readers = unsafe { ptr::read(self.num_readers) } + 1;
        unsafe { ptr::write(self.num_readers, readers) };
        if readers == 1 {
            if let Err(e) = self.write_gate.wait() {
                unsafe { ptr::write(self.num_readers, 0) };
                let _ = self.read_gate.post();
                return Err(e);
            }
        }
        self.read_gate.post()
    }

    fn release_read(&self) -> Result<(), StoreError> {
        self.read_gate.wait()?;
        let readers = unsafe { ptr::read(self.num_readers) } - 1;
        unsafe { ptr::write(self.num_readers, readers) };
        let handed_off = if readers == 0 {
            self.write_gate.post()
        } else {
            Ok(())
        };
        self.read_gate.post()?;
        handed_off
    }

    fn acquire_write(&self) -> Result<(), StoreError> {
        self.write_gate.wait()
    }

    fn release_write(&self) -> Result<(), StoreError> {
        self.write_gate.post()
    }

    /// Runs `f` with the pod locked for shared reading.
    pub fn with_read<R, F>(&self, f: F) -> Result<R, StoreError>
    where
        F: FnOnce() -> R,
    {
        self.acquire_read()?;
        let out = f();
        self.release_read()?;
        Ok(out)
    }

    /// Runs `f` with the pod locked exclusively.
    pub fn with_write<R, F>(&self, f: F) -> Result<R, StoreError>
    where
        F: FnOnce() -> R,
    {
        self.acquire_write()?;
        let out = f();
        self.release_write()?;
        Ok(out)
    }

    /// Teardown only; see `Semaphore::destroy`.
    pub unsafe fn destroy(&self) {
        self.read_gate.destroy();
        self.write_gate.destroy();
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
    use std::sync::Arc;
    use std::thread;
    use std::time::Duration;

    use super::*;

    #[repr(C)]
    struct Gates {
        read_gate: libc::sem_t,
        write_gate: libc::sem_t,
        num_readers: u32,
    }

    // The gates have to outlive every thread of the test, so they are
    // leaked and handed around as a plain address.
    fn leaked_gates() -> usize {
        let gates: &'static mut Gates = Box::leak(Box::new(unsafe { std::mem::zeroed() }));
        unsafe {
            Semaphore::init(ptr::addr_of_mut!(gates.read_gate), 1).unwrap();
            Semaphore::init(ptr::addr_of_mut!(gates.write_gate), 1).unwrap();
        }
        gates as *mut Gates as usize
    }

    unsafe fn lock_at(addr: usize) -> PodLock {
        let gates = addr as *mut Gates;
        PodLock::attach(
            ptr::addr_of_mut!((*gates).read_gate),
            ptr::addr_of_mut!((*gates).write_gate),
            ptr::addr_of_mut!((*gates).num_readers),
        )
    }

    #[test]
    fn readers_overlap() {
        let addr = leaked_gates();
        let active = Arc::new(AtomicU32::new(0));
        let peak = Arc::new(AtomicU32::new(0));

        let mut handles = Vec::new();
        for _ in 0..4 {
            let active = Arc::clone(&active);
            let peak = Arc::clone(&peak);
            handles.push(thread::spawn(move || {
                let lock = unsafe { lock_at(addr) };
                lock.acquire_read().unwrap();
                let now = active.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(now, Ordering::SeqCst);
                thread::sleep(Duration::from_millis(50));
                active.fetch_sub(1, Ordering::SeqCst);
                lock.release_read().unwrap();
            }));
        }
        for handle in handles {
            handle.join().unwrap();
        }
        assert!(peak.load(Ordering::SeqCst) >= 2, "readers never overlapped");
    }

    #[test]
    fn writer_waits_until_last_reader_leaves() {
        let addr = leaked_gates();
        let reader = unsafe { lock_at(addr) };
        reader.acquire_read().unwrap();

        let entered = Arc::new(AtomicBool::new(false));
        let writer = {
            let entered = Arc::clone(&entered);
            thread::spawn(move || {
                let lock = unsafe { lock_at(addr) };
                lock.acquire_write().unwrap();
                entered.store(true, Ordering::SeqCst);
                lock.release_write().unwrap();
            })
        };

        thread::sleep(Duration::from_millis(100));
        assert!(
            !entered.load(Ordering::SeqCst),
            "writer got in while a reader was active"
        );

        reader.release_read().unwrap();
        writer.join().unwrap();
        assert!(entered.load(Ordering::SeqCst));
    }

    #[test]
    fn reader_waits_for_active_writer() {
        let addr = leaked_gates();
        let writer = unsafe { lock_at(addr) };
        writer.acquire_write().unwrap();

        let entered = Arc::new(AtomicBool::new(false));
        let reader = {
            let entered = Arc::clone(&entered);
            thread::spawn(move || {
                let lock = unsafe { lock_at(addr) };
                lock.acquire_read().unwrap();
                entered.store(true, Ordering::SeqCst);
                lock.release_read().unwrap();
            })
        };

        thread::sleep(Duration::from_millis(100));
        assert!(
            !entered.load(Ordering::SeqCst),
            "reader got in while a writer was active"
        );

        writer.release_write().unwrap();
        reader.join().unwrap();
        assert!(entered.load(Ordering::SeqCst));
    }
}
