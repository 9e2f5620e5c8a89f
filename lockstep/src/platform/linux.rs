//! POSIX real-time backend (Linux).
//!
//! Threads are created with `PTHREAD_EXPLICIT_SCHED`, so policy, priority and
//! affinity are in effect before the body runs its first instruction.

use super::{HostThread, JoinError, Platform, ThreadBody, ThreadSpec, kernel_thread_name};
use crate::error::ConfigurationError;
use crate::params::SchedPolicy;
use crate::topology::CpuTopology;
use lockstep_common::consts::PREFAULT_STACK_BYTES;
use nix::errno::Errno;
use nix::sys::mman::{MlockAllFlags, mlockall};
use std::ffi::{CString, c_void};
use std::mem::{self, MaybeUninit};
use std::ops::RangeInclusive;
use std::panic::{self, AssertUnwindSafe};
use std::ptr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

/// pthread backend with real-time attributes.
#[derive(Debug, Default, Clone, Copy)]
pub struct PosixPlatform;

impl PosixPlatform {
    pub const fn new() -> Self {
        Self
    }
}

/// Owns an initialized `pthread_attr_t` and destroys it on drop.
struct ThreadAttr(libc::pthread_attr_t);

impl ThreadAttr {
    fn new(thread: &str) -> Result<Self, ConfigurationError> {
        let mut attr = MaybeUninit::<libc::pthread_attr_t>::uninit();
        // SAFETY: pthread_attr_init initializes the storage it is given.
        let rc = unsafe { libc::pthread_attr_init(attr.as_mut_ptr()) };
        check(rc, thread)?;
        // SAFETY: initialized by the successful call above.
        Ok(Self(unsafe { attr.assume_init() }))
    }

    fn as_mut_ptr(&mut self) -> *mut libc::pthread_attr_t {
        &mut self.0
    }
}

impl Drop for ThreadAttr {
    fn drop(&mut self) {
        // SAFETY: the attribute object was initialized in `new`.
        unsafe { libc::pthread_attr_destroy(&mut self.0) };
    }
}

fn check(rc: libc::c_int, thread: &str) -> Result<(), ConfigurationError> {
    if rc == 0 {
        Ok(())
    } else {
        Err(ConfigurationError::ThreadCreate {
            thread: thread.to_owned(),
            errno: Errno::from_raw(rc),
        })
    }
}

/// Prefault stack pages (after `mlockall`, so they stay resident).
fn prefault_stack() {
    let mut buf = [0u8; PREFAULT_STACK_BYTES];
    for byte in buf.iter_mut() {
        // SAFETY: writing to a live local buffer.
        unsafe { ptr::write_volatile(byte, 0xFF) };
    }
    std::hint::black_box(&buf);
}

/// `mlockall` flags: everything mapped now and everything mapped later.
fn lock_flags() -> MlockAllFlags {
    MlockAllFlags::MCL_CURRENT | MlockAllFlags::MCL_FUTURE
}

/// Ownership handed to `thread_entry`.
struct EntryPayload {
    body: ThreadBody,
    panicked: Arc<AtomicBool>,
}

extern "C" fn thread_entry(arg: *mut c_void) -> *mut c_void {
    // SAFETY: `arg` is the `Box<EntryPayload>` leaked by `spawn`, handed over exactly once.
    let payload = unsafe { Box::from_raw(arg.cast::<EntryPayload>()) };
    let EntryPayload { body, panicked } = *payload;
    // Unwinding out of an `extern "C"` frame aborts the process.
    if panic::catch_unwind(AssertUnwindSafe(move || body())).is_err() {
        tracing::error!("real-time thread body panicked");
        panicked.store(true, Ordering::Release);
    }
    ptr::null_mut()
}

struct PosixThread {
    id: libc::pthread_t,
    joined: bool,
    panicked: Arc<AtomicBool>,
}

// SAFETY: a pthread_t is an opaque id usable from any thread.
unsafe impl Send for PosixThread {}

impl HostThread for PosixThread {
    fn join(mut self: Box<Self>) -> Result<(), JoinError> {
        // SAFETY: `id` refers to a joinable thread created by `spawn`.
        let rc = unsafe { libc::pthread_join(self.id, ptr::null_mut()) };
        self.joined = true;
        if rc != 0 {
            return Err(JoinError::Os(Errno::from_raw(rc)));
        }
        if self.panicked.load(Ordering::Acquire) {
            return Err(JoinError::Panicked);
        }
        Ok(())
    }
}

impl Drop for PosixThread {
    fn drop(&mut self) {
        if !self.joined {
            // SAFETY: never joined, so the id is still valid and joinable.
            unsafe { libc::pthread_detach(self.id) };
        }
    }
}

impl Platform for PosixPlatform {
    fn name(&self) -> &'static str {
        "posix"
    }

    fn priority_range(
        &self,
        policy: SchedPolicy,
    ) -> Result<RangeInclusive<i32>, ConfigurationError> {
        // SAFETY: plain queries without pointers.
        let (min, max) = unsafe {
            (
                libc::sched_get_priority_min(policy.as_raw()),
                libc::sched_get_priority_max(policy.as_raw()),
            )
        };
        if min == -1 || max == -1 {
            return Err(ConfigurationError::PriorityQuery {
                policy,
                errno: Errno::last(),
            });
        }
        Ok(min..=max)
    }

    fn online_cpus(&self) -> Result<Vec<usize>, ConfigurationError> {
        Ok(CpuTopology::detect()?.online().to_vec())
    }

    fn lock_memory(&self) -> Result<(), ConfigurationError> {
        mlockall(lock_flags()).map_err(ConfigurationError::MemoryLock)?;
        prefault_stack();
        tracing::info!("memory locked (MCL_CURRENT | MCL_FUTURE)");
        Ok(())
    }

    fn spawn(
        &self,
        spec: &ThreadSpec<'_>,
        body: ThreadBody,
    ) -> Result<Box<dyn HostThread>, ConfigurationError> {
        let thread = spec.name;
        let mut attr = ThreadAttr::new(thread)?;
        let param = libc::sched_param {
            sched_priority: spec.priority.priority(),
        };

        // SAFETY: `attr` is initialized and outlives every call below.
        unsafe {
            check(
                libc::pthread_attr_setstacksize(attr.as_mut_ptr(), spec.stack_size),
                thread,
            )?;
            check(
                libc::pthread_attr_setinheritsched(
                    attr.as_mut_ptr(),
                    libc::PTHREAD_EXPLICIT_SCHED,
                ),
                thread,
            )?;
            check(
                libc::pthread_attr_setschedpolicy(attr.as_mut_ptr(), spec.priority.policy().as_raw()),
                thread,
            )?;
            check(
                libc::pthread_attr_setschedparam(attr.as_mut_ptr(), &param),
                thread,
            )?;
        }

        if let Some(affinity) = spec.affinity {
            // SAFETY: cpu_set_t is a plain bitmask; all-zero is the empty set.
            let mut set: libc::cpu_set_t = unsafe { mem::zeroed() };
            for &cpu in affinity.cpus() {
                // SAFETY: CPU_SET bounds-checks against the set size.
                unsafe { libc::CPU_SET(cpu, &mut set) };
            }
            // SAFETY: `set` lives across the call; size matches its type.
            let rc = unsafe {
                libc::pthread_attr_setaffinity_np(
                    attr.as_mut_ptr(),
                    mem::size_of::<libc::cpu_set_t>(),
                    &set,
                )
            };
            check(rc, thread)?;
        }

        let panicked = Arc::new(AtomicBool::new(false));
        let payload = Box::into_raw(Box::new(EntryPayload {
            body,
            panicked: panicked.clone(),
        }));
        let mut id = MaybeUninit::<libc::pthread_t>::uninit();
        // SAFETY: `attr` is initialized, `thread_entry` takes ownership of `payload`.
        let rc = unsafe {
            libc::pthread_create(
                id.as_mut_ptr(),
                attr.as_mut_ptr(),
                thread_entry,
                payload.cast::<c_void>(),
            )
        };
        if rc != 0 {
            // SAFETY: the thread was not created, so the payload is still ours.
            drop(unsafe { Box::from_raw(payload) });
            let errno = Errno::from_raw(rc);
            return Err(if errno == Errno::EPERM {
                ConfigurationError::PrivilegeDenied {
                    thread: thread.to_owned(),
                    policy: spec.priority.policy(),
                    priority: spec.priority.priority(),
                }
            } else {
                ConfigurationError::ThreadCreate {
                    thread: thread.to_owned(),
                    errno,
                }
            });
        }
        // SAFETY: pthread_create succeeded and wrote the id.
        let id = unsafe { id.assume_init() };

        if let Ok(cname) = CString::new(kernel_thread_name(thread)) {
            // SAFETY: valid thread id and NUL-terminated name within the limit.
            let rc = unsafe { libc::pthread_setname_np(id, cname.as_ptr()) };
            if rc != 0 {
                tracing::debug!(thread, "pthread_setname_np failed: {}", Errno::from_raw(rc));
            }
        }

        Ok(Box::new(PosixThread {
            id,
            joined: false,
            panicked,
        }))
    }
}
