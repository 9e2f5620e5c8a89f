//! Real-time thread handle.
//!
//! Wraps one platform thread with its priority, affinity and a cooperative
//! stop flag. The owner (the scheduler) is the only writer of the lifecycle
//! state; threads are never killed, only asked to stop and joined.

use crate::error::{SchedulerError, SchedulerResult};
use crate::params::PriorityParameters;
use crate::platform::{HostThread, Platform, ThreadSpec};
use crate::topology::CpuAffinity;
use lockstep_common::consts::DEFAULT_STACK_SIZE;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

/// Lifecycle of a [`RealtimeThread`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThreadState {
    Created,
    Running,
    Stopping,
    Terminated,
}

impl fmt::Display for ThreadState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Cooperative cancellation flag handed to a thread body.
#[derive(Debug, Clone, Default)]
pub struct StopToken(Arc<AtomicBool>);

impl StopToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_stop_requested(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }

    pub fn request_stop(&self) {
        self.0.store(true, Ordering::Release);
    }
}

type Body = Box<dyn FnOnce(StopToken) + Send + 'static>;

pub struct RealtimeThread {
    name: String,
    priority: PriorityParameters,
    affinity: Option<CpuAffinity>,
    stack_size: usize,
    state: ThreadState,
    stop: StopToken,
    body: Option<Body>,
    handle: Option<Box<dyn HostThread>>,
}

impl RealtimeThread {
    pub fn new(
        name: impl Into<String>,
        priority: PriorityParameters,
        body: impl FnOnce(StopToken) + Send + 'static,
    ) -> Self {
        Self {
            name: name.into(),
            priority,
            affinity: None,
            stack_size: DEFAULT_STACK_SIZE,
            state: ThreadState::Created,
            stop: StopToken::new(),
            body: Some(Box::new(body)),
            handle: None,
        }
    }

    pub fn with_affinity(mut self, affinity: Option<CpuAffinity>) -> Self {
        self.affinity = affinity;
        self
    }

    pub fn with_stack_size(mut self, bytes: usize) -> Self {
        self.stack_size = bytes;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn priority(&self) -> PriorityParameters {
        self.priority
    }

    pub fn affinity(&self) -> Option<&CpuAffinity> {
        self.affinity.as_ref()
    }

    pub fn state(&self) -> ThreadState {
        self.state
    }

    pub fn stop_token(&self) -> StopToken {
        self.stop.clone()
    }

    /// Create the OS thread with policy, priority and affinity already applied.
    pub fn start(&mut self, platform: &dyn Platform) -> SchedulerResult<()> {
        let body = match (self.state, self.body.take()) {
            (ThreadState::Created, Some(body)) => body,
            (state, body) => {
                self.body = body;
                return Err(SchedulerError::ThreadNotStartable {
                    name: self.name.clone(),
                    state,
                });
            }
        };
        let stop = self.stop.clone();
        let spec = ThreadSpec {
            name: &self.name,
            priority: self.priority,
            affinity: self.affinity.as_ref(),
            stack_size: self.stack_size,
        };
        match platform.spawn(&spec, Box::new(move || body(stop))) {
            Ok(handle) => {
                self.handle = Some(handle);
                self.state = ThreadState::Running;
                Ok(())
            }
            Err(e) => {
                self.state = ThreadState::Terminated;
                Err(e.into())
            }
        }
    }

    /// Set the stop flag. The body observes it at its next check.
    pub fn request_stop(&mut self) {
        self.stop.request_stop();
        if self.state == ThreadState::Running {
            self.state = ThreadState::Stopping;
        }
    }

    /// Wait for the body to return. A thread that never started just terminates.
    pub fn join(&mut self) -> SchedulerResult<()> {
        self.body = None;
        let joined = match self.handle.take() {
            Some(handle) => handle.join().map_err(|e| SchedulerError::ThreadJoin {
                name: self.name.clone(),
                reason: e.to_string(),
            }),
            None => Ok(()),
        };
        self.state = ThreadState::Terminated;
        joined
    }

    /// [`request_stop`](Self::request_stop) followed by [`join`](Self::join).
    pub fn stop(&mut self) -> SchedulerResult<()> {
        self.request_stop();
        self.join()
    }
}

impl fmt::Debug for RealtimeThread {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RealtimeThread")
            .field("name", &self.name)
            .field("priority", &self.priority)
            .field("affinity", &self.affinity)
            .field("state", &self.state)
            .finish()
    }
}

impl Drop for RealtimeThread {
    fn drop(&mut self) {
        if self.handle.is_some() {
            let _ = self.stop();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ConfigurationError;
    use crate::platform::{SimulatedPlatform, ThreadBody};
    use std::ops::RangeInclusive;
    use std::sync::atomic::AtomicU64;
    use std::time::Duration;

    fn spinning_thread(counter: Arc<AtomicU64>) -> RealtimeThread {
        RealtimeThread::new("spinner", PriorityParameters::new(10), move |stop| {
            while !stop.is_stop_requested() {
                counter.fetch_add(1, Ordering::Relaxed);
                std::thread::sleep(Duration::from_micros(100));
            }
        })
    }

    #[test]
    fn lifecycle_created_running_terminated() {
        let counter = Arc::new(AtomicU64::new(0));
        let mut t = spinning_thread(counter.clone());
        assert_eq!(t.state(), ThreadState::Created);

        t.start(&SimulatedPlatform).unwrap();
        assert_eq!(t.state(), ThreadState::Running);
        while counter.load(Ordering::Relaxed) == 0 {
            std::thread::sleep(Duration::from_millis(1));
        }

        t.request_stop();
        assert_eq!(t.state(), ThreadState::Stopping);
        t.join().unwrap();
        assert_eq!(t.state(), ThreadState::Terminated);
    }

    #[test]
    fn start_twice_is_rejected() {
        let mut t = spinning_thread(Arc::new(AtomicU64::new(0)));
        t.start(&SimulatedPlatform).unwrap();
        assert!(matches!(
            t.start(&SimulatedPlatform),
            Err(SchedulerError::ThreadNotStartable {
                state: ThreadState::Running,
                ..
            })
        ));
        t.stop().unwrap();
    }

    #[test]
    fn join_without_start_terminates() {
        let mut t = RealtimeThread::new("idle", PriorityParameters::new(1), |_| {});
        t.join().unwrap();
        assert_eq!(t.state(), ThreadState::Terminated);
        assert!(t.start(&SimulatedPlatform).is_err());
    }

    struct DenyingPlatform;

    impl Platform for DenyingPlatform {
        fn name(&self) -> &'static str {
            "denying"
        }
        fn priority_range(
            &self,
            _policy: crate::params::SchedPolicy,
        ) -> Result<RangeInclusive<i32>, ConfigurationError> {
            Ok(1..=99)
        }
        fn online_cpus(&self) -> Result<Vec<usize>, ConfigurationError> {
            Ok(vec![0])
        }
        fn lock_memory(&self) -> Result<(), ConfigurationError> {
            Ok(())
        }
        fn spawn(
            &self,
            spec: &ThreadSpec<'_>,
            _body: ThreadBody,
        ) -> Result<Box<dyn HostThread>, ConfigurationError> {
            Err(ConfigurationError::PrivilegeDenied {
                thread: spec.name.to_owned(),
                policy: spec.priority.policy(),
                priority: spec.priority.priority(),
            })
        }
    }

    #[test]
    fn privilege_failure_terminates_thread() {
        let mut t = RealtimeThread::new("rt", PriorityParameters::new(80), |_| {});
        let err = t.start(&DenyingPlatform).unwrap_err();
        assert!(matches!(
            err,
            SchedulerError::Configuration(ConfigurationError::PrivilegeDenied { priority: 80, .. })
        ));
        assert_eq!(t.state(), ThreadState::Terminated);
    }
}
