//! Background maintenance thread.
//!
//! One thread per [`crate::Registry`] wakes after
//! [`DaemonConfig::initial_delay`] and then every
//! [`DaemonConfig::interval`]. Each tick arms or disarms the day-boundary
//! check of incremental channels and runs their maintenance: retention
//! sweep, then (incremental only) a flush.

use crate::channel::Channel;
use crate::config::DaemonConfig;
use crate::error::CoreResult;
use chrono::{Local, NaiveTime, Timelike};
use parking_lot::{Condvar, Mutex};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tracing::{debug, error, trace};

const DAEMON_THREAD_NAME: &str = "tidelog-dm";
const SECS_PER_DAY: u32 = 86_400;

/// Returns `true` when `time` is within `tolerance` of local midnight, on
/// either side.
#[must_use]
pub fn near_midnight(time: NaiveTime, tolerance: Duration) -> bool {
    let secs = time.num_seconds_from_midnight();
    let distance = secs.min(SECS_PER_DAY - secs);
    u64::from(distance) <= tolerance.as_secs()
}

/// Runs one maintenance tick over `channels`.
pub fn tick(channels: &[Arc<Channel>], now: NaiveTime, tolerance: Duration) {
    let armed = near_midnight(now, tolerance);
    for channel in channels {
        if channel.is_incremental() {
            channel.set_check_across_day(armed);
        }
        channel.run_maintenance();
    }
    trace!(channels = channels.len(), armed, "maintenance tick");
}

struct DaemonState {
    stop: Mutex<bool>,
    wake: Condvar,
}

/// Handle to the maintenance thread. Dropping it stops the thread.
pub struct MaintenanceDaemon {
    state: Arc<DaemonState>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl MaintenanceDaemon {
    /// Starts the thread. `channels` is called on every tick to get the
    /// channels to maintain.
    ///
    /// # Errors
    ///
    /// Returns an I/O error if the thread cannot be spawned.
    pub fn start<F>(config: DaemonConfig, channels: F) -> CoreResult<Self>
    where
        F: Fn() -> Vec<Arc<Channel>> + Send + 'static,
    {
        let state = Arc::new(DaemonState {
            stop: Mutex::new(false),
            wake: Condvar::new(),
        });
        let thread_state = Arc::clone(&state);
        let handle = thread::Builder::new()
            .name(DAEMON_THREAD_NAME.to_string())
            .spawn(move || run(&thread_state, config, channels))?;
        debug!("maintenance daemon started");
        Ok(Self {
            state,
            handle: Mutex::new(Some(handle)),
        })
    }

    /// Signals the thread and waits for it. Only the first call does
    /// anything.
    pub fn shutdown(&self) {
        *self.state.stop.lock() = true;
        self.state.wake.notify_all();
        if let Some(handle) = self.handle.lock().take() {
            if handle.join().is_err() {
                error!("maintenance daemon panicked");
            }
            debug!("maintenance daemon stopped");
        }
    }
}

impl Drop for MaintenanceDaemon {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl std::fmt::Debug for MaintenanceDaemon {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MaintenanceDaemon")
            .field("running", &self.handle.lock().is_some())
            .finish()
    }
}

fn run<F>(state: &DaemonState, config: DaemonConfig, channels: F)
where
    F: Fn() -> Vec<Arc<Channel>>,
{
    let mut delay = config.initial_delay;
    loop {
        let deadline = Instant::now() + delay;
        {
            let mut stop = state.stop.lock();
            while !*stop {
                if state.wake.wait_until(&mut stop, deadline).timed_out() {
                    break;
                }
            }
            if *stop {
                return;
            }
        }
        tick(&channels(), Local::now().time(), config.midnight_tolerance);
        delay = config.interval;
    }
}
