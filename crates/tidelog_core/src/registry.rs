//! Name-keyed registry of open channels.

use crate::channel::Channel;
use crate::config::{ChannelConfig, DaemonConfig};
use crate::daemon::{self, MaintenanceDaemon};
use crate::error::{CoreError, CoreResult};
use chrono::Local;
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use tracing::{debug, info};

struct RegistryShared {
    channels: RwLock<HashMap<String, Arc<Channel>>>,
    closed: AtomicBool,
}

impl RegistryShared {
    fn snapshot(&self) -> Vec<Arc<Channel>> {
        self.channels.read().values().cloned().collect()
    }
}

/// Owns every channel of a process and, optionally, the maintenance
/// daemon that services them.
///
/// The registry never holds its own lock while calling into an existing
/// channel.
///
/// # Example
///
/// ```no_run
/// use tidelog_core::{ChannelConfig, DaemonConfig, Registry};
///
/// let registry = Registry::with_daemon(DaemonConfig::default())?;
/// let channel = registry.create(ChannelConfig::new("app", "/var/log/app"))?;
/// channel.write(b"started")?;
/// registry.shutdown();
/// # Ok::<(), tidelog_core::CoreError>(())
/// ```
pub struct Registry {
    shared: Arc<RegistryShared>,
    daemon: Mutex<Option<MaintenanceDaemon>>,
    daemon_config: DaemonConfig,
}

impl Registry {
    /// Creates a registry without a maintenance thread. Maintenance then
    /// runs only through [`Registry::run_maintenance`].
    #[must_use]
    pub fn new() -> Self {
        Self::build(DaemonConfig::default())
    }

    fn build(daemon_config: DaemonConfig) -> Self {
        Self {
            shared: Arc::new(RegistryShared {
                channels: RwLock::new(HashMap::new()),
                closed: AtomicBool::new(false),
            }),
            daemon: Mutex::new(None),
            daemon_config,
        }
    }

    /// Creates a registry and starts its maintenance daemon.
    ///
    /// # Errors
    ///
    /// Returns an I/O error if the daemon thread cannot be spawned.
    pub fn with_daemon(config: DaemonConfig) -> CoreResult<Self> {
        let registry = Self::build(config);
        let weak: Weak<RegistryShared> = Arc::downgrade(&registry.shared);
        let daemon = MaintenanceDaemon::start(config, move || {
            weak.upgrade().map(|shared| shared.snapshot()).unwrap_or_default()
        })?;
        *registry.daemon.lock() = Some(daemon);
        Ok(registry)
    }

    /// Returns the channel named `config.name`, opening it if needed.
    ///
    /// When the channel already exists the new configuration is ignored.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::RegistryClosed`] after [`Registry::shutdown`],
    /// or any error from [`Channel::open`].
    pub fn create(&self, config: ChannelConfig) -> CoreResult<Arc<Channel>> {
        self.check_open()?;
        if let Some(channel) = self.shared.channels.read().get(&config.name) {
            return Ok(Arc::clone(channel));
        }

        let mut channels = self.shared.channels.write();
        if let Some(channel) = channels.get(&config.name) {
            return Ok(Arc::clone(channel));
        }
        let name = config.name.clone();
        let channel = Arc::new(Channel::open(config)?);
        channels.insert(name, Arc::clone(&channel));
        Ok(channel)
    }

    /// Looks up an open channel.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<Arc<Channel>> {
        self.shared.channels.read().get(name).cloned()
    }

    /// Names of the open channels, sorted.
    #[must_use]
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<_> = self.shared.channels.read().keys().cloned().collect();
        names.sort();
        names
    }

    /// Closes and forgets one channel. Returns `false` if it was not open.
    ///
    /// Handles still held elsewhere keep the [`Channel`] alive but closed.
    pub fn destroy(&self, name: &str) -> bool {
        let removed = self.shared.channels.write().remove(name);
        match removed {
            Some(channel) => {
                channel.close();
                debug!(channel = name, "channel destroyed");
                true
            }
            None => false,
        }
    }

    /// Closes and forgets every channel.
    pub fn destroy_all(&self) {
        let channels: Vec<_> = self.shared.channels.write().drain().collect();
        for (_, channel) in channels {
            channel.close();
        }
    }

    /// Runs one maintenance tick now, as the daemon would.
    pub fn run_maintenance(&self) {
        let channels = self.shared.snapshot();
        daemon::tick(
            &channels,
            Local::now().time(),
            self.daemon_config.midnight_tolerance,
        );
    }

    /// Stops the daemon and closes every channel. Later calls to
    /// [`Registry::create`] fail. Only the first call does anything.
    pub fn shutdown(&self) {
        if self.shared.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        let daemon = self.daemon.lock().take();
        if let Some(daemon) = daemon {
            daemon.shutdown();
        }
        self.destroy_all();
        info!("registry shut down");
    }

    /// Whether [`Registry::shutdown`] has run.
    #[must_use]
    pub fn is_shut_down(&self) -> bool {
        self.shared.closed.load(Ordering::Acquire)
    }

    fn check_open(&self) -> CoreResult<()> {
        if self.is_shut_down() {
            return Err(CoreError::RegistryClosed);
        }
        Ok(())
    }
}

impl Default for Registry {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for Registry {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl std::fmt::Debug for Registry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Registry")
            .field("channels", &self.names())
            .field("shut_down", &self.is_shut_down())
            .finish()
    }
}
