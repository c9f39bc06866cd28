//! Driver: the async loop around [`DriverState`]
//!
//! A [`Driver`] owns one controller. [`Driver::start`] spawns the transport
//! [`Link`] and a loop task that feeds link events and timer ticks into the
//! state, writes what it produced, delivers notifications and persists
//! snapshots. The state sits behind a `parking_lot` mutex shared with every
//! [`DriverHandle`]; the lock is never held across an `.await`.
//!
//! # Examples
//!
//! ```no_run
//! use zwrust::{Driver, DriverConfig, TcpTransport};
//!
//! #[tokio::main]
//! async fn main() -> zwrust::Result<()> {
//!     let mut driver = Driver::new(DriverConfig::default().with_state_dir("/var/lib/zwrust"))?;
//!     let mut notifications = driver.take_notifications().expect("first call");
//!
//!     driver.start(TcpTransport::new("192.168.1.50", 4001))?;
//!     while let Some(notification) = notifications.recv().await {
//!         println!("{}", notification);
//!     }
//!     driver.stop().await
//! }
//! ```

pub mod queue;
pub mod state;

pub use queue::{MsgQueue, MsgQueues, QueueItem};
pub use state::{DriverState, Outputs};

use parking_lot::Mutex;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::{mpsc, watch, Notify};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use zwrust_transport::{Link, LinkEvent, Transport};
use zwrust_types::{QueryStage, ValueId};

use crate::config::DriverConfig;
use crate::error::{Error, Result};
use crate::node::Node;
use crate::notification::Notification;
use crate::persist;
use crate::product::{Collaborators, Localization, ProductDatabase};
use crate::value::{Value, ValueData};

/// Z-Wave controller driver
pub struct Driver {
    state: Arc<Mutex<DriverState>>,
    wake: Arc<Notify>,
    notifications: mpsc::UnboundedSender<Notification>,
    receiver: Option<mpsc::UnboundedReceiver<Notification>>,
    running: Option<Running>,
}

struct Running {
    shutdown: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl Driver {
    /// Create a stopped driver
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] for settings that fail validation, and a
    /// core error when the network key cannot be expanded.
    pub fn new(config: DriverConfig) -> Result<Self> {
        let state = DriverState::new(config, Collaborators::default())?;
        let (tx, rx) = mpsc::unbounded_channel();
        Ok(Self {
            state: Arc::new(Mutex::new(state)),
            wake: Arc::new(Notify::new()),
            notifications: tx,
            receiver: Some(rx),
            running: None,
        })
    }

    /// Resolve product names through `products`
    pub fn with_product_database(self, products: Arc<dyn ProductDatabase>) -> Self {
        self.state.lock().set_product_database(products);
        self
    }

    /// Translate value labels through `localization`
    pub fn with_localization(self, localization: Arc<dyn Localization>) -> Self {
        self.state.lock().set_localization(localization);
        self
    }

    /// The notification stream; `None` after the first call
    pub fn take_notifications(&mut self) -> Option<mpsc::UnboundedReceiver<Notification>> {
        self.receiver.take()
    }

    /// Cloneable access for other tasks
    pub fn handle(&self) -> DriverHandle {
        DriverHandle {
            state: Arc::clone(&self.state),
            wake: Arc::clone(&self.wake),
        }
    }

    pub fn is_running(&self) -> bool {
        self.running.is_some()
    }

    /// Open `transport` and run the driver in the background
    ///
    /// Must be called inside a Tokio runtime.
    pub fn start<T>(&mut self, transport: T) -> Result<()>
    where
        T: Transport + 'static,
    {
        if self.running.is_some() {
            return Err(Error::AlreadyRunning);
        }

        let config = self.state.lock().config().clone();
        let name = transport.name();
        let (link, events) = Link::spawn(transport, config.link_config());
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let driver_loop = DriverLoop {
            state: Arc::clone(&self.state),
            wake: Arc::clone(&self.wake),
            notifications: self.notifications.clone(),
            state_dir: config.state_dir,
            link_open: false,
        };
        let task = tokio::spawn(driver_loop.run(link, events, shutdown_rx));

        info!("Driver started on {}", name);
        self.running = Some(Running {
            shutdown: shutdown_tx,
            task,
        });
        Ok(())
    }

    /// Stop the loop, close the link and save the network state
    pub async fn stop(&mut self) -> Result<()> {
        let running = self.running.take().ok_or(Error::NotRunning)?;
        let _ = running.shutdown.send(true);
        running
            .task
            .await
            .map_err(|e| Error::Io(std::io::Error::other(e.to_string())))?;
        info!("Driver stopped");
        Ok(())
    }
}

impl Drop for Driver {
    fn drop(&mut self) {
        if let Some(running) = self.running.take() {
            warn!("Driver dropped while running; stopping without saving");
            let _ = running.shutdown.send(true);
            running.task.abort();
        }
    }
}

/// Shared access to a driver's nodes and values
///
/// Requests only queue messages; the driver loop sends them.
#[derive(Clone)]
pub struct DriverHandle {
    state: Arc<Mutex<DriverState>>,
    wake: Arc<Notify>,
}

impl DriverHandle {
    /// Run a state call and let the loop pick up its traffic
    fn request<R>(&self, f: impl FnOnce(&mut DriverState) -> Result<R>) -> Result<R> {
        let result = f(&mut self.state.lock());
        self.wake.notify_one();
        result
    }

    pub fn home_id(&self) -> u32 {
        self.state.lock().home_id()
    }

    pub fn controller_node_id(&self) -> u8 {
        self.state.lock().controller_node_id()
    }

    pub fn is_ready(&self) -> bool {
        self.state.lock().is_ready()
    }

    pub fn node_ids(&self) -> Vec<u8> {
        self.state.lock().node_ids()
    }

    /// Inspect a node under the driver lock
    pub fn with_node<R>(&self, node_id: u8, f: impl FnOnce(&Node) -> R) -> Option<R> {
        self.state.lock().node(node_id).map(f)
    }

    pub fn query_stage(&self, node_id: u8) -> Option<QueryStage> {
        self.with_node(node_id, Node::query_stage)
    }

    pub fn value(&self, id: &ValueId) -> Option<Arc<Value>> {
        self.state.lock().node(id.node_id).and_then(|n| n.value(id))
    }

    /// Every value of a node
    pub fn values(&self, node_id: u8) -> Vec<Arc<Value>> {
        self.with_node(node_id, |n| n.values().iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Write a value; the change is announced once the node confirms it
    pub fn set_value(&self, id: &ValueId, data: ValueData) -> Result<()> {
        self.request(|state| state.set_value(id, data))
    }

    pub fn refresh_value(&self, id: &ValueId) -> Result<()> {
        self.request(|state| state.refresh_value(id))
    }

    pub fn set_poll_intensity(&self, id: &ValueId, intensity: u8) -> Result<()> {
        self.request(|state| state.set_poll_intensity(id, intensity))
    }

    pub fn set_node_name(&self, node_id: u8, name: &str) -> Result<()> {
        self.request(|state| state.set_node_name(node_id, name))
    }

    pub fn set_node_location(&self, node_id: u8, location: &str) -> Result<()> {
        self.request(|state| state.set_node_location(node_id, location))
    }

    pub fn add_association(&self, node_id: u8, group: u8, target: u8) -> Result<()> {
        self.request(|state| state.add_association(node_id, group, target))
    }

    pub fn remove_association(&self, node_id: u8, group: u8, target: u8) -> Result<()> {
        self.request(|state| state.remove_association(node_id, group, target))
    }

    /// Send a No Operation to check the node is reachable
    pub fn ping(&self, node_id: u8) -> Result<()> {
        self.request(|state| state.ping(node_id))
    }
}

impl std::fmt::Debug for DriverHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DriverHandle").finish_non_exhaustive()
    }
}

/// State of the background task
struct DriverLoop {
    state: Arc<Mutex<DriverState>>,
    wake: Arc<Notify>,
    notifications: mpsc::UnboundedSender<Notification>,
    state_dir: Option<PathBuf>,
    link_open: bool,
}

impl DriverLoop {
    async fn run(
        mut self,
        link: Link,
        mut events: mpsc::Receiver<LinkEvent>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        loop {
            let deadline = self.state.lock().next_deadline();
            tokio::select! {
                biased;
                _ = shutdown.changed() => break,
                event = events.recv() => match event {
                    Some(event) => self.on_event(event),
                    None => {
                        warn!("Link task ended");
                        break;
                    }
                },
                _ = self.wake.notified() => {}
                _ = sleep_until(deadline) => {
                    self.state.lock().on_tick(Instant::now());
                }
            }
            self.flush(&link).await;
        }

        let snapshot = self.state.lock().snapshot();
        if let Some(snapshot) = snapshot {
            self.save(&snapshot).await;
        }
        if let Err(e) = link.close().await {
            warn!("Closing link failed: {}", e);
        }
        self.flush_notifications();
    }

    fn on_event(&mut self, event: LinkEvent) {
        let mut state = self.state.lock();
        match event {
            LinkEvent::Opened => {
                self.link_open = true;
                state.on_link_opened();
            }
            LinkEvent::Closed => {
                self.link_open = false;
                state.on_link_closed();
            }
            LinkEvent::Received(incoming) => state.on_incoming(incoming),
            LinkEvent::Malformed(e) => state.on_malformed(&e),
        }
    }

    /// Start the next transaction and carry out everything the state produced
    async fn flush(&mut self, link: &Link) {
        loop {
            let outputs = {
                let mut state = self.state.lock();
                if self.link_open {
                    state.poll_send(Instant::now());
                }
                state.take_outputs()
            };
            if outputs.is_empty() {
                return;
            }

            for bytes in outputs.writes {
                if let Err(e) = link.write(bytes).await {
                    warn!("Write failed: {}", e);
                }
            }
            for notification in outputs.notifications {
                self.deliver(notification);
            }
            if let Some(home_id) = outputs.load {
                self.load(home_id).await;
            }
            if let Some(snapshot) = outputs.save {
                self.save(&snapshot).await;
            }
        }
    }

    fn flush_notifications(&mut self) {
        let notifications = self.state.lock().take_outputs().notifications;
        for notification in notifications {
            self.deliver(notification);
        }
    }

    fn deliver(&self, notification: Notification) {
        debug!(%notification, "Notification");
        // Nobody listening is fine
        let _ = self.notifications.send(notification);
    }

    async fn load(&self, home_id: u32) {
        let Some(dir) = &self.state_dir else {
            return;
        };
        match persist::load(dir, home_id).await {
            Ok(Some(snapshot)) => self.state.lock().apply_snapshot(snapshot),
            Ok(None) => {}
            Err(e) => warn!("Could not read snapshot: {}", e),
        }
    }

    async fn save(&self, snapshot: &zwrust_types::NetworkSnapshot) {
        let Some(dir) = &self.state_dir else {
            return;
        };
        if let Err(e) = persist::save(dir, snapshot).await {
            warn!("Could not write snapshot: {}", e);
        }
    }
}

async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}
