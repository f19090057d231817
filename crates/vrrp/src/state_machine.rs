//! VRRP state machine implementation.
//!
//! Event-driven INIT/BACKUP/MASTER machine per RFC 3768 Section 6.4:
//! - Init → Backup, or straight to Master for the address owner
//! - Backup → Master on master-down timer expiry
//! - Master → Backup on a higher priority advertisement (or a source-IP
//!   tie-break loss)
//!
//! The driver task serializes every transition: timer fires, received
//! advertisements, and lifecycle events all funnel through one loop.
//! Only one timer is armed at a time - the master-down one-shot while
//! Backup, the advertisement ticker while Master.

use std::net::Ipv4Addr;
use std::pin::Pin;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use tokio::sync::{mpsc, watch};
use tokio::time::{interval_at, sleep, Instant, Interval, MissedTickBehavior, Sleep};
use tracing::{debug, info, warn};

use crate::ip_manager::IPManager;
use crate::packet::VRRPPacket;
use crate::types::{VRRPConfig, VRRPState, VRRPStats};

/// Capacity of the send, receive and event channels
const CHANNEL_CAPACITY: usize = 16;

/// Observer invoked on every state change with the (old, new) pair.
///
/// Called synchronously while the state lock is held; observers must not
/// block or call back into the state machine.
pub type StateObserver = Box<dyn Fn(VRRPState, VRRPState) + Send + Sync>;

/// Lifecycle events delivered to the state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Event {
    /// Begin the election (Init → Backup/Master)
    Startup,
    /// Tear down (→ Init, releasing virtual IPs)
    Shutdown,
    /// The master-down timer expired while Backup
    MasterDown,
    /// A priority-zero advertisement was observed
    PriorityZero,
}

/// What woke the driver loop.
enum Wake {
    Cancelled,
    Event(Event),
    Advert(VRRPPacket, Ipv4Addr),
    MasterDownFired,
    AdvertTick,
}

/// Cloneable handle for feeding and observing a running state machine.
#[derive(Clone)]
pub struct StateHandle {
    state: Arc<RwLock<VRRPState>>,
    stats: Arc<RwLock<VRRPStats>>,
    event_tx: mpsc::Sender<Event>,
    advert_tx: mpsc::Sender<(VRRPPacket, Ipv4Addr)>,
}

impl StateHandle {
    /// Current state.
    pub fn state(&self) -> VRRPState {
        *read_lock(&self.state)
    }

    /// Snapshot of the runtime statistics.
    pub fn stats(&self) -> VRRPStats {
        read_lock(&self.stats).clone()
    }

    /// Deliver a received advertisement to the driver.
    ///
    /// Drops the packet with a log note when the channel is saturated;
    /// advertisements are periodic and idempotent.
    pub fn process_packet(&self, packet: VRRPPacket, source: Ipv4Addr) {
        if self.advert_tx.try_send((packet, source)).is_err() {
            warn!("receive channel full, dropping packet");
        }
    }

    /// Deliver a lifecycle event to the driver.
    pub async fn send_event(&self, event: Event) {
        if self.event_tx.send(event).await.is_err() {
            debug!(?event, "state machine already stopped");
        }
    }
}

/// The VRRP election state machine.
///
/// Owns both protocol timers and the election bookkeeping; consumed by
/// [`StateMachine::run`], which drives it until shutdown.
pub struct StateMachine {
    vrid: u8,
    priority: u8,
    adv_interval_secs: u8,
    advert_interval: Duration,
    master_down_interval: Duration,
    virtual_ips: Vec<Ipv4Addr>,
    source_ip: Option<Ipv4Addr>,

    state: Arc<RwLock<VRRPState>>,
    stats: Arc<RwLock<VRRPStats>>,
    ip_manager: Option<Arc<IPManager>>,
    observer: Option<StateObserver>,

    send_tx: mpsc::Sender<VRRPPacket>,
    event_rx: mpsc::Receiver<Event>,
    advert_rx: mpsc::Receiver<(VRRPPacket, Ipv4Addr)>,

    master_down: Option<Pin<Box<Sleep>>>,
    advert_timer: Option<Interval>,
}

impl StateMachine {
    /// Build a state machine from a validated configuration.
    ///
    /// Returns the machine itself, a [`StateHandle`] for external use,
    /// and the receiving end of the outbound advertisement channel.
    pub fn new(
        config: &VRRPConfig,
        source_ip: Option<Ipv4Addr>,
        ip_manager: Option<Arc<IPManager>>,
    ) -> (Self, StateHandle, mpsc::Receiver<VRRPPacket>) {
        let (send_tx, send_rx) = mpsc::channel(CHANNEL_CAPACITY);
        let (event_tx, event_rx) = mpsc::channel(CHANNEL_CAPACITY);
        let (advert_tx, advert_rx) = mpsc::channel(CHANNEL_CAPACITY);

        let state = Arc::new(RwLock::new(VRRPState::Init));
        let stats = Arc::new(RwLock::new(VRRPStats::default()));

        let machine = Self {
            vrid: config.vrid,
            priority: config.priority,
            adv_interval_secs: config.advert_interval,
            advert_interval: config.advert_duration(),
            master_down_interval: config.master_down_interval(),
            virtual_ips: config.virtual_ips.clone(),
            source_ip,
            state: state.clone(),
            stats: stats.clone(),
            ip_manager,
            observer: None,
            send_tx,
            event_rx,
            advert_rx,
            master_down: None,
            advert_timer: None,
        };

        let handle = StateHandle {
            state,
            stats,
            event_tx,
            advert_tx,
        };

        (machine, handle, send_rx)
    }

    /// Install the state-change observer.
    pub fn set_observer(&mut self, observer: StateObserver) {
        self.observer = Some(observer);
    }

    /// Current state.
    pub fn state(&self) -> VRRPState {
        *read_lock(&self.state)
    }

    /// Drive the state machine until cancellation or shutdown.
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        loop {
            let wake = {
                let master_down_armed = self.master_down.is_some();
                let advert_timer_armed = self.advert_timer.is_some();
                let master_down = &mut self.master_down;
                let advert_timer = &mut self.advert_timer;
                tokio::select! {
                    _ = shutdown.changed() => Wake::Cancelled,
                    event = self.event_rx.recv() => match event {
                        Some(event) => Wake::Event(event),
                        None => Wake::Cancelled,
                    },
                    advert = self.advert_rx.recv() => match advert {
                        Some((packet, source)) => Wake::Advert(packet, source),
                        None => Wake::Cancelled,
                    },
                    _ = async { master_down.as_mut().unwrap().await }, if master_down_armed => {
                        Wake::MasterDownFired
                    }
                    _ = async { advert_timer.as_mut().unwrap().tick().await }, if advert_timer_armed => {
                        Wake::AdvertTick
                    }
                }
            };

            match wake {
                Wake::Cancelled | Wake::Event(Event::Shutdown) => {
                    self.transition(VRRPState::Init).await;
                    return;
                }
                Wake::Event(event) => self.handle_event(event).await,
                Wake::Advert(packet, source) => self.handle_advert(packet, source).await,
                Wake::MasterDownFired => {
                    self.master_down = None;
                    // A fire racing a transition away from Backup is stale.
                    if self.state() == VRRPState::Backup {
                        info!(vrid = self.vrid, "master down interval expired");
                        self.handle_event(Event::MasterDown).await;
                    }
                }
                Wake::AdvertTick => {
                    if self.state() == VRRPState::Master {
                        self.send_advertisement(self.priority);
                    }
                }
            }
        }
    }

    async fn handle_event(&mut self, event: Event) {
        match event {
            Event::Startup => {
                if self.priority == 255 {
                    // Address owner skips the election entirely.
                    info!(vrid = self.vrid, "address owner, transitioning to Master");
                    self.transition(VRRPState::Master).await;
                } else {
                    self.transition(VRRPState::Backup).await;
                }
            }
            Event::MasterDown => {
                if self.state() == VRRPState::Backup {
                    self.transition(VRRPState::Master).await;
                }
            }
            Event::PriorityZero => {
                if self.state() == VRRPState::Master {
                    self.send_advertisement(self.priority);
                }
            }
            Event::Shutdown => {}
        }
    }

    async fn handle_advert(&mut self, packet: VRRPPacket, source: Ipv4Addr) {
        if packet.vrid != self.vrid {
            write_lock(&self.stats).packets_discarded += 1;
            debug!(
                vrid = self.vrid,
                packet_vrid = packet.vrid,
                "ignoring advertisement for foreign VRID"
            );
            return;
        }

        write_lock(&self.stats).adverts_received += 1;

        if packet.priority == 0 {
            write_lock(&self.stats).priority_zero_received += 1;
            debug!(vrid = self.vrid, "master signaled shutdown (priority 0)");
            self.handle_event(Event::PriorityZero).await;
            return;
        }

        match self.state() {
            VRRPState::Backup => {
                if packet.priority >= self.priority {
                    self.reset_master_down_timer();
                    debug!(
                        vrid = self.vrid,
                        priority = packet.priority,
                        "reset master down timer"
                    );
                } else {
                    // No preemption from Backup: let master-down expiry
                    // promote us once the incumbent goes quiet.
                    debug!(
                        vrid = self.vrid,
                        priority = packet.priority,
                        "lower priority master, awaiting master down"
                    );
                }
            }
            VRRPState::Master => {
                if packet.priority > self.priority
                    || (packet.priority == self.priority && self.loses_tie_break(source))
                {
                    info!(
                        vrid = self.vrid,
                        our_priority = self.priority,
                        their_priority = packet.priority,
                        %source,
                        "yielding to peer, transitioning to Backup"
                    );
                    self.transition(VRRPState::Backup).await;
                }
            }
            VRRPState::Init => {}
        }
    }

    /// Byte-wise lexicographic source-IP tie-break; an unknown local
    /// source always loses.
    fn loses_tie_break(&self, source: Ipv4Addr) -> bool {
        match self.source_ip {
            Some(own) => source.octets() > own.octets(),
            None => true,
        }
    }

    async fn transition(&mut self, new: VRRPState) {
        let old = self.state();
        if old == new {
            return;
        }

        info!(vrid = self.vrid, %old, %new, "state transition");

        match old {
            VRRPState::Master => {
                self.stop_advert_timer();
                if new == VRRPState::Init {
                    // Final advertisement so backups fail over quickly.
                    self.send_advertisement(0);
                }
                self.release_virtual_ips().await;
            }
            VRRPState::Backup => self.stop_master_down_timer(),
            VRRPState::Init => {}
        }

        {
            let mut state = write_lock(&self.state);
            *state = new;
            if let Some(observer) = &self.observer {
                observer(old, new);
            }
        }

        match new {
            VRRPState::Master => {
                write_lock(&self.stats).master_transitions += 1;
                self.acquire_virtual_ips().await;
                self.send_advertisement(self.priority);
                self.start_advert_timer();
            }
            VRRPState::Backup => {
                write_lock(&self.stats).backup_transitions += 1;
                self.start_master_down_timer();
            }
            VRRPState::Init => {
                self.stop_advert_timer();
                self.stop_master_down_timer();
                self.release_virtual_ips().await;
            }
        }
    }

    fn send_advertisement(&mut self, priority: u8) {
        let packet = VRRPPacket::new(
            self.vrid,
            priority,
            self.adv_interval_secs,
            self.virtual_ips.clone(),
        );

        match self.send_tx.try_send(packet) {
            Ok(()) => write_lock(&self.stats).adverts_sent += 1,
            Err(_) => warn!(vrid = self.vrid, "send channel full, dropping advertisement"),
        }
    }

    async fn acquire_virtual_ips(&self) {
        let Some(manager) = &self.ip_manager else {
            return;
        };
        for vip in &self.virtual_ips {
            match manager.add(*vip).await {
                Ok(()) => info!(vrid = self.vrid, %vip, "added virtual IP"),
                Err(e) => warn!(vrid = self.vrid, %vip, error = %e, "failed to add virtual IP"),
            }
        }
    }

    async fn release_virtual_ips(&self) {
        let Some(manager) = &self.ip_manager else {
            return;
        };
        for vip in &self.virtual_ips {
            match manager.remove(*vip).await {
                Ok(()) => info!(vrid = self.vrid, %vip, "removed virtual IP"),
                Err(e) => {
                    warn!(vrid = self.vrid, %vip, error = %e, "failed to remove virtual IP")
                }
            }
        }
    }

    fn start_master_down_timer(&mut self) {
        self.master_down = Some(Box::pin(sleep(self.master_down_interval)));
    }

    /// Rearm with the full interval measured from now.
    fn reset_master_down_timer(&mut self) {
        self.start_master_down_timer();
    }

    fn stop_master_down_timer(&mut self) {
        self.master_down = None;
    }

    fn start_advert_timer(&mut self) {
        // The transition into Master already sent an advertisement, so
        // the first tick lands one full interval out.
        let mut timer = interval_at(Instant::now() + self.advert_interval, self.advert_interval);
        timer.set_missed_tick_behavior(MissedTickBehavior::Delay);
        self.advert_timer = Some(timer);
    }

    fn stop_advert_timer(&mut self) {
        self.advert_timer = None;
    }

    #[cfg(test)]
    fn master_down_armed(&self) -> bool {
        self.master_down.is_some()
    }

    #[cfg(test)]
    fn advert_timer_armed(&self) -> bool {
        self.advert_timer.is_some()
    }
}

fn read_lock<T>(lock: &RwLock<T>) -> std::sync::RwLockReadGuard<'_, T> {
    lock.read().unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn write_lock<T>(lock: &RwLock<T>) -> std::sync::RwLockWriteGuard<'_, T> {
    lock.write().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    fn test_machine(
        vrid: u8,
        priority: u8,
    ) -> (StateMachine, StateHandle, mpsc::Receiver<VRRPPacket>) {
        let config = VRRPConfig {
            vrid,
            priority,
            advert_interval: 1,
            interface: "test0".to_string(),
            virtual_ips: vec!["192.168.1.100".parse().unwrap()],
            ..Default::default()
        };
        StateMachine::new(&config, Some("10.0.0.100".parse().unwrap()), None)
    }

    fn advert(vrid: u8, priority: u8) -> VRRPPacket {
        VRRPPacket::new(vrid, priority, 1, vec!["192.168.1.100".parse().unwrap()])
    }

    #[tokio::test]
    async fn test_initial_state() {
        let (machine, handle, _send_rx) = test_machine(1, 100);
        assert_eq!(machine.state(), VRRPState::Init);
        assert_eq!(handle.state(), VRRPState::Init);
        assert!(!machine.master_down_armed());
        assert!(!machine.advert_timer_armed());
    }

    #[tokio::test]
    async fn test_transitions_and_observer() {
        let (mut machine, handle, mut send_rx) = test_machine(1, 100);

        let seen: Arc<Mutex<Vec<(VRRPState, VRRPState)>>> = Arc::new(Mutex::new(Vec::new()));
        let observer_seen = seen.clone();
        machine.set_observer(Box::new(move |old, new| {
            observer_seen.lock().unwrap().push((old, new));
        }));

        machine.transition(VRRPState::Backup).await;
        assert_eq!(handle.state(), VRRPState::Backup);
        assert!(machine.master_down_armed());
        assert!(!machine.advert_timer_armed());

        machine.transition(VRRPState::Master).await;
        assert_eq!(handle.state(), VRRPState::Master);
        assert!(!machine.master_down_armed());
        assert!(machine.advert_timer_armed());

        // Entering Master emits an immediate advertisement.
        let pkt = send_rx.try_recv().unwrap();
        assert_eq!(pkt.priority, 100);

        machine.transition(VRRPState::Init).await;
        assert_eq!(handle.state(), VRRPState::Init);
        assert!(!machine.master_down_armed());
        assert!(!machine.advert_timer_armed());

        // Leaving Master for Init emits the priority-zero farewell.
        let pkt = send_rx.try_recv().unwrap();
        assert_eq!(pkt.priority, 0);

        let seen = seen.lock().unwrap();
        assert_eq!(
            *seen,
            vec![
                (VRRPState::Init, VRRPState::Backup),
                (VRRPState::Backup, VRRPState::Master),
                (VRRPState::Master, VRRPState::Init),
            ]
        );

        let stats = handle.stats();
        assert_eq!(stats.master_transitions, 1);
        assert_eq!(stats.backup_transitions, 1);
        assert_eq!(stats.adverts_sent, 2);
    }

    #[tokio::test]
    async fn test_startup_address_owner() {
        let (mut machine, handle, mut send_rx) = test_machine(1, 255);
        machine.handle_event(Event::Startup).await;
        assert_eq!(handle.state(), VRRPState::Master);
        assert!(send_rx.try_recv().is_ok());
    }

    #[tokio::test]
    async fn test_startup_backup() {
        let (mut machine, handle, _send_rx) = test_machine(1, 100);
        machine.handle_event(Event::Startup).await;
        assert_eq!(handle.state(), VRRPState::Backup);
        assert!(machine.master_down_armed());
    }

    #[tokio::test]
    async fn test_foreign_vrid_ignored() {
        let (mut machine, handle, _send_rx) = test_machine(10, 100);
        machine.transition(VRRPState::Master).await;

        machine
            .handle_advert(advert(20, 200), "10.0.0.50".parse().unwrap())
            .await;

        assert_eq!(handle.state(), VRRPState::Master);
        assert_eq!(handle.stats().packets_discarded, 1);
    }

    #[tokio::test]
    async fn test_master_yields_to_higher_priority() {
        let (mut machine, handle, _send_rx) = test_machine(10, 100);
        machine.transition(VRRPState::Master).await;

        machine
            .handle_advert(advert(10, 200), "10.0.0.50".parse().unwrap())
            .await;

        assert_eq!(handle.state(), VRRPState::Backup);
        assert!(machine.master_down_armed());
        assert!(!machine.advert_timer_armed());
    }

    #[tokio::test]
    async fn test_tie_break_by_source_ip() {
        // We win against a numerically lower source.
        let (mut machine, handle, _send_rx) = test_machine(10, 100);
        machine.transition(VRRPState::Master).await;
        machine
            .handle_advert(advert(10, 100), "10.0.0.50".parse().unwrap())
            .await;
        assert_eq!(handle.state(), VRRPState::Master);

        // And lose against a higher one.
        machine
            .handle_advert(advert(10, 100), "10.0.0.200".parse().unwrap())
            .await;
        assert_eq!(handle.state(), VRRPState::Backup);
    }

    #[tokio::test]
    async fn test_unknown_source_loses_tie_break() {
        let config = VRRPConfig {
            vrid: 10,
            priority: 100,
            interface: "test0".to_string(),
            virtual_ips: vec!["192.168.1.100".parse().unwrap()],
            ..Default::default()
        };
        let (mut machine, handle, _send_rx) = StateMachine::new(&config, None, None);

        machine.transition(VRRPState::Master).await;
        machine
            .handle_advert(advert(10, 100), "10.0.0.1".parse().unwrap())
            .await;
        assert_eq!(handle.state(), VRRPState::Backup);
    }

    #[tokio::test]
    async fn test_backup_ignores_lower_priority() {
        let (mut machine, handle, _send_rx) = test_machine(10, 150);
        machine.transition(VRRPState::Backup).await;

        machine
            .handle_advert(advert(10, 50), "10.0.0.50".parse().unwrap())
            .await;

        // Still Backup, still waiting for master-down expiry.
        assert_eq!(handle.state(), VRRPState::Backup);
        assert!(machine.master_down_armed());
    }

    #[tokio::test]
    async fn test_backup_resets_timer_on_equal_or_higher() {
        let (mut machine, handle, _send_rx) = test_machine(10, 150);
        machine.transition(VRRPState::Backup).await;

        machine
            .handle_advert(advert(10, 150), "10.0.0.50".parse().unwrap())
            .await;
        assert_eq!(handle.state(), VRRPState::Backup);
        assert!(machine.master_down_armed());
        assert_eq!(handle.stats().adverts_received, 1);
    }

    #[tokio::test]
    async fn test_master_answers_priority_zero() {
        let (mut machine, handle, mut send_rx) = test_machine(10, 100);
        machine.transition(VRRPState::Master).await;
        let _ = send_rx.try_recv(); // advert from entering Master

        machine
            .handle_advert(advert(10, 0), "10.0.0.50".parse().unwrap())
            .await;

        assert_eq!(handle.state(), VRRPState::Master);
        let pkt = send_rx.try_recv().unwrap();
        assert_eq!(pkt.priority, 100);
        assert_eq!(handle.stats().priority_zero_received, 1);
    }

    #[tokio::test]
    async fn test_shutdown_via_run_loop() {
        let (machine, handle, _send_rx) = test_machine(1, 100);
        let (_shutdown_tx, shutdown_rx) = watch::channel(false);

        let driver = tokio::spawn(machine.run(shutdown_rx));

        handle.send_event(Event::Startup).await;
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(handle.state(), VRRPState::Backup);

        handle.send_event(Event::Shutdown).await;
        driver.await.unwrap();
        assert_eq!(handle.state(), VRRPState::Init);
    }

    #[tokio::test]
    async fn test_master_down_promotes_backup() {
        let config = VRRPConfig {
            vrid: 1,
            priority: 254, // short skew keeps the test fast
            advert_interval: 1,
            interface: "test0".to_string(),
            virtual_ips: vec!["192.168.1.100".parse().unwrap()],
            ..Default::default()
        };
        let (machine, handle, _send_rx) =
            StateMachine::new(&config, Some("10.0.0.100".parse().unwrap()), None);
        let (_shutdown_tx, shutdown_rx) = watch::channel(false);

        tokio::time::pause();
        let driver = tokio::spawn(machine.run(shutdown_rx));

        handle.send_event(Event::Startup).await;
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(handle.state(), VRRPState::Backup);

        // Jump past the master-down interval (3s + ~8ms skew).
        tokio::time::sleep(Duration::from_millis(3100)).await;
        assert_eq!(handle.state(), VRRPState::Master);

        handle.send_event(Event::Shutdown).await;
        driver.await.unwrap();
    }
}
