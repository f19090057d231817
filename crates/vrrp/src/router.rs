//! Virtual router lifecycle.
//!
//! Composes the socket, state machine, and IP manager into a running
//! instance: a send worker draining the state machine's advertisement
//! channel, a receive worker feeding decoded frames back in, and the
//! state-machine driver itself. A single watch channel cancels all
//! three; `stop` joins them before the socket closes.

use std::net::Ipv4Addr;
use std::sync::Arc;
use std::time::Duration;

use common::{Error, Result};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::ip_manager::IPManager;
use crate::packet::VRRPPacket;
use crate::socket::VRRPSocket;
use crate::state_machine::{Event, StateHandle, StateMachine};
use crate::types::{VRRPConfig, VRRPState, VRRPStats};

/// How often the receive worker polls the nonblocking socket
const RECV_POLL_INTERVAL: Duration = Duration::from_millis(10);

/// A single VRRP virtual router instance.
///
/// Created with a validated configuration, started once, stopped once.
/// Restart requires a fresh instance.
pub struct VirtualRouter {
    config: VRRPConfig,
    state_handle: Option<StateHandle>,
    shutdown_tx: Option<watch::Sender<bool>>,
    driver: Option<JoinHandle<()>>,
    workers: Vec<JoinHandle<()>>,
    netlink_conn: Option<JoinHandle<()>>,
    running: bool,
}

impl VirtualRouter {
    /// Validate the configuration and build a stopped router.
    pub fn new(config: VRRPConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            config,
            state_handle: None,
            shutdown_tx: None,
            driver: None,
            workers: Vec::new(),
            netlink_conn: None,
            running: false,
        })
    }

    /// Open the socket, spawn the workers, and begin the election.
    pub async fn start(&mut self) -> Result<()> {
        if self.running {
            return Err(Error::other("virtual router is already running"));
        }

        let (conn, netlink_handle, _) = rtnetlink::new_connection()?;
        let netlink_conn = tokio::spawn(conn);

        let result = self.start_inner(netlink_handle).await;
        if result.is_err() {
            netlink_conn.abort();
            return result;
        }
        self.netlink_conn = Some(netlink_conn);

        self.running = true;
        info!(
            vrid = self.config.vrid,
            priority = self.config.priority,
            interface = %self.config.interface,
            "virtual router started"
        );
        Ok(())
    }

    async fn start_inner(&mut self, netlink_handle: rtnetlink::Handle) -> Result<()> {
        let ip_manager = Arc::new(IPManager::new(netlink_handle, &self.config.interface)?);

        let source_ip = ip_manager.first_ipv4().await?.ok_or_else(|| {
            Error::network(format!(
                "no IPv4 address found on interface {}",
                self.config.interface
            ))
        })?;

        let socket = VRRPSocket::new(&self.config.interface, source_ip)?;
        socket.join_multicast()?;
        let socket = Arc::new(socket);

        ip_manager.configure_arp(true);

        let (mut machine, state_handle, send_rx) =
            StateMachine::new(&self.config, Some(source_ip), Some(ip_manager));

        let vrid = self.config.vrid;
        machine.set_observer(Box::new(move |old, new| {
            info!(vrid, "State transition {} -> {}", old, new);
        }));

        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        self.workers
            .push(spawn_send_worker(socket.clone(), send_rx, shutdown_rx.clone()));
        self.workers.push(spawn_recv_worker(
            socket,
            state_handle.clone(),
            shutdown_rx.clone(),
        ));
        self.driver = Some(tokio::spawn(machine.run(shutdown_rx)));

        state_handle.send_event(Event::Startup).await;

        self.state_handle = Some(state_handle);
        self.shutdown_tx = Some(shutdown_tx);
        Ok(())
    }

    /// Cancel the workers, wait for them to drain, and release resources.
    ///
    /// The state machine transitions to Init (releasing the virtual IPs)
    /// before the socket closes.
    pub async fn stop(&mut self) -> Result<()> {
        if !self.running {
            return Err(Error::other("virtual router is not running"));
        }

        // Graceful teardown first: the driver releases VIPs and emits the
        // priority-zero farewell while the send worker still runs.
        if let Some(handle) = &self.state_handle {
            handle.send_event(Event::Shutdown).await;
        }

        let mut failure = None;
        if let Some(driver) = self.driver.take() {
            if let Err(e) = driver.await {
                failure = Some(format!("state machine driver failed: {}", e));
            }
        }

        if let Some(shutdown_tx) = self.shutdown_tx.take() {
            let _ = shutdown_tx.send(true);
        }

        for worker in self.workers.drain(..) {
            if let Err(e) = worker.await {
                failure.get_or_insert_with(|| format!("worker failed: {}", e));
            }
        }

        if let Some(conn) = self.netlink_conn.take() {
            conn.abort();
        }

        self.running = false;
        info!(vrid = self.config.vrid, "virtual router stopped");

        match failure {
            Some(msg) => Err(Error::other(msg)),
            None => Ok(()),
        }
    }

    /// Current election state; Init when the router has not started.
    pub fn state(&self) -> VRRPState {
        self.state_handle
            .as_ref()
            .map(|handle| handle.state())
            .unwrap_or(VRRPState::Init)
    }

    /// Runtime statistics snapshot.
    pub fn stats(&self) -> VRRPStats {
        self.state_handle
            .as_ref()
            .map(|handle| handle.stats())
            .unwrap_or_default()
    }

    /// Whether the router is currently running.
    pub fn is_running(&self) -> bool {
        self.running
    }

    /// Configured virtual router ID.
    pub fn vrid(&self) -> u8 {
        self.config.vrid
    }

    /// Configured priority.
    pub fn priority(&self) -> u8 {
        self.config.priority
    }

    /// Configured virtual IPs.
    pub fn virtual_ips(&self) -> &[Ipv4Addr] {
        &self.config.virtual_ips
    }
}

fn spawn_send_worker(
    socket: Arc<VRRPSocket>,
    mut send_rx: mpsc::Receiver<VRRPPacket>,
    mut shutdown: watch::Receiver<bool>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = shutdown.changed() => break,
                packet = send_rx.recv() => match packet {
                    Some(packet) => {
                        if let Err(e) = socket.send(&packet) {
                            warn!(error = %e, "failed to send advertisement");
                        }
                    }
                    None => break,
                },
            }
        }

        // Flush anything the driver queued on its way out, the
        // priority-zero farewell in particular.
        while let Ok(packet) = send_rx.try_recv() {
            if let Err(e) = socket.send(&packet) {
                warn!(error = %e, "failed to send advertisement");
            }
        }

        debug!("send worker stopped");
    })
}

fn spawn_recv_worker(
    socket: Arc<VRRPSocket>,
    state_handle: StateHandle,
    mut shutdown: watch::Receiver<bool>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut poll = tokio::time::interval(RECV_POLL_INTERVAL);
        loop {
            tokio::select! {
                _ = shutdown.changed() => break,
                _ = poll.tick() => loop {
                    match socket.try_recv() {
                        Ok(Some((packet, source))) => {
                            state_handle.process_packet(packet, source);
                        }
                        Ok(None) => break,
                        Err(e) => {
                            // Malformed frame or transient socket error:
                            // drop it and retry on the next poll tick.
                            warn!(error = %e, "dropping unreadable frame");
                            break;
                        }
                    }
                },
            }
        }

        debug!("receive worker stopped");
    })
}
