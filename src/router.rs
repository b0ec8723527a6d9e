//! Zombie router: receive pipeline, dedup, acknowledgement, forwarding and
//! the maintenance worker.
//!
//! Two tasks run per router: the receive task drains the mesh socket and
//! handles each frame synchronously (decode, dedup, ack, classify, forward),
//! the maintenance worker flushes the outgoing queue and drives the
//! retransmission caches every ten seconds. Both are exception firewalls:
//! per-frame and per-tick failures are logged and never tear the router down.
//!
//! All shared state lives behind short-lived mutexes that are never held
//! across a send.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use metrics::counter;
use parking_lot::Mutex;
use reqwest::Client;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tracing::{debug, error, info, warn};

use crate::config_store::{ConfigStore, GLOBAL_GROUP};
use crate::dropqueue::DropQueue;
use crate::errors::{RouterError, ZombiegramError};
use crate::gateway;
use crate::mesh::MeshTransport;
use crate::retransmission::RetransmissionCache;
use crate::zombiegram::{Payload, Priority, Zombiegram, ZombiegramBuilder, MAX_FRAME_SIZE};

/// Recent sequence numbers remembered per neighbor.
const RECENT_SEQ_WINDOW: usize = 10;
/// Upper bound on retransmissions per maintenance tick.
const MAX_TRANSMISSIONS_PER_BURST: usize = 10;
const MESH_BOOT_POLL: Duration = Duration::from_secs(2);
const MAINTENANCE_TICK: Duration = Duration::from_secs(10);

/// Mesh router handle. Constructed once at boot and shared (via `Arc`) with
/// the HTTP ingress handlers and any sensor callback.
pub struct ZombieRouter {
    config: Arc<ConfigStore>,
    mesh: Arc<dyn MeshTransport>,
    /// Low 32 bits of the device's unique id.
    source_id: u32,
    started: AtomicBool,
    stop: watch::Sender<bool>,
    recent_by_source: Mutex<HashMap<u32, DropQueue<u8>>>,
    package_acks: Mutex<HashMap<u32, RetransmissionCache>>,
    outgoing_queue: Mutex<Vec<(Priority, Vec<Payload>)>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    http: Client,
}

impl ZombieRouter {
    pub fn new(config: Arc<ConfigStore>, mesh: Arc<dyn MeshTransport>, source_id: u32) -> Arc<Self> {
        let (stop, _) = watch::channel(false);
        Arc::new(Self {
            config,
            mesh,
            source_id,
            started: AtomicBool::new(false),
            stop,
            recent_by_source: Mutex::new(HashMap::new()),
            package_acks: Mutex::new(HashMap::new()),
            outgoing_queue: Mutex::new(Vec::new()),
            tasks: Mutex::new(Vec::new()),
            http: Client::new(),
        })
    }

    /// Launch the receive task and the maintenance worker. A second call
    /// while running is a no-op.
    pub fn start(self: &Arc<Self>) {
        if self.started.swap(true, Ordering::SeqCst) {
            return;
        }
        self.stop.send_replace(false);
        let receive_stop = self.stop.subscribe();
        let worker_stop = self.stop.subscribe();
        let mut tasks = self.tasks.lock();
        tasks.push(tokio::spawn(Arc::clone(self).receive_loop(receive_stop)));
        tasks.push(tokio::spawn(Arc::clone(self).worker_loop(worker_stop)));
        info!(source_id = format!("{:08x}", self.source_id), "zombie router started");
    }

    /// Signal both tasks to stop and wait for the teardown (mesh deinit,
    /// queue and cache wipe) to finish.
    pub async fn stop(&self) {
        info!("zombie router stop issued, waiting for routing tasks to wind down");
        self.stop.send_replace(true);
        let handles: Vec<JoinHandle<()>> = self.tasks.lock().drain(..).collect();
        for handle in handles {
            if let Err(e) = handle.await {
                warn!(error = %e, "router task ended abnormally");
            }
        }
    }

    /// Whether frames can actually reach somebody right now.
    pub fn is_network_ready(&self) -> bool {
        self.started.load(Ordering::SeqCst)
            && self.mesh.is_connected()
            && !self.mesh.neighbors().is_empty()
    }

    pub fn neighbors(&self) -> Vec<u32> {
        if self.started.load(Ordering::SeqCst) {
            self.mesh.neighbors()
        } else {
            Vec::new()
        }
    }

    /// Total number of cached frames still awaiting acknowledgements.
    pub fn retransmission_pending(&self) -> usize {
        self.package_acks.lock().values().map(RetransmissionCache::len).sum()
    }

    /// Sleep policy: a node may deep-sleep iff it serves neither as router
    /// nor as gateway and nothing awaits retransmission.
    pub fn can_deep_sleep(&self) -> bool {
        !self.config.is_router() && !self.config.is_gateway() && self.retransmission_pending() == 0
    }

    /// Queue payloads for transmission once the mesh is ready.
    pub fn enqueue(&self, priority: Priority, payloads: Vec<Payload>) {
        self.outgoing_queue.lock().push((priority, payloads));
        info!(priority = ?priority, "payloads queued for transmission");
    }

    #[cfg(test)]
    pub(crate) fn queued(&self) -> Vec<(Priority, Vec<Payload>)> {
        self.outgoing_queue.lock().clone()
    }

    /// Build, sign and multicast a fresh Zombiegram, and cache it for
    /// retransmission. Own messages of a gateway node are bridged as well.
    pub async fn send(&self, priority: Priority, payloads: Vec<Payload>) -> Result<(), RouterError> {
        let zombiegram = self.build_signed(priority, &payloads)?;
        self.transmit(zombiegram, self.mesh.multicast_addr(), true).await;
        Ok(())
    }

    /// Multicast an already-signed Zombiegram to all neighbors.
    ///
    /// # Errors
    /// [`RouterError::MeshNotReady`] when the mesh is down or has no
    /// neighbors. `send`/`enqueue` tolerate unreadiness; this call does not.
    pub async fn forward(&self, zombiegram: Zombiegram, add_to_cache: bool) -> Result<(), RouterError> {
        if !self.is_network_ready() {
            return Err(RouterError::MeshNotReady);
        }
        self.transmit(zombiegram, self.mesh.multicast_addr(), add_to_cache).await;
        Ok(())
    }

    fn build_signed(&self, priority: Priority, payloads: &[Payload]) -> Result<Zombiegram, ZombiegramError> {
        let seq_num = self.config.seq_num().wrapping_add(1);
        self.config.set_seq_num(seq_num);
        let mut builder = ZombiegramBuilder::new(self.source_id, seq_num)
            .priority(priority)
            .tampered(self.config.tampered_flag())
            .maintenance(self.config.maintenance_flag());
        for payload in payloads {
            builder.add_payload(payload.clone())?;
        }
        let trust_key = self.config.trust_key();
        Ok(builder.sign(trust_key.as_deref()))
    }

    async fn transmit(&self, zombiegram: Zombiegram, addr: SocketAddr, add_to_cache: bool) {
        match self.mesh.send_to(zombiegram.as_bytes(), addr).await {
            Ok(_) => {
                counter!("zg.tx.frames").increment(1);
            }
            Err(e) => {
                // The frame still goes into the cache below; the maintenance
                // loop retries naturally.
                error!(addr = %addr, error = %e, "sending data over the LoRa network failed");
            }
        }

        if !add_to_cache {
            return;
        }
        let source_id = zombiegram.source_id();
        let seq_num = zombiegram.seq_num();
        let is_own = source_id == self.source_id;
        let inserted = {
            let mut caches = self.package_acks.lock();
            caches.entry(source_id).or_default().add(zombiegram.clone(), is_own)
        };
        match inserted {
            Ok(()) => debug!(source_id, seq_num, "zombiegram added to the retransmission cache"),
            Err(e) => warn!(source_id, seq_num, error = %e, "adding zombiegram to the retransmission cache failed"),
        }

        if is_own && self.config.is_gateway() {
            self.bridge(&zombiegram);
        }
    }

    async fn send_ack(&self, source_id: u32, seq_num: u8, to: SocketAddr) {
        let ack = Payload::Acknowledge { source_id, seq_num };
        match self.build_signed(Priority::Normal, &[ack]) {
            Ok(zombiegram) => {
                if let Err(e) = self.mesh.send_to(zombiegram.as_bytes(), to).await {
                    error!(to = %to, error = %e, "sending acknowledgement failed");
                    return;
                }
                debug!(seq_num, to = %to, "acknowledgement sent");
            }
            Err(e) => warn!(error = %e, "could not build acknowledgement"),
        }
    }

    fn bridge(&self, zombiegram: &Zombiegram) {
        let trusted = zombiegram.is_trusted(self.config.trust_key().as_deref());
        gateway::propagate(
            self.http.clone(),
            self.config.webhooks(),
            zombiegram.to_bridge_json(trusted),
        );
    }

    /// Handle one inbound datagram. This is the receive-callback body and
    /// must not block on anything but the outbound sends.
    pub async fn process_frame(&self, data: &[u8], rcv_addr: SocketAddr) {
        counter!("zg.rx.frames").increment(1);
        let zombiegram = match Zombiegram::from_bytes(data) {
            Ok(zombiegram) => zombiegram,
            Err(e) => {
                counter!("zg.rx.decode_err").increment(1);
                warn!(error = %e, data = %hex::encode(data), "LoRa interface received unknown or malformed data");
                return;
            }
        };
        let source_id = zombiegram.source_id();
        let seq_num = zombiegram.seq_num();
        debug!(source_id, seq_num, from = %rcv_addr, "incoming zombiegram");

        // Loop suppression: one of our own frames came back around.
        if source_id == self.source_id {
            debug!("incoming message is our own, ignoring");
            return;
        }
        self.mesh.record_heard(source_id, rcv_addr);

        let mut carries_ack = false;
        let mut carries_network_change = false;
        for payload in zombiegram.payloads() {
            match payload {
                Payload::Acknowledge { .. } => carries_ack = true,
                Payload::NetworkChange { .. } => carries_network_change = true,
                _ => {}
            }
        }

        let already_seen = {
            let mut recent = self.recent_by_source.lock();
            recent
                .entry(source_id)
                .or_insert_with(|| DropQueue::new(RECENT_SEQ_WINDOW))
                .contains(&seq_num)
        };

        // Acknowledge before the forwarding decision, duplicates included:
        // our previous ack may have been lost. Acks are never acknowledged.
        if !carries_ack {
            self.send_ack(source_id, seq_num, rcv_addr).await;
        }

        if already_seen {
            debug!(source_id, seq_num, "zombiegram was already seen by this device, ignoring");
            return;
        }

        if carries_ack {
            let mut caches = self.package_acks.lock();
            for payload in zombiegram.payloads() {
                if let Payload::Acknowledge { source_id: acked_source, seq_num: acked_seq } = payload {
                    if let Some(cache) = caches.get_mut(acked_source) {
                        if cache.record_ack(source_id, *acked_seq) {
                            counter!("zg.ack.recorded").increment(1);
                            debug!(
                                from = source_id,
                                acked_source, acked_seq, "received acknowledgement for a sent zombiegram"
                            );
                        }
                    } else {
                        // Enough acks may already have retired the entry.
                        debug!(acked_source, acked_seq, "acknowledgement for an unknown cache entry, ignoring");
                    }
                }
            }
        } else {
            if carries_network_change {
                warn!("network change received, dropping the local trust key");
                self.config.set_trust_key(None);
                if let Err(e) = self.config.save(GLOBAL_GROUP) {
                    error!(error = %e, "persisting the dropped trust key failed");
                }
            }

            if let Err(e) = self.forward(zombiegram.clone(), true).await {
                debug!(error = %e, "could not forward zombiegram");
            }
            if !carries_network_change && self.config.is_gateway() {
                self.bridge(&zombiegram);
            }
        }

        self.recent_by_source
            .lock()
            .entry(source_id)
            .or_insert_with(|| DropQueue::new(RECENT_SEQ_WINDOW))
            .append(seq_num);
    }

    async fn receive_loop(self: Arc<Self>, mut stop: watch::Receiver<bool>) {
        let mut buf = [0u8; MAX_FRAME_SIZE];
        loop {
            tokio::select! {
                _ = stop.changed() => {}
                received = self.mesh.recv_from(&mut buf) => match received {
                    // Zero-length reads are mandatory to skip.
                    Ok((0, _)) => {}
                    Ok((len, rcv_addr)) => self.process_frame(&buf[..len], rcv_addr).await,
                    Err(e) => {
                        error!(error = %e, "mesh receive failed");
                        sleep(Duration::from_millis(100)).await;
                    }
                }
            }
            if *stop.borrow() {
                break;
            }
        }
        debug!("receive task stopped");
    }

    async fn worker_loop(self: Arc<Self>, mut stop: watch::Receiver<bool>) {
        // Short poll until the mesh comes up; this is only a mesh boot.
        while !*stop.borrow() {
            tokio::select! {
                _ = stop.changed() => continue,
                _ = sleep(MESH_BOOT_POLL) => {}
            }
            if self.mesh.is_connected() {
                break;
            }
        }

        let mut ip = self.mesh.local_ip();
        while !*stop.borrow() {
            // Polling the IP triggers an internal refresh on some mesh stacks.
            let new_ip = self.mesh.local_ip();
            if new_ip != ip {
                info!(old = ?ip, new = ?new_ip, "LoRa mesh interface IP changed");
                ip = new_ip;
            }

            if self.is_network_ready() {
                let queued: Vec<(Priority, Vec<Payload>)> =
                    { self.outgoing_queue.lock().drain(..).collect() };
                if !queued.is_empty() {
                    let count = queued.len();
                    for (priority, payloads) in queued {
                        if let Err(e) = self.send(priority, payloads).await {
                            error!(error = %e, "sending a queued zombiegram failed");
                        }
                    }
                    info!(count, "queued zombiegrams were sent out");
                }
            }

            self.handle_retransmissions().await;

            tokio::select! {
                _ = stop.changed() => {}
                _ = sleep(MAINTENANCE_TICK) => {}
            }
        }

        self.mesh.deinit();
        self.outgoing_queue.lock().clear();
        self.package_acks.lock().clear();
        self.started.store(false, Ordering::SeqCst);
        info!("zombie router thread stopped, router is now inactive");
    }

    async fn handle_retransmissions(&self) {
        let neighbor_count = self.mesh.neighbors().len();
        let (mut pending, wiped) = {
            let mut caches = self.package_acks.lock();
            let mut pending = Vec::new();
            let mut wiped = 0;
            for cache in caches.values_mut() {
                let (cache_pending, cache_wiped) = cache.drain_completed(neighbor_count);
                pending.extend(cache_pending);
                wiped += cache_wiped;
            }
            (pending, wiped)
        };

        if neighbor_count == 0 {
            if wiped > 0 {
                debug!(wiped, "current neighbor count is 0, all retransmission caches were wiped");
            }
            return;
        }

        // Highest priority first; equal priorities keep their order.
        pending.sort_by(|a, b| b.priority().cmp(&a.priority()));
        for zombiegram in pending.into_iter().take(MAX_TRANSMISSIONS_PER_BURST) {
            debug!(source_id = zombiegram.source_id(), "retransmitting zombiegram to all neighbors");
            counter!("zg.retransmit.sent").increment(1);
            if let Err(e) = self.forward(zombiegram, false).await {
                debug!(error = %e, "retransmission skipped");
            }
        }
    }
}
