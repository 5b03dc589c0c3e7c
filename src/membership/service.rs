use anyhow::Result;
use dashmap::DashMap;
use parking_lot::Mutex;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::info;

use super::types::{GossipMessage, Member, MemberInfo, MemberState, MembershipEvent};

const GOSSIP_INTERVAL: Duration = Duration::from_millis(500);
const FAILURE_DETECTION_INTERVAL: Duration = Duration::from_secs(2);
pub const SUSPECT_TIMEOUT: Duration = Duration::from_secs(5);
pub const DEAD_TIMEOUT: Duration = Duration::from_secs(10);

pub struct MembershipService {
    pub local: MemberInfo,
    pub members: Arc<DashMap<String, Member>>,
    socket: Arc<UdpSocket>,
    incarnation: Mutex<u64>,
    events: mpsc::UnboundedSender<MembershipEvent>,
}

impl MembershipService {
    /// Binds the gossip socket and announces the local member to every seed.
    ///
    /// A port of 0 in `local.gossip_addr` is replaced by the bound port.
    pub async fn new(
        mut local: MemberInfo,
        seeds: Vec<SocketAddr>,
        events: mpsc::UnboundedSender<MembershipEvent>,
    ) -> Result<Arc<Self>> {
        let socket = UdpSocket::bind(local.gossip_addr).await?;
        local.gossip_addr = socket.local_addr()?;

        let local_member = Member {
            info: local.clone(),
            state: MemberState::Alive,
            incarnation: 1,
            last_seen: Some(Instant::now()),
        };
        let members = Arc::new(DashMap::new());
        members.insert(local.name.clone(), local_member.clone());

        if !seeds.is_empty() {
            info!("Joining cluster via {} seed node(s)", seeds.len());
            let encoded = bincode::serialize(&GossipMessage::Join {
                member: local_member,
            })?;
            for seed in seeds.iter() {
                socket.send_to(&encoded, seed).await?;
                info!("Sent join request to {}", seed);
            }
        }

        Ok(Arc::new(Self {
            local,
            members,
            socket: Arc::new(socket),
            incarnation: Mutex::new(1),
            events,
        }))
    }

    pub fn start(self: &Arc<Self>, shutdown: &broadcast::Sender<()>) -> Vec<JoinHandle<()>> {
        tracing::info!("Starting membership service for {}", self.local.name);
        vec![
            tokio::spawn(Arc::clone(self).gossip_loop(shutdown.subscribe())),
            tokio::spawn(Arc::clone(self).receive_loop(shutdown.subscribe())),
            tokio::spawn(Arc::clone(self).failure_detection_loop(shutdown.subscribe())),
        ]
    }

    pub fn incarnation(&self) -> u64 {
        *self.incarnation.lock()
    }

    pub fn get_alive_members(&self) -> Vec<Member> {
        self.members
            .iter()
            .filter(|entry| entry.value().state == MemberState::Alive)
            .map(|entry| entry.value().clone())
            .collect()
    }

    pub fn member_state(&self, name: &str) -> Option<MemberState> {
        self.members.get(name).map(|entry| entry.value().state)
    }

    fn emit(&self, event: MembershipEvent) {
        tracing::debug!("Membership event: {:?}", event);
        // The receiver only goes away while the node shuts down.
        let _ = self.events.send(event);
    }

    async fn gossip_loop(self: Arc<Self>, mut shutdown: broadcast::Receiver<()>) {
        let mut interval = tokio::time::interval(GOSSIP_INTERVAL);

        loop {
            tokio::select! {
                _ = interval.tick() => {}
                _ = shutdown.recv() => break,
            }

            let alive: Vec<MemberInfo> = self
                .members
                .iter()
                .filter(|entry| {
                    entry.key() != &self.local.name && entry.value().state == MemberState::Alive
                })
                .map(|entry| entry.value().info.clone())
                .collect();

            if alive.is_empty() {
                continue;
            }

            use rand::Rng;
            let target = &alive[rand::thread_rng().gen_range(0..alive.len())];

            let msg = GossipMessage::Ping {
                from: self.local.clone(),
                incarnation: self.incarnation(),
            };

            match bincode::serialize(&msg) {
                Ok(encoded) => {
                    if let Err(e) = self.socket.send_to(&encoded, target.gossip_addr).await {
                        tracing::warn!("Failed to send ping to {}: {}", target.name, e);
                    } else {
                        tracing::trace!("Sent ping to {}", target.name);
                    }
                }
                Err(e) => tracing::error!("Failed to serialize ping: {}", e),
            }
        }
    }

    async fn receive_loop(self: Arc<Self>, mut shutdown: broadcast::Receiver<()>) {
        let mut buf = vec![0u8; 65536];

        loop {
            let received = tokio::select! {
                received = self.socket.recv_from(&mut buf) => received,
                _ = shutdown.recv() => break,
            };

            match received {
                Ok((len, src)) => match bincode::deserialize::<GossipMessage>(&buf[..len]) {
                    Ok(msg) => {
                        if let Err(e) = self.handle_message(msg, src).await {
                            tracing::error!("Error handling message from {}: {}", src, e);
                        }
                    }
                    Err(e) => {
                        tracing::warn!("Failed to deserialize message from {}: {}", src, e);
                    }
                },
                Err(e) => {
                    tracing::error!("Failed to receive UDP packet: {}", e);
                    tokio::time::sleep(Duration::from_millis(100)).await;
                }
            }
        }
    }

    pub async fn handle_message(&self, msg: GossipMessage, src: SocketAddr) -> Result<()> {
        match msg {
            GossipMessage::Ping { from, incarnation } => self.handle_ping(from, incarnation, src).await,
            GossipMessage::Ack {
                from,
                incarnation,
                members,
            } => {
                self.handle_ack(&from, incarnation, members);
                Ok(())
            }
            GossipMessage::Join { member } => {
                tracing::info!("{} joining cluster at {}", member.info.name, member.info.gossip_addr);
                self.merge_member(member);
                tracing::info!("Cluster size now: {}", self.members.len());
                Ok(())
            }
            GossipMessage::Suspect { name, incarnation } => {
                self.handle_suspect(&name, incarnation).await;
                Ok(())
            }
            GossipMessage::Alive { name, incarnation } => {
                self.handle_alive(&name, incarnation);
                Ok(())
            }
        }
    }

    async fn handle_ping(&self, from: MemberInfo, incarnation: u64, src: SocketAddr) -> Result<()> {
        tracing::trace!("Received ping from {}", from.name);

        self.merge_member(Member {
            info: from.clone(),
            state: MemberState::Alive,
            incarnation,
            last_seen: None,
        });
        if let Some(mut member) = self.members.get_mut(&from.name) {
            member.last_seen = Some(Instant::now());
        }

        let reply = GossipMessage::Ack {
            from: self.local.name.clone(),
            incarnation: self.incarnation(),
            members: self.members.iter().map(|entry| entry.value().clone()).collect(),
        };
        let encoded = bincode::serialize(&reply)?;
        self.socket.send_to(&encoded, src).await?;

        Ok(())
    }

    fn handle_ack(&self, from: &str, incarnation: u64, members: Vec<Member>) {
        tracing::trace!("Received ack from {} with {} members", from, members.len());

        if let Some(mut member) = self.members.get_mut(from)
            && incarnation >= member.incarnation
        {
            member.incarnation = incarnation;
            member.last_seen = Some(Instant::now());
        }

        for member in members {
            self.merge_member(member);
        }
    }

    /// Folds a member reported by someone else into the local table.
    pub fn merge_member(&self, reported: Member) {
        if reported.info.name == self.local.name {
            return;
        }

        let event = match self.members.get_mut(&reported.info.name) {
            Some(mut existing) => {
                if reported.incarnation > existing.incarnation {
                    let was_dead = existing.state == MemberState::Dead;
                    let moved = existing.info != reported.info;
                    existing.info = reported.info.clone();
                    existing.state = reported.state;
                    existing.incarnation = reported.incarnation;
                    existing.last_seen = Some(Instant::now());

                    if was_dead && reported.state != MemberState::Dead {
                        tracing::info!("{} rejoined (inc={})", reported.info.name, reported.incarnation);
                        Some(MembershipEvent::Join(reported.info))
                    } else if !was_dead && reported.state == MemberState::Dead {
                        Some(MembershipEvent::Leave(reported.info.name))
                    } else if moved {
                        Some(MembershipEvent::Update(reported.info))
                    } else {
                        None
                    }
                } else if reported.incarnation == existing.incarnation
                    && reported.state == MemberState::Alive
                    && existing.state == MemberState::Suspect
                {
                    tracing::info!("{} refuted suspicion", reported.info.name);
                    existing.state = MemberState::Alive;
                    existing.last_seen = Some(Instant::now());
                    None
                } else {
                    None
                }
            }
            None => {
                if reported.state == MemberState::Dead {
                    return;
                }
                tracing::info!(
                    "Discovered new member {} at {}",
                    reported.info.name,
                    reported.info.gossip_addr
                );
                let info = reported.info.clone();
                let mut member = reported;
                member.last_seen = Some(Instant::now());
                self.members.insert(info.name.clone(), member);
                Some(MembershipEvent::Join(info))
            }
        };

        if let Some(event) = event {
            self.emit(event);
        }
    }

    async fn handle_suspect(&self, name: &str, incarnation: u64) {
        if name == self.local.name {
            let refuted = {
                let mut inc = self.incarnation.lock();
                if incarnation < *inc {
                    None
                } else {
                    *inc = incarnation + 1;
                    Some(*inc)
                }
            };
            if let Some(incarnation) = refuted {
                tracing::info!("Refuting suspicion of {} with incarnation {}", name, incarnation);
                if let Some(mut local) = self.members.get_mut(name) {
                    local.incarnation = incarnation;
                }
                self.broadcast_message(GossipMessage::Alive {
                    name: name.to_string(),
                    incarnation,
                })
                .await;
            }
            return;
        }

        match self.members.get_mut(name) {
            Some(mut existing) => {
                if incarnation >= existing.incarnation && existing.state == MemberState::Alive {
                    tracing::info!("{} at {} suspected", name, existing.info.gossip_addr);
                    existing.state = MemberState::Suspect;
                    existing.incarnation = incarnation;
                }
            }
            None => tracing::debug!("Suspected member {} is unknown", name),
        }
    }

    fn handle_alive(&self, name: &str, incarnation: u64) {
        let rejoined = match self.members.get_mut(name) {
            Some(mut existing) => {
                let refutes = incarnation > existing.incarnation
                    || (incarnation == existing.incarnation && existing.state == MemberState::Suspect);
                if !refutes {
                    return;
                }
                tracing::info!("{} is alive (inc={})", name, incarnation);
                let was_dead = existing.state == MemberState::Dead;
                existing.state = MemberState::Alive;
                existing.incarnation = incarnation;
                existing.last_seen = Some(Instant::now());
                was_dead.then(|| existing.info.clone())
            }
            None => {
                tracing::debug!("Alive message for unknown member {}", name);
                None
            }
        };

        if let Some(info) = rejoined {
            self.emit(MembershipEvent::Join(info));
        }
    }

    /// One failure-detection pass: Alive members silent past `SUSPECT_TIMEOUT` become
    /// Suspect, Suspect members silent past `DEAD_TIMEOUT` become Dead and leave.
    pub async fn detect_failures(&self) {
        let now = Instant::now();
        let mut suspects = Vec::new();
        let mut dead = Vec::new();

        for mut entry in self.members.iter_mut() {
            if entry.key() == &self.local.name {
                continue;
            }
            let member = entry.value_mut();
            let Some(last_seen) = member.last_seen else {
                member.last_seen = Some(now);
                continue;
            };
            let elapsed = now.duration_since(last_seen);

            match member.state {
                MemberState::Alive if elapsed > SUSPECT_TIMEOUT => {
                    tracing::warn!("{} suspected (no contact for {:?})", member.info.name, elapsed);
                    member.state = MemberState::Suspect;
                    suspects.push(GossipMessage::Suspect {
                        name: member.info.name.clone(),
                        incarnation: member.incarnation,
                    });
                }
                MemberState::Suspect if elapsed > DEAD_TIMEOUT => {
                    tracing::warn!("{} declared dead (no contact for {:?})", member.info.name, elapsed);
                    member.state = MemberState::Dead;
                    dead.push(member.info.name.clone());
                }
                _ => {}
            }
        }

        for name in dead {
            self.emit(MembershipEvent::Leave(name));
        }
        for msg in suspects {
            self.broadcast_message(msg).await;
        }
    }

    async fn failure_detection_loop(self: Arc<Self>, mut shutdown: broadcast::Receiver<()>) {
        let mut interval = tokio::time::interval(FAILURE_DETECTION_INTERVAL);

        loop {
            tokio::select! {
                _ = interval.tick() => self.detect_failures().await,
                _ = shutdown.recv() => break,
            }
        }
    }

    async fn broadcast_message(&self, msg: GossipMessage) {
        let encoded = match bincode::serialize(&msg) {
            Ok(encoded) => encoded,
            Err(e) => {
                tracing::error!("Failed to serialize {:?}: {}", msg, e);
                return;
            }
        };

        let targets: Vec<(String, SocketAddr)> = self
            .members
            .iter()
            .filter(|entry| {
                entry.key() != &self.local.name && entry.value().state == MemberState::Alive
            })
            .map(|entry| (entry.key().clone(), entry.value().info.gossip_addr))
            .collect();

        for (name, addr) in targets {
            if let Err(e) = self.socket.send_to(&encoded, addr).await {
                tracing::warn!("Failed to broadcast to {}: {}", name, e);
            }
        }
    }
}
