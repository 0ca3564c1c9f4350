use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::bail;
use bytes::Bytes;
use rustc_hash::FxHashMap;
use tokio::sync::mpsc;
use tokio::time::{sleep, Instant};
use tracing::{debug, info, warn};

use crate::auth::IdentityVerifier;
use crate::codec::MessageBuffer;
use crate::config::RelayConfig;
use crate::relay::client::Client;
use crate::relay::messages::{self, JoinRequest};
use crate::transport::endpoint::{RelayEndpoint, TransportEvent};
use crate::transport::wire::DeliveryMode;

/// roster, presence notifications, voice and passthrough traffic
pub const CONTROL_CHANNEL: u8 = 0;
/// position and skeletal updates, kept apart so they never stall control frames
pub const TELEMETRY_CHANNEL: u8 = 64;

/// The relay state machine: the client registry and everything that happens
///  between authenticated join and disconnect.
///
/// All state in here is owned by the main loop. The transport's receive task
///  only feeds the event channel; [RelayServer::step] drains it, services the
///  endpoint's timers and walks the telemetry fan-out.
pub struct RelayServer {
    endpoint: Arc<RelayEndpoint>,
    events: mpsc::UnboundedReceiver<TransportEvent>,
    verifier: Arc<dyn IdentityVerifier>,
    config: Arc<RelayConfig>,
    clients: FxHashMap<SocketAddr, Client>,
    next_network_id: i16,
    /// completions of the spawned identity-service calls
    join_results: mpsc::UnboundedReceiver<JoinOutcome>,
    join_sender: mpsc::UnboundedSender<JoinOutcome>,
}

/// What a token check against the identity service came back with.
struct JoinOutcome {
    from: SocketAddr,
    user_id: String,
    valid: bool,
}

impl RelayServer {
    pub fn new(
        endpoint: Arc<RelayEndpoint>,
        events: mpsc::UnboundedReceiver<TransportEvent>,
        verifier: Arc<dyn IdentityVerifier>,
        config: Arc<RelayConfig>,
    ) -> RelayServer {
        let (join_sender, join_results) = mpsc::unbounded_channel();
        RelayServer {
            endpoint,
            events,
            verifier,
            config,
            clients: Default::default(),
            next_network_id: 0,
            join_results,
            join_sender,
        }
    }

    pub async fn run(&mut self) {
        info!("relay serving on {:?}", self.endpoint.local_addr());
        loop {
            self.step().await;
            sleep(self.config.tick_interval).await;
        }
    }

    /// One iteration of the main loop: drain pending transport events, run the
    ///  endpoint's retransmission/timeout pass, then the telemetry fan-out.
    pub async fn step(&mut self) {
        while let Ok(outcome) = self.join_results.try_recv() {
            if let Err(e) = self.complete_join(outcome).await {
                warn!("error completing join: {:#}", e);
            }
        }
        while let Ok(event) = self.events.try_recv() {
            match event {
                TransportEvent::Message { from, payload } => {
                    if let Err(e) = self.dispatch(from, payload).await {
                        // a bad frame must never take the relay down
                        warn!(?from, "error handling frame: {:#}", e);
                    }
                }
                TransportEvent::PeerTimeout { addr } => self.on_peer_timeout(addr).await,
            }
        }
        self.endpoint.tick().await;
        self.broadcast_tick().await;
    }

    pub fn client_count(&self) -> usize {
        self.clients.len()
    }

    async fn dispatch(&mut self, from: SocketAddr, payload: Bytes) -> anyhow::Result<()> {
        let mut msg = MessageBuffer::from_bytes(&payload);
        let opcode = msg.read_i16()?;
        match opcode {
            messages::OP_JOIN => {
                self.on_join(from, messages::parse_join(&mut msg)?);
                Ok(())
            }
            messages::OP_DISCONNECT => self.on_disconnect(from).await,
            messages::OP_CLIENT_STATE => self.on_client_state(from, &mut msg),
            messages::OP_VOICE => self.on_voice(from, &payload).await,
            messages::OP_POSITION => self.on_position(from, &mut msg),
            messages::OP_SKELETAL => self.on_skeletal(from, &mut msg),
            _ => self.on_passthrough(from, &payload).await,
        }
    }

    /// Kicks off the token check. The identity-service round trip runs on its
    ///  own task so a slow response cannot hold up retransmissions, evictions
    ///  or the fan-out for everyone already connected; the outcome comes back
    ///  through [RelayServer::step].
    fn on_join(&mut self, from: SocketAddr, join: JoinRequest) {
        let verifier = self.verifier.clone();
        let results = self.join_sender.clone();
        tokio::spawn(async move {
            let valid = match verifier.verify_join(&join.user_id, &join.token).await {
                Ok(valid) => valid,
                Err(e) => {
                    debug!(?from, "identity service not reachable, dropping join: {:#}", e);
                    false
                }
            };
            let _ = results.send(JoinOutcome { from, user_id: join.user_id, valid });
        });
    }

    async fn complete_join(&mut self, outcome: JoinOutcome) -> anyhow::Result<()> {
        let JoinOutcome { from, user_id, valid } = outcome;
        if !valid {
            debug!(?from, user_id = %user_id, "join rejected by the identity service");
            return Ok(());
        }

        if self.clients.contains_key(&from) {
            debug!(?from, "ignoring join from an endpoint that is already registered");
            return Ok(());
        }

        let network_id = self.next_network_id;
        self.next_network_id += 1;
        info!(?from, network_id, user_id = %user_id, "client joined");

        let joined = messages::peer_joined(network_id, &user_id);
        self.broadcast(None, DeliveryMode::Reliable, CONTROL_CHANNEL, &joined).await;

        let entries: Vec<(i16, &str)> = self
            .clients
            .values()
            .map(|c| (c.network_id, c.user_id.as_str()))
            .collect();
        let roster = messages::roster(&entries);

        self.clients.insert(from, Client::new(network_id, user_id));
        self.endpoint
            .send(from, DeliveryMode::Reliable, CONTROL_CHANNEL, &roster)
            .await?;
        Ok(())
    }

    async fn on_disconnect(&mut self, from: SocketAddr) -> anyhow::Result<()> {
        let Some(client) = self.clients.remove(&from) else {
            return Ok(());
        };
        info!(?from, network_id = client.network_id, "client disconnected");

        // a fresh join from the same endpoint must not inherit sequence state
        self.endpoint.drop_peer(from).await;

        let frame = messages::peer_left(client.network_id);
        self.broadcast(None, DeliveryMode::Reliable, CONTROL_CHANNEL, &frame).await;
        Ok(())
    }

    async fn on_peer_timeout(&mut self, addr: SocketAddr) {
        let Some(client) = self.clients.remove(&addr) else {
            return;
        };
        info!(?addr, network_id = client.network_id, "client timed out");

        let frame = messages::peer_left(client.network_id);
        self.broadcast(None, DeliveryMode::Reliable, CONTROL_CHANNEL, &frame).await;
    }

    fn on_client_state(&mut self, from: SocketAddr, msg: &mut MessageBuffer) -> anyhow::Result<()> {
        let entries = messages::parse_client_state(msg)?;
        let Some(client) = self.clients.get_mut(&from) else {
            debug!(?from, "client-state frame from an endpoint that has not joined");
            return Ok(());
        };
        client.apply_state(entries);
        Ok(())
    }

    /// Voice goes only where both sides have granted audibility, and is
    ///  forwarded verbatim.
    async fn on_voice(&mut self, from: SocketAddr, frame: &Bytes) -> anyhow::Result<()> {
        let Some(sender) = self.clients.get(&from) else {
            debug!(?from, "voice frame from an endpoint that has not joined");
            return Ok(());
        };

        let recipients: Vec<SocketAddr> = self
            .clients
            .iter()
            .filter(|(&addr, receiver)| {
                addr != from
                    && sender.can_hear.contains(&receiver.network_id)
                    && receiver.can_hear.contains(&sender.network_id)
            })
            .map(|(&addr, _)| addr)
            .collect();

        for to in recipients {
            if let Err(e) = self
                .endpoint
                .send(to, DeliveryMode::ReliableSequenced, CONTROL_CHANNEL, frame)
                .await
            {
                warn!(?to, "error relaying voice frame: {:#}", e);
            }
        }
        Ok(())
    }

    fn on_position(&mut self, from: SocketAddr, msg: &mut MessageBuffer) -> anyhow::Result<()> {
        let payload = Self::telemetry_payload(msg)?;
        if let Some(client) = self.clients.get_mut(&from) {
            client.last_position = Some(payload);
        }
        Ok(())
    }

    fn on_skeletal(&mut self, from: SocketAddr, msg: &mut MessageBuffer) -> anyhow::Result<()> {
        let payload = Self::telemetry_payload(msg)?;
        if let Some(client) = self.clients.get_mut(&from) {
            client.last_skeletal = Some(payload);
        }
        Ok(())
    }

    fn telemetry_payload(msg: &mut MessageBuffer) -> anyhow::Result<Bytes> {
        let payload = msg.read_remaining();
        if payload.len() < 2 {
            bail!("telemetry payload shorter than the sender id prefix");
        }
        Ok(payload)
    }

    /// Unknown opcodes pass through to everyone else unmodified.
    async fn on_passthrough(&mut self, from: SocketAddr, frame: &Bytes) -> anyhow::Result<()> {
        if !self.clients.contains_key(&from) {
            debug!(?from, "frame from an endpoint that has not joined");
            return Ok(());
        }
        self.broadcast(Some(from), DeliveryMode::Reliable, CONTROL_CHANNEL, frame).await;
        Ok(())
    }

    async fn broadcast(
        &self,
        exclude: Option<SocketAddr>,
        mode: DeliveryMode,
        channel: u8,
        frame: &[u8],
    ) {
        for &addr in self.clients.keys() {
            if Some(addr) == exclude {
                continue;
            }
            if let Err(e) = self.endpoint.send(addr, mode, channel, frame).await {
                warn!(?addr, "error broadcasting frame: {:#}", e);
            }
        }
    }

    /// Walks every (sender, receiver) pair and emits the cached position and
    ///  skeletal payloads, paced by the pair's negotiated rate. The effective
    ///  rate is the minimum of what both sides asked for, so neither end is
    ///  overwhelmed. The sender-supplied id prefix is replaced with the
    ///  server-assigned id: peers cannot impersonate each other.
    async fn broadcast_tick(&mut self) {
        let now = Instant::now();
        let mut outgoing: Vec<(SocketAddr, Bytes)> = Vec::new();
        let mut stamped: Vec<(SocketAddr, i16)> = Vec::new();

        for (&receiver_addr, receiver) in &self.clients {
            for (&sender_addr, sender) in &self.clients {
                if sender_addr == receiver_addr {
                    continue;
                }
                if sender.last_position.is_none() && sender.last_skeletal.is_none() {
                    continue;
                }
                let Some(receiver_rate) = receiver.update_rates.get(&sender.network_id) else {
                    continue;
                };
                let Some(sender_rate) = sender.update_rates.get(&receiver.network_id) else {
                    continue;
                };

                let effective_rate = receiver_rate.per_second.min(sender_rate.per_second);
                let interval = Duration::from_secs_f64(1.0 / effective_rate as f64);
                if let Some(last_sent) = receiver_rate.last_sent {
                    if now.duration_since(last_sent) < interval {
                        continue;
                    }
                }

                if let Some(position) = &sender.last_position {
                    outgoing.push((
                        receiver_addr,
                        messages::telemetry(
                            messages::OP_POSITION,
                            sender.network_id,
                            effective_rate,
                            &position[2..],
                        ),
                    ));
                }
                if let Some(skeletal) = &sender.last_skeletal {
                    outgoing.push((
                        receiver_addr,
                        messages::telemetry(
                            messages::OP_SKELETAL,
                            sender.network_id,
                            effective_rate,
                            &skeletal[2..],
                        ),
                    ));
                }
                stamped.push((receiver_addr, sender.network_id));
            }
        }

        for (receiver_addr, sender_id) in stamped {
            if let Some(rate) = self
                .clients
                .get_mut(&receiver_addr)
                .and_then(|c| c.update_rates.get_mut(&sender_id))
            {
                rate.last_sent = Some(now);
            }
        }

        for (to, frame) in outgoing {
            if let Err(e) = self
                .endpoint
                .send(to, DeliveryMode::Reliable, TELEMETRY_CHANNEL, &frame)
                .await
            {
                warn!(?to, "error sending telemetry frame: {:#}", e);
            }
        }
    }
}
