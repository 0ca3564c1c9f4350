use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Context;
use bytes::{Bytes, BytesMut};
use rustc_hash::FxHashMap;
use tokio::net::UdpSocket;
use tokio::sync::{mpsc, RwLock};
use tokio::time::Instant;
use tracing::{debug, trace, warn};

use crate::config::RelayConfig;
use crate::transport::peer::PeerState;
use crate::transport::wire::{DeliveryMode, FrameHeader, HEADER_LEN, MAX_DATAGRAM_LEN};

/// What the transport surfaces to the relay loop. Application payloads and
///  peer lifecycle share one FIFO so the relay observes them in arrival order,
///  and all client-state mutation stays on the consuming task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    /// a payload released by its channel's delivery discipline
    Message { from: SocketAddr, payload: Bytes },
    /// a peer went silent past the timeout and was removed
    PeerTimeout { addr: SocketAddr },
}

/// The datagram endpoint: one bound UDP socket, the per-peer reliability
///  registry, and the receive loop that drives it.
///
/// [RelayEndpoint::recv_loop] runs as its own task and never touches relay
///  state; everything it accepts is handed to the event channel. The owner is
///  expected to call [RelayEndpoint::tick] periodically to service
///  retransmissions and timeouts.
pub struct RelayEndpoint {
    socket: UdpSocket,
    peers: RwLock<FxHashMap<SocketAddr, PeerState>>,
    events: mpsc::UnboundedSender<TransportEvent>,
    config: Arc<RelayConfig>,
}

impl RelayEndpoint {
    pub async fn bind(
        config: Arc<RelayConfig>,
    ) -> anyhow::Result<(Arc<RelayEndpoint>, mpsc::UnboundedReceiver<TransportEvent>)> {
        let socket = UdpSocket::bind(config.bind_addr)
            .await
            .with_context(|| format!("binding relay socket on {}", config.bind_addr))?;
        let (events, events_recv) = mpsc::unbounded_channel();

        let endpoint = Arc::new(RelayEndpoint {
            socket,
            peers: Default::default(),
            events,
            config,
        });
        Ok((endpoint, events_recv))
    }

    pub fn local_addr(&self) -> anyhow::Result<SocketAddr> {
        Ok(self.socket.local_addr()?)
    }

    /// Blocking receive loop, one datagram at a time. Runs until the process
    ///  terminates; anything wrong with a single datagram is logged and the
    ///  loop moves on.
    pub async fn recv_loop(&self) {
        let mut buf = vec![0u8; MAX_DATAGRAM_LEN];
        loop {
            let (len, from) = match self.socket.recv_from(&mut buf).await {
                Ok(received) => received,
                Err(e) => {
                    warn!("error receiving datagram: {}", e);
                    continue;
                }
            };
            if let Err(e) = self.on_datagram(&buf[..len], from).await {
                debug!(?from, "dropping datagram: {}", e);
            }
        }
    }

    async fn on_datagram(&self, datagram: &[u8], from: SocketAddr) -> anyhow::Result<()> {
        let mut cursor = datagram;
        let header = FrameHeader::try_parse(&mut cursor)?;

        // acknowledge before taking the registry lock; the ack depends on the
        // header alone
        if let FrameHeader::Data { mode, channel, sequence } = header {
            if mode.is_reliable() {
                self.send_ack(from, channel, sequence).await;
            }
        }

        let payload = Bytes::copy_from_slice(cursor);
        let now = Instant::now();

        let mut peers = self.peers.write().await;
        let peer = peers.entry(from).or_insert_with(|| PeerState::new(now));
        peer.touch(now);

        match header {
            FrameHeader::Ack { channel, sequence } => {
                // payload bytes on an ack frame, if any, are ignored
                trace!(?from, channel, sequence, "ack");
                peer.acknowledge(channel, sequence);
            }
            FrameHeader::Data { mode, channel, sequence } => match mode {
                DeliveryMode::Unreliable | DeliveryMode::Reliable => {
                    self.emit_message(from, payload);
                }
                DeliveryMode::UnreliableSequenced | DeliveryMode::ReliableSequenced => {
                    if peer.accept_sequenced(channel, sequence) {
                        self.emit_message(from, payload);
                    }
                    else {
                        trace!(?from, channel, sequence, "dropping stale sequenced frame");
                    }
                }
                DeliveryMode::ReliableOrdered => {
                    for released in peer.accept_ordered(channel, sequence, payload) {
                        self.emit_message(from, released);
                    }
                }
            },
        }
        Ok(())
    }

    fn emit_message(&self, from: SocketAddr, payload: Bytes) {
        let _ = self.events.send(TransportEvent::Message { from, payload });
    }

    async fn send_ack(&self, to: SocketAddr, channel: u8, sequence: u8) {
        let mut buf = BytesMut::with_capacity(HEADER_LEN);
        FrameHeader::Ack { channel, sequence }.ser(&mut buf);
        if let Err(e) = self.socket.send_to(&buf, to).await {
            warn!(?to, "error sending ack: {}", e);
        }
    }

    /// Wraps an application payload with the next header for `(to, channel)`
    ///  and hands it to the socket. Reliable-class frames are recorded for
    ///  retransmission until acknowledged.
    pub async fn send(
        &self,
        to: SocketAddr,
        mode: DeliveryMode,
        channel: u8,
        payload: &[u8],
    ) -> anyhow::Result<()> {
        let now = Instant::now();
        let datagram = {
            let mut peers = self.peers.write().await;
            let peer = peers.entry(to).or_insert_with(|| PeerState::new(now));
            let sequence = peer.next_sequence(channel);

            let mut buf = BytesMut::with_capacity(HEADER_LEN + payload.len());
            FrameHeader::Data { mode, channel, sequence }.ser(&mut buf);
            buf.extend_from_slice(payload);
            let datagram = buf.freeze();

            if mode.is_reliable() {
                peer.record_unacked(channel, sequence, datagram.clone(), now);
            }
            datagram
        };

        self.socket
            .send_to(&datagram, to)
            .await
            .with_context(|| format!("sending {} bytes to {}", datagram.len(), to))?;
        Ok(())
    }

    /// Retransmission pass followed by timeout eviction. Called from the
    ///  relay's main loop on every iteration.
    pub async fn tick(&self) {
        let now = Instant::now();
        let mut retransmits: Vec<(SocketAddr, Bytes)> = Vec::new();
        let mut expired: Vec<SocketAddr> = Vec::new();
        {
            let mut peers = self.peers.write().await;
            for (addr, peer) in peers.iter_mut() {
                for datagram in
                    peer.collect_retransmits(now, self.config.retry_interval, self.config.retry_limit)
                {
                    retransmits.push((*addr, datagram));
                }
                if peer.is_expired(now, self.config.peer_timeout) {
                    expired.push(*addr);
                }
            }
            for addr in &expired {
                peers.remove(addr);
            }
        }

        for (to, datagram) in retransmits {
            trace!(?to, "retransmitting unacknowledged frame");
            if let Err(e) = self.socket.send_to(&datagram, to).await {
                warn!(?to, "error retransmitting frame: {}", e);
            }
        }
        for addr in expired {
            debug!(?addr, "peer timed out");
            let _ = self.events.send(TransportEvent::PeerTimeout { addr });
        }
    }

    /// Forgets a peer's reliability state without firing a timeout event, for
    ///  clean disconnects.
    pub async fn drop_peer(&self, addr: SocketAddr) {
        self.peers.write().await.remove(&addr);
    }

    pub async fn peer_count(&self) -> usize {
        self.peers.read().await.len()
    }
}

#[cfg(test)]
mod test {
    use std::time::Duration;

    use tokio::time::timeout;

    use crate::transport::wire::PROTOCOL_VERSION;

    use super::*;

    const RECV_TIMEOUT: Duration = Duration::from_secs(2);

    fn test_config() -> RelayConfig {
        let mut config = RelayConfig::new("127.0.0.1:0".parse().unwrap());
        config.retry_interval = Duration::from_millis(40);
        config.peer_timeout = Duration::from_millis(300);
        config
    }

    async fn bound_endpoint(
        config: RelayConfig,
    ) -> (Arc<RelayEndpoint>, mpsc::UnboundedReceiver<TransportEvent>, SocketAddr) {
        let (endpoint, events) = RelayEndpoint::bind(Arc::new(config)).await.unwrap();
        let addr = endpoint.local_addr().unwrap();
        let recv_endpoint = endpoint.clone();
        tokio::spawn(async move { recv_endpoint.recv_loop().await });
        (endpoint, events, addr)
    }

    /// a bare socket standing in for a remote peer, speaking raw headers
    struct RawPeer {
        socket: UdpSocket,
        server: SocketAddr,
    }

    impl RawPeer {
        async fn connect(server: SocketAddr) -> RawPeer {
            let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
            RawPeer { socket, server }
        }

        async fn send_data(&self, mode: DeliveryMode, channel: u8, sequence: u8, payload: &[u8]) {
            let mut buf = BytesMut::new();
            FrameHeader::Data { mode, channel, sequence }.ser(&mut buf);
            buf.extend_from_slice(payload);
            self.socket.send_to(&buf, self.server).await.unwrap();
        }

        async fn send_ack(&self, channel: u8, sequence: u8) {
            let mut buf = BytesMut::new();
            FrameHeader::Ack { channel, sequence }.ser(&mut buf);
            self.socket.send_to(&buf, self.server).await.unwrap();
        }

        async fn send_raw(&self, raw: &[u8]) {
            self.socket.send_to(raw, self.server).await.unwrap();
        }

        async fn recv_frame(&self) -> (FrameHeader, Bytes) {
            let mut buf = vec![0u8; MAX_DATAGRAM_LEN];
            let (len, _) = timeout(RECV_TIMEOUT, self.socket.recv_from(&mut buf))
                .await
                .expect("timed out waiting for a frame")
                .unwrap();
            let mut cursor = &buf[..len];
            let header = FrameHeader::try_parse(&mut cursor).unwrap();
            (header, Bytes::copy_from_slice(cursor))
        }
    }

    async fn expect_message(events: &mut mpsc::UnboundedReceiver<TransportEvent>) -> Bytes {
        match timeout(RECV_TIMEOUT, events.recv()).await.expect("no event").unwrap() {
            TransportEvent::Message { payload, .. } => payload,
            other => panic!("expected a message event, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_unreliable_payload_is_enqueued_without_ack() {
        let (_endpoint, mut events, addr) = bound_endpoint(test_config()).await;
        let peer = RawPeer::connect(addr).await;

        peer.send_data(DeliveryMode::Unreliable, 0, 0, b"hello").await;
        assert_eq!(expect_message(&mut events).await.as_ref(), b"hello");

        // no ack must come back for an unreliable frame
        assert!(timeout(Duration::from_millis(150), peer.recv_frame()).await.is_err());
    }

    #[tokio::test]
    async fn test_reliable_frame_is_acked() {
        let (_endpoint, mut events, addr) = bound_endpoint(test_config()).await;
        let peer = RawPeer::connect(addr).await;

        peer.send_data(DeliveryMode::Reliable, 3, 7, b"payload").await;
        let (header, _) = peer.recv_frame().await;
        assert_eq!(header, FrameHeader::Ack { channel: 3, sequence: 7 });
        assert_eq!(expect_message(&mut events).await.as_ref(), b"payload");
    }

    #[tokio::test]
    async fn test_sequenced_drops_stale_frames() {
        let (_endpoint, mut events, addr) = bound_endpoint(test_config()).await;
        let peer = RawPeer::connect(addr).await;

        peer.send_data(DeliveryMode::UnreliableSequenced, 0, 5, b"five").await;
        assert_eq!(expect_message(&mut events).await.as_ref(), b"five");

        peer.send_data(DeliveryMode::UnreliableSequenced, 0, 4, b"four").await;
        peer.send_data(DeliveryMode::UnreliableSequenced, 0, 6, b"six").await;
        // the stale frame must have been skipped
        assert_eq!(expect_message(&mut events).await.as_ref(), b"six");
    }

    #[tokio::test]
    async fn test_ordered_frames_released_in_order() {
        let (_endpoint, mut events, addr) = bound_endpoint(test_config()).await;
        let peer = RawPeer::connect(addr).await;

        for seq in [2u8, 0, 1] {
            peer.send_data(DeliveryMode::ReliableOrdered, 7, seq, &[seq]).await;
        }
        assert_eq!(expect_message(&mut events).await.as_ref(), &[0]);
        assert_eq!(expect_message(&mut events).await.as_ref(), &[1]);
        assert_eq!(expect_message(&mut events).await.as_ref(), &[2]);
    }

    #[tokio::test]
    async fn test_foreign_version_and_runt_datagrams_are_dropped() {
        let (endpoint, mut events, addr) = bound_endpoint(test_config()).await;
        let peer = RawPeer::connect(addr).await;

        peer.send_raw(&[PROTOCOL_VERSION | 0x01, 0, 0, 1, 2]).await;
        peer.send_raw(&[0x08]).await;
        peer.send_raw(&[]).await;

        // a well-formed frame still gets through afterwards
        peer.send_data(DeliveryMode::Unreliable, 0, 0, b"ok").await;
        assert_eq!(expect_message(&mut events).await.as_ref(), b"ok");
        assert_eq!(endpoint.peer_count().await, 1);
    }

    #[tokio::test]
    async fn test_ack_stops_retransmission() {
        let (endpoint, _events, addr) = bound_endpoint(test_config()).await;
        let peer = RawPeer::connect(addr).await;

        endpoint.send(peer.socket.local_addr().unwrap(), DeliveryMode::Reliable, 0, b"data")
            .await
            .unwrap();
        let (header, payload) = peer.recv_frame().await;
        assert_eq!(
            header,
            FrameHeader::Data { mode: DeliveryMode::Reliable, channel: 0, sequence: 0 }
        );
        assert_eq!(payload.as_ref(), b"data");

        peer.send_ack(0, 0).await;
        tokio::time::sleep(Duration::from_millis(60)).await;
        endpoint.tick().await;

        assert!(timeout(Duration::from_millis(120), peer.recv_frame()).await.is_err());
    }

    #[tokio::test]
    async fn test_unacked_frame_is_retransmitted_then_forgotten() {
        let mut config = test_config();
        config.retry_limit = 2;
        config.peer_timeout = Duration::from_secs(60);
        let (endpoint, _events, addr) = bound_endpoint(config).await;
        let peer = RawPeer::connect(addr).await;

        endpoint.send(peer.socket.local_addr().unwrap(), DeliveryMode::Reliable, 0, b"data")
            .await
            .unwrap();
        let _ = peer.recv_frame().await;

        // initial send plus two retries, then silence
        for _ in 0..2 {
            tokio::time::sleep(Duration::from_millis(50)).await;
            endpoint.tick().await;
            let (header, _) = peer.recv_frame().await;
            assert_eq!(
                header,
                FrameHeader::Data { mode: DeliveryMode::Reliable, channel: 0, sequence: 0 }
            );
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
        endpoint.tick().await;
        assert!(timeout(Duration::from_millis(120), peer.recv_frame()).await.is_err());
    }

    #[tokio::test]
    async fn test_unreliable_sends_are_not_tracked() {
        let (endpoint, _events, addr) = bound_endpoint(test_config()).await;
        let peer = RawPeer::connect(addr).await;
        let peer_addr = peer.socket.local_addr().unwrap();

        endpoint.send(peer_addr, DeliveryMode::Unreliable, 0, b"data").await.unwrap();
        let _ = peer.recv_frame().await;

        tokio::time::sleep(Duration::from_millis(60)).await;
        endpoint.tick().await;
        assert!(timeout(Duration::from_millis(120), peer.recv_frame()).await.is_err());
    }

    #[tokio::test]
    async fn test_silent_peer_is_evicted_exactly_once() {
        let (endpoint, mut events, addr) = bound_endpoint(test_config()).await;
        let peer = RawPeer::connect(addr).await;
        let peer_addr = peer.socket.local_addr().unwrap();

        peer.send_data(DeliveryMode::Unreliable, 0, 0, b"hello").await;
        assert_eq!(expect_message(&mut events).await.as_ref(), b"hello");

        tokio::time::sleep(Duration::from_millis(400)).await;
        endpoint.tick().await;
        endpoint.tick().await;

        match timeout(RECV_TIMEOUT, events.recv()).await.expect("no event").unwrap() {
            TransportEvent::PeerTimeout { addr } => assert_eq!(addr, peer_addr),
            other => panic!("expected a timeout event, got {:?}", other),
        }
        assert_eq!(endpoint.peer_count().await, 0);
        assert!(timeout(Duration::from_millis(100), events.recv()).await.is_err());
    }
}
