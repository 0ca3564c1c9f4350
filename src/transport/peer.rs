use std::collections::BTreeMap;
use std::time::Duration;

use bytes::Bytes;
use rustc_hash::FxHashMap;
use tokio::time::Instant;

use crate::transport::wire::is_seq_newer;

/// Sequencing and retransmission state for one remote endpoint.
///
/// A peer exists only while traffic from it has been observed recently; the
///  endpoint evicts it after the configured silence. Every channel has its own
///  sequence space on both sides.
pub struct PeerState {
    /// next sequence to emit, per channel; post-incremented with wrap
    outgoing_seq: FxHashMap<u8, u8>,
    /// highest sequence accepted for delivery, per channel
    incoming_seq: FxHashMap<u8, u8>,
    /// ordered-channel payloads waiting for their predecessors
    reorder: FxHashMap<u8, BTreeMap<u8, Bytes>>,
    /// reliable frames sent but not yet acknowledged, keyed by (channel, sequence)
    unacked: FxHashMap<(u8, u8), UnackedFrame>,
    last_active: Instant,
}

struct UnackedFrame {
    /// the complete datagram including its header, resent verbatim
    datagram: Bytes,
    last_sent: Instant,
    retries: u32,
}

impl PeerState {
    pub fn new(now: Instant) -> PeerState {
        PeerState {
            outgoing_seq: Default::default(),
            incoming_seq: Default::default(),
            reorder: Default::default(),
            unacked: Default::default(),
            last_active: now,
        }
    }

    /// Refreshes liveness. Called for received traffic only: the server's own
    ///  outbound broadcasts must not keep a silent peer alive.
    pub fn touch(&mut self, now: Instant) {
        self.last_active = now;
    }

    pub fn is_expired(&self, now: Instant, timeout: Duration) -> bool {
        now.duration_since(self.last_active) > timeout
    }

    pub fn next_sequence(&mut self, channel: u8) -> u8 {
        let counter = self.outgoing_seq.entry(channel).or_insert(0);
        let sequence = *counter;
        *counter = counter.wrapping_add(1);
        sequence
    }

    /// Sequenced disciplines: accept and advance the watermark if the frame is
    ///  newer than anything delivered on the channel so far. The first frame on
    ///  a channel is always accepted.
    pub fn accept_sequenced(&mut self, channel: u8, sequence: u8) -> bool {
        match self.incoming_seq.get(&channel) {
            Some(&watermark) if !is_seq_newer(sequence, watermark) => false,
            _ => {
                self.incoming_seq.insert(channel, sequence);
                true
            }
        }
    }

    /// Ordered discipline: buffer the frame, then release the contiguous run
    ///  starting at the next expected sequence. An ordered channel expects
    ///  sequence 0 first, matching the sender's counter initialization.
    pub fn accept_ordered(&mut self, channel: u8, sequence: u8, payload: Bytes) -> Vec<Bytes> {
        if let Some(&watermark) = self.incoming_seq.get(&channel) {
            if !is_seq_newer(sequence, watermark) {
                // retransmit of something already delivered
                return Vec::new();
            }
        }

        let buffer = self.reorder.entry(channel).or_default();
        buffer.insert(sequence, payload);

        let mut released = Vec::new();
        loop {
            let expected = match self.incoming_seq.get(&channel) {
                Some(&watermark) => watermark.wrapping_add(1),
                None => 0,
            };
            match buffer.remove(&expected) {
                Some(payload) => {
                    self.incoming_seq.insert(channel, expected);
                    released.push(payload);
                }
                None => break,
            }
        }
        released
    }

    pub fn record_unacked(&mut self, channel: u8, sequence: u8, datagram: Bytes, now: Instant) {
        self.unacked.insert(
            (channel, sequence),
            UnackedFrame { datagram, last_sent: now, retries: 0 },
        );
    }

    /// Idempotent: acks for frames already cleared (or never tracked) are no-ops.
    pub fn acknowledge(&mut self, channel: u8, sequence: u8) {
        self.unacked.remove(&(channel, sequence));
    }

    /// One pass of the fixed retry schedule. Frames due for a resend are
    ///  returned for transmission; frames that exhausted the cap are dropped
    ///  without a final send and without any upward signal.
    pub fn collect_retransmits(
        &mut self,
        now: Instant,
        retry_interval: Duration,
        retry_limit: u32,
    ) -> Vec<Bytes> {
        let mut due = Vec::new();
        self.unacked.retain(|_, frame| {
            if now.duration_since(frame.last_sent) < retry_interval {
                return true;
            }
            if frame.retries >= retry_limit {
                return false;
            }
            frame.retries += 1;
            frame.last_sent = now;
            due.push(frame.datagram.clone());
            true
        });
        due
    }

    pub fn unacked_len(&self) -> usize {
        self.unacked.len()
    }

    #[cfg(test)]
    fn reorder_len(&self, channel: u8) -> usize {
        self.reorder.get(&channel).map(|b| b.len()).unwrap_or(0)
    }
}
