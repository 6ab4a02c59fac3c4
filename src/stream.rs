use crate::destination::StreamingDestination;
use crate::error::Result;
use crate::identity::{Identity, TransientVerifier, ED25519_PUBLIC_KEY_LEN, OFFLINE_SIGNATURE_HEADER_LEN};
use crate::protocol::{
    Packet, PacketBuilder, FLAG_CLOSE, FLAG_DELAY_REQUESTED, FLAG_ECHO, FLAG_FROM_INCLUDED,
    FLAG_MAX_PACKET_SIZE_INCLUDED, FLAG_NO_ACK, FLAG_OFFLINE_SIGNATURE, FLAG_RESET,
    FLAG_SIGNATURE_INCLUDED, FLAG_SYN, STREAMING_MTU, STREAMING_MTU_RATCHETS,
};
use crate::routing::{
    Lease, LeaseSet, OutboundTunnel, RoutingPath, RoutingSession, TunnelMessageBlock,
    LEASESET_CONFIRMATION_TIMEOUT, LEASE_ENDDATE_THRESHOLD,
};
use crate::send_buffer::{SendBuffer, SendBufferQueue, SendHandler};
use crate::timer::OneShot;
use rand::Rng;
use std::collections::{BTreeMap, VecDeque};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::{Mutex, Notify};
use tokio::time::Instant;
use tracing::{debug, error, info, trace, warn};

/// Assumed round-trip time before the first sample, in milliseconds
pub const INITIAL_RTT: u64 = 8000;
/// Congestion window at stream creation, in packets
pub const INITIAL_WINDOW_SIZE: u32 = 6;
pub const MIN_WINDOW_SIZE: u32 = 1;
pub const MAX_WINDOW_SIZE: u32 = 128;
/// Retransmission timeout before the first RTT sample, in milliseconds
pub const INITIAL_RTO: u64 = 9000;
pub const MIN_RTO: u64 = 500;
/// Initial interval between paced sends, in microseconds
pub const INITIAL_PACING_TIME: u64 = 1000 * INITIAL_RTT / INITIAL_WINDOW_SIZE as u64;
/// Smoothing factor for the RTT and jitter estimators
pub const RTT_EWMA_ALPHA: f64 = 0.125;
/// Floor for delayed-ack scheduling, in milliseconds
pub const MIN_SEND_ACK_TIMEOUT: u64 = 20;
/// How long a follow-on packet may wait for its SYN, in milliseconds
pub const SYN_TIMEOUT: u64 = 5000;
/// Delay request that chokes the sender down to a window of one, in milliseconds
pub const DELAY_CHOKING: u16 = 60000;
/// Resend attempts before the stream is reset
pub const MAX_NUM_RESEND_ATTEMPTS: u32 = 10;

/// Stream lifecycle; transitions are monotonic
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamStatus {
    /// Created, SYN not yet sent
    New,
    /// Established, can send and receive
    Open,
    /// Close requested, draining outbound data
    Closing,
    /// CLOSE exchanged
    Closed,
    /// Aborted by peer or by resend exhaustion
    Reset,
    /// Torn down, all timers cancelled
    Terminated,
}

/// An unacknowledged outbound packet
struct SentPacket {
    packet: Packet,
    send_time: Instant,
    resent: bool,
}

/// Engine state. All mutation happens under the stream's mutex, so every
/// inbound packet is processed to completion before the next one.
struct StreamInner {
    self_ref: Weak<Mutex<StreamInner>>,
    local: StreamingDestination,

    send_stream_id: u32,
    recv_stream_id: u32,
    sequence_number: u32,
    tunnels_change_sequence_number: u32,
    last_received_sequence_number: i64,
    previous_received_sequence_number: i64,
    status: StreamStatus,
    port: u16,

    is_ack_send_scheduled: bool,
    is_nacked: bool,
    is_send_time: bool,
    is_win_dropped: bool,
    is_timeout_resend: bool,

    remote_lease_set: Option<Arc<LeaseSet>>,
    remote_identity: Option<Arc<Identity>>,
    transient_verifier: Option<Arc<TransientVerifier>>,
    current_outbound_tunnel: Option<Arc<dyn OutboundTunnel>>,
    current_remote_lease: Option<Lease>,
    routing_session: Option<Arc<dyn RoutingSession>>,

    rtt: f64,
    prev_rtt_sample: f64,
    prev_rtt: f64,
    jitter: f64,
    rto: u64,
    window_size: u32,
    min_pacing_time: u64,
    pacing_time: u64,
    ack_delay: u64,
    mtu: usize,
    num_resend_attempts: u32,
    num_sent_bytes: u64,
    num_received_bytes: u64,

    send_buffer: SendBufferQueue,
    sent_packets: BTreeMap<u32, SentPacket>,
    saved_packets: BTreeMap<u32, Packet>,
    receive_queue: VecDeque<Packet>,
    read_notify: Arc<Notify>,

    send_timer: OneShot,
    resend_timer: OneShot,
    ack_send_timer: OneShot,
}

impl StreamInner {
    fn is_established(&self) -> bool {
        self.send_stream_id != 0
    }

    // ── reception ─────────────────────────────────────────────────────────

    fn handle_next_packet(&mut self, packet: Packet) {
        if self.status == StreamStatus::Terminated {
            return;
        }
        self.num_received_bytes += packet.len() as u64;
        if self.send_stream_id == 0 {
            self.send_stream_id = packet.receive_stream_id();
            if self.remote_identity.is_none() && packet.nack_count() == 8 {
                // first inbound packet carries the expected destination hash
                let owner = self.local.owner();
                let local_hash = *owner.private_keys().identity().ident_hash();
                if packet.nack_bytes() != local_hash.as_bytes() {
                    warn!("Destination mismatch for {:?}", local_hash);
                    return;
                }
            }
        }

        if !packet.is_no_ack() {
            self.process_ack(&packet);
        }

        let received_seqn = packet.seqn();
        if packet.is_plain_ack() {
            trace!("Plain ACK received, sSID={}", self.send_stream_id);
            return;
        }
        if received_seqn == 0 && packet.flags() == FLAG_DELAY_REQUESTED && packet.option_size() >= 2 {
            // bare ack carrying a delay request; honor it before the
            // sequence classifier mistakes it for a duplicate
            let option_data = packet.option_data();
            let delay = u16::from_be_bytes([option_data[0], option_data[1]]);
            if !self.is_ack_send_scheduled && delay > 0 && (delay as f64) < self.rtt {
                self.schedule_ack(delay as u64);
            }
            if delay >= DELAY_CHOKING {
                debug!("Choked by peer, sSID={}", self.send_stream_id);
                self.window_size = 1;
            }
            return;
        }

        debug!("Received seqn={} on sSID={}", received_seqn, self.send_stream_id);
        if received_seqn as i64 == self.last_received_sequence_number + 1 {
            // next in sequence
            let was_syn = packet.is_syn();
            self.process_packet(packet);
            if self.status == StreamStatus::Terminated {
                return;
            }

            // drain saved packets while contiguous
            loop {
                let next = (self.last_received_sequence_number + 1) as u32;
                match self.saved_packets.remove(&next) {
                    Some(saved) => {
                        self.process_packet(saved);
                        if self.status == StreamStatus::Terminated {
                            return;
                        }
                    }
                    None => break,
                }
            }

            if self.status == StreamStatus::Open {
                if !self.is_ack_send_scheduled {
                    let ack_timeout = ((self.rtt / 10.0) as u64).min(self.ack_delay);
                    self.schedule_ack(ack_timeout);
                }
            } else if was_syn {
                // answer an incoming connection with our own SYN
                self.send_buffered();
            }
        } else if received_seqn as i64 <= self.last_received_sequence_number {
            // duplicate
            warn!(
                "Duplicate message {} on sSID={}",
                received_seqn, self.send_stream_id
            );
            if received_seqn as i64 <= self.previous_received_sequence_number
                || received_seqn as i64 == self.last_received_sequence_number
            {
                // loss on the return path: rotate tunnel and lease
                let owner = self.local.owner();
                self.current_outbound_tunnel = owner
                    .tunnel_pool()
                    .next_outbound_tunnel(self.current_outbound_tunnel.as_ref(), None);
                self.tunnels_change_sequence_number = self.sequence_number;
                self.update_current_remote_lease(false);
            }
            self.previous_received_sequence_number = received_seqn as i64;
            self.send_quick_ack();
        } else {
            // out of order
            warn!(
                "Missing messages on sSID={}: from {} to {}",
                self.send_stream_id,
                self.last_received_sequence_number + 1,
                received_seqn as i64 - 1
            );
            self.save_packet(packet);
            if self.last_received_sequence_number >= 0 {
                if !self.is_ack_send_scheduled {
                    // NACK the missing range
                    let ack_timeout =
                        (MIN_SEND_ACK_TIMEOUT * self.saved_packets.len() as u64).min(self.ack_delay);
                    self.schedule_ack(ack_timeout);
                }
            } else {
                // wait for the SYN
                self.schedule_ack(SYN_TIMEOUT);
            }
        }
    }

    fn save_packet(&mut self, packet: Packet) {
        self.saved_packets.entry(packet.seqn()).or_insert(packet);
    }

    fn process_packet(&mut self, mut packet: Packet) {
        let received_seqn = packet.seqn();
        let mut flags = packet.flags();
        trace!("Process seqn={}, flags={:#x}", received_seqn, flags);

        if !self.process_options(&mut flags, &mut packet) {
            self.terminate(true);
            return;
        }

        if !packet.payload().is_empty() {
            self.receive_queue.push_back(packet);
            self.read_notify.notify_waiters();
        }
        self.last_received_sequence_number = received_seqn as i64;

        if flags & FLAG_RESET != 0 {
            debug!(
                "Closing stream sSID={}, rSID={}: reset flag received in packet #{}",
                self.send_stream_id, self.recv_stream_id, received_seqn
            );
            self.status = StreamStatus::Reset;
            self.close_internal();
        } else if flags & FLAG_CLOSE != 0 {
            if self.status != StreamStatus::Closed {
                self.send_close();
            }
            self.status = StreamStatus::Closed;
            self.terminate(true);
        }
    }

    /// Parse options in flag order. Returns false when the packet must be
    /// dropped and the stream terminated; a failed signature instead closes
    /// the stream and raises CLOSE on the caller's flags so close semantics
    /// are delivered downstream.
    fn process_options(&mut self, flags: &mut u16, packet: &mut Packet) -> bool {
        let options_offset = packet.options_offset();
        let option_data = packet.option_data().to_vec();
        let mut pos = 0usize;

        if *flags & FLAG_DELAY_REQUESTED != 0 {
            if pos + 2 > option_data.len() {
                return false;
            }
            let delay = u16::from_be_bytes([option_data[pos], option_data[pos + 1]]);
            if !self.is_ack_send_scheduled {
                if delay > 0 && (delay as f64) < self.rtt {
                    self.schedule_ack(delay as u64);
                }
                if delay >= DELAY_CHOKING {
                    // peer-requested choke
                    self.window_size = 1;
                }
            }
            pos += 2;
        }

        if *flags & FLAG_FROM_INCLUDED != 0 {
            let identity = if let Some(lease_set) = &self.remote_lease_set {
                lease_set.identity().clone()
            } else if let Some(identity) = &self.remote_identity {
                identity.clone()
            } else {
                match Identity::from_bytes(&option_data[pos..]) {
                    Ok((identity, _)) => Arc::new(identity),
                    Err(e) => {
                        warn!("Malformed FROM option: {}", e);
                        return false;
                    }
                }
            };
            if identity.is_rsa() {
                info!(
                    "Incoming stream from RSA destination {:?} discarded",
                    identity.ident_hash()
                );
                return false;
            }
            pos += identity.full_len();
            if self.remote_lease_set.is_none() && self.remote_identity.is_none() {
                debug!(
                    "Incoming stream from {:?}, sSID={}, rSID={}",
                    identity.ident_hash(),
                    self.send_stream_id,
                    self.recv_stream_id
                );
            }
            self.remote_identity = Some(identity);
        }

        if *flags & FLAG_MAX_PACKET_SIZE_INCLUDED != 0 {
            if pos + 2 > option_data.len() {
                return false;
            }
            let max_packet_size = u16::from_be_bytes([option_data[pos], option_data[pos + 1]]);
            debug!("Max packet size {}", max_packet_size);
            pos += 2;
        }

        if *flags & FLAG_OFFLINE_SIGNATURE != 0 {
            let Some(identity) = self.remote_identity.clone() else {
                info!("Offline signature without identity");
                return false;
            };
            if let Some(lease_set) = &self.remote_lease_set {
                // reuse the verifier the lease set already parsed
                self.transient_verifier = lease_set.transient_verifier();
            }
            if self.transient_verifier.is_some() {
                pos += OFFLINE_SIGNATURE_HEADER_LEN + ED25519_PUBLIC_KEY_LEN + identity.signature_len();
            } else {
                match TransientVerifier::from_bytes(&identity, &option_data[pos..]) {
                    Ok((verifier, consumed)) => {
                        self.transient_verifier = Some(Arc::new(verifier));
                        pos += consumed;
                    }
                    Err(e) => {
                        error!("Offline signature failed: {}", e);
                        return false;
                    }
                }
            }
        }

        if *flags & FLAG_SIGNATURE_INCLUDED != 0 {
            let signature_len = match (&self.transient_verifier, &self.remote_identity) {
                (Some(verifier), _) => verifier.signature_len(),
                (None, Some(identity)) => identity.signature_len(),
                (None, None) => {
                    info!("Signature without identity");
                    return false;
                }
            };
            if pos + signature_len > option_data.len() {
                return false;
            }
            let transient = self.transient_verifier.clone();
            let identity = self.remote_identity.clone();
            let verified =
                packet.verify_with(options_offset + pos, signature_len, |image, signature| {
                    match (&transient, &identity) {
                        (Some(verifier), _) => verifier.verify(image, signature),
                        (None, Some(identity)) => identity.verify(image, signature),
                        (None, None) => false,
                    }
                });
            if !verified {
                error!(
                    "Signature verification failed, sSID={}, rSID={}",
                    self.send_stream_id, self.recv_stream_id
                );
                self.close_internal();
                *flags |= FLAG_CLOSE;
            }
            pos += signature_len;
        }
        let _ = pos;
        true
    }

    // ── acknowledgement and congestion control ────────────────────────────

    fn process_ack(&mut self, packet: &Packet) {
        let mut acknowledged = false;
        let now = Instant::now();
        let ack_through = packet.ack_through();
        if ack_through > self.sequence_number {
            error!(
                "Unexpected ackThrough={} > seqn={}",
                ack_through, self.sequence_number
            );
            return;
        }
        let mut rtt_sample = u64::MAX;
        let mut first_rtt_sample = false;
        self.is_nacked = false;
        let nack_count = packet.nack_count();

        let acked: Vec<u32> = self
            .sent_packets
            .range(..=ack_through)
            .map(|(&seqn, _)| seqn)
            .collect();
        for seqn in acked {
            let nacked = (0..nack_count).any(|i| packet.nack(i) == seqn);
            if nacked {
                debug!("Packet {} NACK", seqn);
                self.is_nacked = true;
                continue;
            }
            let Some(sent) = self.sent_packets.remove(&seqn) else {
                continue;
            };
            let rtt = now.saturating_duration_since(sent.send_time).as_millis() as u64;
            if seqn == 0 {
                first_rtt_sample = true;
                rtt_sample = rtt.max(1);
            } else if !sent.resent && seqn > self.tunnels_change_sequence_number {
                rtt_sample = rtt_sample.min(rtt);
            }
            trace!("Packet {} acknowledged rtt={}", seqn, rtt);
            acknowledged = true;
            if self.window_size < MAX_WINDOW_SIZE {
                self.window_size += 1;
            }
        }

        if rtt_sample != u64::MAX {
            let rtt_sample = rtt_sample as f64;
            if first_rtt_sample {
                self.rtt = rtt_sample;
                self.prev_rtt_sample = rtt_sample;
            } else {
                self.rtt = RTT_EWMA_ALPHA * rtt_sample + (1.0 - RTT_EWMA_ALPHA) * self.rtt;
            }
            let jitter = if rtt_sample != self.prev_rtt_sample {
                (rtt_sample - self.prev_rtt_sample).abs()
            } else {
                (rtt_sample / 10.0).round()
            };
            self.jitter = (RTT_EWMA_ALPHA * jitter + (1.0 - RTT_EWMA_ALPHA) * self.jitter).round();
            self.prev_rtt_sample = rtt_sample;

            // delay-based congestion control: drop the window when RTT grows
            // too fast (late detection)
            if self.rtt > self.prev_rtt && !self.is_win_dropped {
                self.window_size >>= 1;
                self.is_win_dropped = true;
            }
            if self.window_size < MIN_WINDOW_SIZE {
                self.window_size = MIN_WINDOW_SIZE;
            }
            self.update_pacing_time();
            self.prev_rtt = self.rtt * 1.1 + self.jitter;

            let was_initial = self.rto == INITIAL_RTO;
            self.rto = MIN_RTO.max((self.rtt * 1.3 + self.jitter).round() as u64);
            if was_initial {
                self.schedule_resend();
            }
        }

        if self.window_size > self.sent_packets.len() as u32 {
            self.is_win_dropped = false;
        }
        if acknowledged || self.is_nacked {
            self.schedule_resend();
        }
        if (self.send_buffer.is_empty() && !self.sent_packets.is_empty())
            || self.sent_packets.len() as u32 > self.window_size
        {
            // tail loss or window overshoot: fast retransmit at the next tick
            self.is_nacked = true;
        }
        if first_rtt_sample {
            if let (Some(session), Some(tunnel), Some(lease)) = (
                &self.routing_session,
                &self.current_outbound_tunnel,
                &self.current_remote_lease,
            ) {
                session.set_shared_routing_path(Some(RoutingPath {
                    outbound_tunnel: tunnel.clone(),
                    remote_lease: lease.clone(),
                    rtt: self.rtt as u64,
                }));
            }
        }
        if self.sent_packets.is_empty() && self.send_buffer.is_empty() {
            self.resend_timer.cancel();
            self.send_timer.cancel();
        }
        if acknowledged {
            self.num_resend_attempts = 0;
            self.send_buffered();
        }
        match self.status {
            StreamStatus::Closed => self.terminate(true),
            StreamStatus::Closing => self.close_internal(),
            _ => {}
        }
    }

    // ── transmission and packetization ────────────────────────────────────

    fn send_buffered(&mut self) {
        self.schedule_send();
        if self.window_size <= self.sent_packets.len() as u32 || !self.is_send_time {
            return; // window is full or pacing forbids sending
        }
        let mut num_msgs = 1; // pacing dominates: one packet per tick
        let is_no_ack = self.last_received_sequence_number < 0;
        let owner = self.local.owner();
        let mut packets = Vec::new();

        while self.status == StreamStatus::New
            || (self.is_established() && !self.send_buffer.is_empty() && num_msgs > 0)
        {
            let ack_through = if is_no_ack {
                0
            } else {
                self.last_received_sequence_number as u32
            };
            let mut builder = PacketBuilder::new(
                self.send_stream_id,
                self.recv_stream_id,
                self.sequence_number,
                ack_through,
            );
            self.sequence_number += 1;
            if self.status == StreamStatus::New && self.send_stream_id == 0 {
                if let Some(identity) = &self.remote_identity {
                    // first SYN: NACK slots carry the remote destination hash
                    builder = builder.destination_hash(*identity.ident_hash().as_bytes());
                }
            }
            builder = builder.resend_delay((self.rto / 1000) as u8);

            let packet = if self.status == StreamStatus::New {
                self.status = StreamStatus::Open;
                if self.remote_lease_set.is_none() {
                    if let Some(identity) = self.remote_identity.clone() {
                        self.remote_lease_set = owner.find_lease_set(identity.ident_hash());
                    }
                }
                if let Some(lease_set) = &self.remote_lease_set {
                    let session = owner.routing_session(lease_set);
                    self.mtu = if session.is_ratchets() {
                        STREAMING_MTU_RATCHETS
                    } else {
                        STREAMING_MTU
                    };
                    self.routing_session = Some(session);
                }
                let keys = owner.private_keys();
                let mut flags = FLAG_SYN
                    | FLAG_FROM_INCLUDED
                    | FLAG_SIGNATURE_INCLUDED
                    | FLAG_MAX_PACKET_SIZE_INCLUDED;
                if is_no_ack {
                    flags |= FLAG_NO_ACK;
                }
                if keys.is_offline_signature() {
                    flags |= FLAG_OFFLINE_SIGNATURE;
                }
                builder = builder
                    .flags(flags)
                    .option_from(keys.identity().to_bytes())
                    .option_max_packet_size(self.mtu as u16);
                if let Some(block) = keys.offline_signature_block() {
                    builder = builder.option_offline_signature(block);
                }
                let payload = self.send_buffer.get(self.mtu);
                builder
                    .option_signature(keys.signature_len())
                    .payload(payload)
                    .build_signed(|image| keys.sign(image))
            } else {
                // follow-on packet: no flags, no options
                builder.payload(self.send_buffer.get(self.mtu)).build()
            };
            packets.push(packet);
            num_msgs -= 1;
        }

        if !packets.is_empty() {
            if self.saved_packets.is_empty() {
                // nothing to NACK
                self.is_ack_send_scheduled = false;
                self.ack_send_timer.cancel();
            }
            let was_empty = self.sent_packets.is_empty();
            let now = Instant::now();
            let mut images = Vec::with_capacity(packets.len());
            for packet in packets {
                images.push((packet.as_bytes().to_vec(), packet.is_syn()));
                self.sent_packets.insert(
                    packet.seqn(),
                    SentPacket {
                        packet,
                        send_time: now,
                        resent: false,
                    },
                );
            }
            self.send_packets(images);
            self.is_send_time = false;
            if self.status == StreamStatus::Closing && self.send_buffer.is_empty() {
                self.send_close();
            }
            if was_empty {
                self.schedule_resend();
            }
        }
    }

    fn send_quick_ack(&mut self) {
        let mut last_received = self.last_received_sequence_number;
        if let Some((&max_saved, _)) = self.saved_packets.iter().next_back() {
            if max_saved as i64 > last_received {
                last_received = max_saved as i64;
            }
        }
        if last_received < 0 {
            error!("No packets have been received yet");
            return;
        }

        let mut ack_through = last_received as u32;
        let mut nacks = Vec::new();
        let mut choking = false;
        if last_received > self.last_received_sequence_number {
            // NACK every gap below the highest saved packet
            let mut next_seqn = (self.last_received_sequence_number + 1) as u32;
            for &seqn in self.saved_packets.keys() {
                if nacks.len() + (seqn - next_seqn) as usize >= 256 {
                    error!(
                        "Number of NACKs exceeds 256, seqn={} nextSeqn={}",
                        seqn, next_seqn
                    );
                    // choke the sender and only ack what is fully covered
                    ack_through = next_seqn - 1;
                    choking = true;
                    break;
                }
                for missing in next_seqn..seqn {
                    nacks.push(missing);
                }
                next_seqn = seqn + 1;
            }
        }

        let num_nacks = nacks.len();
        let mut builder = PacketBuilder::new(self.send_stream_id, self.recv_stream_id, 0, ack_through)
            .nacks(nacks)
            .flags(if choking { FLAG_DELAY_REQUESTED } else { 0 });
        if choking {
            builder = builder.option_delay(DELAY_CHOKING);
        }
        let packet = builder.build();
        self.send_packets(vec![(packet.as_bytes().to_vec(), false)]);
        debug!("Quick Ack sent, {} NACKs", num_nacks);
    }

    fn send_close(&mut self) {
        let owner = self.local.owner();
        let keys = owner.private_keys();
        let seqn = self.sequence_number;
        self.sequence_number += 1;
        let packet = PacketBuilder::new(
            self.send_stream_id,
            self.recv_stream_id,
            seqn,
            self.last_received_sequence_number.max(0) as u32,
        )
        .flags(FLAG_CLOSE | FLAG_SIGNATURE_INCLUDED)
        .option_signature(keys.signature_len())
        .build_signed(|image| keys.sign(image));
        self.send_packet(packet);
        debug!("CLOSE sent, sSID={}", self.send_stream_id);
    }

    fn send_ping(&mut self) {
        let owner = self.local.owner();
        let keys = owner.private_keys();
        let mut flags = FLAG_ECHO | FLAG_SIGNATURE_INCLUDED | FLAG_FROM_INCLUDED;
        if keys.is_offline_signature() {
            flags |= FLAG_OFFLINE_SIGNATURE;
        }
        let mut builder = PacketBuilder::new(self.recv_stream_id, 0, 0, 0)
            .flags(flags)
            .option_from(keys.identity().to_bytes());
        if let Some(block) = keys.offline_signature_block() {
            builder = builder.option_offline_signature(block);
        }
        let packet = builder
            .option_signature(keys.signature_len())
            .build_signed(|image| keys.sign(image));
        let len = packet.len();
        self.send_packets(vec![(packet.as_bytes().to_vec(), false)]);
        debug!("Ping of {} bytes sent", len);
    }

    fn handle_ping(&mut self, packet: &mut Packet) {
        let mut flags = packet.flags();
        if self.process_options(&mut flags, packet) && self.remote_identity.is_some() {
            // pong: minimal header echoing the ping's payload back to the
            // stream id the ping came from
            let pong = PacketBuilder::new(0, packet.send_stream_id(), 0, 0)
                .flags(FLAG_ECHO)
                .payload(packet.payload().to_vec())
                .build();
            let len = pong.len();
            self.send_packets(vec![(pong.as_bytes().to_vec(), false)]);
            debug!("Pong of {} bytes sent", len);
        }
    }

    /// Queue a single pre-built packet (CLOSE) for reliable delivery
    fn send_packet(&mut self, packet: Packet) {
        if self.is_ack_send_scheduled {
            self.is_ack_send_scheduled = false;
            self.ack_send_timer.cancel();
        }
        let image = (packet.as_bytes().to_vec(), packet.is_syn());
        let was_empty = self.sent_packets.is_empty();
        self.sent_packets.insert(
            packet.seqn(),
            SentPacket {
                packet,
                send_time: Instant::now(),
                resent: false,
            },
        );
        self.send_packets(vec![image]);
        if was_empty {
            self.schedule_resend();
        }
    }

    /// Wrap wire images into the routing session and hand them to the current
    /// outbound tunnel, refreshing lease and tunnel as needed.
    fn send_packets(&mut self, images: Vec<(Vec<u8>, bool)>) {
        let owner = self.local.owner();
        if self.remote_lease_set.is_none() {
            self.update_current_remote_lease(false);
            if self.remote_lease_set.is_none() {
                error!(
                    "Can't send packets, missing remote LeaseSet, sSID={}",
                    self.send_stream_id
                );
                return;
            }
        }
        let needs_session = match &self.routing_session {
            None => true,
            // expired and detached, or a new session was sent
            Some(session) => session.is_terminated() || !session.is_ready_to_send(),
        };
        if needs_session {
            if let Some(lease_set) = &self.remote_lease_set {
                self.routing_session = Some(owner.routing_session(lease_set));
            }
        }
        if self.current_outbound_tunnel.is_none() {
            // first message to send: try the shared path
            if let Some(path) = self
                .routing_session
                .as_ref()
                .and_then(|session| session.shared_routing_path())
            {
                self.current_outbound_tunnel = Some(path.outbound_tunnel);
                self.current_remote_lease = Some(path.remote_lease);
                self.rtt = path.rtt as f64;
                self.rto = MIN_RTO.max((self.rtt * 1.3 + self.jitter).round() as u64);
            }
        }

        let now = Instant::now();
        let near_expiry = match &self.current_remote_lease {
            None => true,
            Some(lease) => now + LEASE_ENDDATE_THRESHOLD >= lease.end_date,
        };
        if near_expiry {
            self.update_current_remote_lease(true);
        }
        let lease = match &self.current_remote_lease {
            Some(lease) if now < lease.end_date + LEASE_ENDDATE_THRESHOLD => lease.clone(),
            _ => {
                warn!("Remote lease is not available, sSID={}", self.send_stream_id);
                if let Some(session) = &self.routing_session {
                    session.set_shared_routing_path(None); // invalidate routing path
                }
                return;
            }
        };

        let mut fresh_tunnel = false;
        let established = self
            .current_outbound_tunnel
            .as_ref()
            .map(|tunnel| tunnel.is_established())
            .unwrap_or(false);
        if self.current_outbound_tunnel.is_none() {
            self.current_outbound_tunnel = owner
                .tunnel_pool()
                .next_outbound_tunnel(None, Some(&lease.tunnel_gateway));
            fresh_tunnel = true;
        } else if !established {
            let (tunnel, fresh) = owner
                .tunnel_pool()
                .new_outbound_tunnel(self.current_outbound_tunnel.as_ref());
            self.current_outbound_tunnel = tunnel;
            fresh_tunnel = fresh;
        }
        let Some(tunnel) = self.current_outbound_tunnel.clone() else {
            error!("No outbound tunnels in the pool, sSID={}", self.send_stream_id);
            self.current_remote_lease = None;
            return;
        };
        if fresh_tunnel {
            self.rto = INITIAL_RTO;
            // packets sent before the path change no longer sample RTT
            self.tunnels_change_sequence_number = self.sequence_number;
        }
        let Some(session) = self.routing_session.clone() else {
            warn!("No routing session, sSID={}", self.send_stream_id);
            return;
        };

        let mut msgs = Vec::with_capacity(images.len());
        for (image, is_syn) in images {
            self.num_sent_bytes += image.len() as u64;
            match self.local.create_data_message(&image, self.port, is_syn) {
                Ok(data_msg) => msgs.push(TunnelMessageBlock {
                    gateway: lease.tunnel_gateway,
                    tunnel_id: lease.tunnel_id,
                    msg: session.wrap_single_message(data_msg),
                }),
                Err(e) => error!("Failed to create data message: {}", e),
            }
        }
        tunnel.send_tunnel_data(msgs);
    }

    /// Re-announce our lease set to the peer when the garlic layer reports it
    /// unconfirmed or updated.
    fn send_updated_lease_set(&mut self) {
        let session = match &self.routing_session {
            Some(session) if !session.is_terminated() => session.clone(),
            _ => {
                self.send_quick_ack();
                return;
            }
        };
        if session.is_lease_set_non_confirmed() {
            if Instant::now() > session.lease_set_submission_time() + LEASESET_CONFIRMATION_TIMEOUT {
                warn!(
                    "LeaseSet was not confirmed in {:?}, trying to resubmit",
                    LEASESET_CONFIRMATION_TIMEOUT
                );
                session.set_shared_routing_path(None);
                self.current_outbound_tunnel = None;
                self.current_remote_lease = None;
                self.send_quick_ack();
            }
        } else if session.is_lease_set_updated() {
            debug!("Sending updated LeaseSet");
            self.send_quick_ack();
        }
    }

    // ── retransmission ────────────────────────────────────────────────────

    fn resend_packet(&mut self) {
        if self.num_resend_attempts >= MAX_NUM_RESEND_ATTEMPTS {
            warn!(
                "Packet was not ACKed after {} attempts, terminate, rSID={}, sSID={}",
                MAX_NUM_RESEND_ATTEMPTS, self.recv_stream_id, self.send_stream_id
            );
            self.status = StreamStatus::Reset;
            self.close_internal();
            return;
        }

        // collect one overdue packet per RTO
        let now = Instant::now();
        let rto = Duration::from_millis(self.rto);
        let mut overdue = None;
        for sent in self.sent_packets.values_mut() {
            if now >= sent.send_time + rto {
                sent.resent = now < sent.send_time + rto * 2;
                sent.send_time = now;
                overdue = Some((sent.packet.as_bytes().to_vec(), sent.packet.is_syn()));
                break;
            }
        }

        if let Some(image) = overdue.filter(|_| self.is_send_time) {
            if self.is_nacked {
                self.num_resend_attempts = 1;
            } else if self.is_timeout_resend {
                self.num_resend_attempts += 1;
            }
            if self.num_resend_attempts == 1 && self.rto != INITIAL_RTO {
                // loss-based congestion control
                if !self.is_win_dropped {
                    self.window_size >>= 1;
                    self.is_win_dropped = true;
                    if self.window_size < MIN_WINDOW_SIZE {
                        self.window_size = MIN_WINDOW_SIZE;
                    }
                    self.update_pacing_time();
                }
            } else if self.is_timeout_resend {
                self.is_timeout_resend = false;
                self.rto = INITIAL_RTO; // drop RTO to initial upon path change
                self.window_size = INITIAL_WINDOW_SIZE;
                self.is_win_dropped = true;
                self.update_pacing_time();
                if let Some(session) = &self.routing_session {
                    session.set_shared_routing_path(None);
                }
                if self.num_resend_attempts & 1 == 1 {
                    // pick another outbound tunnel
                    let owner = self.local.owner();
                    self.current_outbound_tunnel = owner
                        .tunnel_pool()
                        .next_outbound_tunnel(self.current_outbound_tunnel.as_ref(), None);
                    self.tunnels_change_sequence_number = self.sequence_number;
                    warn!(
                        "Resend #{}, another outbound tunnel has been selected for sSID={}",
                        self.num_resend_attempts, self.send_stream_id
                    );
                } else {
                    // pick another lease
                    self.update_current_remote_lease(false);
                    warn!(
                        "Resend #{}, another remote lease has been selected for rSID={}, sSID={}",
                        self.num_resend_attempts, self.recv_stream_id, self.send_stream_id
                    );
                }
            }
            self.send_packets(vec![image]);
            self.is_send_time = false;
            if self.is_nacked {
                self.schedule_send();
            }
        } else {
            self.send_buffered();
        }
        if !self.is_nacked {
            self.schedule_resend();
        }
    }

    // ── timers ────────────────────────────────────────────────────────────

    fn schedule_send(&mut self) {
        if self.status == StreamStatus::Terminated {
            return;
        }
        let weak = self.self_ref.clone();
        self.send_timer
            .schedule(Duration::from_micros(self.pacing_time), async move {
                if let Some(inner) = weak.upgrade() {
                    inner.lock().await.handle_send_timer();
                }
            });
    }

    fn handle_send_timer(&mut self) {
        if self.status == StreamStatus::Terminated {
            return;
        }
        self.is_send_time = true;
        if self.is_nacked {
            self.resend_packet();
        } else if !self.is_win_dropped && self.sent_packets.len() as u32 == self.window_size {
            // sending too fast, early detection
            self.window_size >>= 1;
            self.is_win_dropped = true;
            if self.window_size < MIN_WINDOW_SIZE {
                self.window_size = MIN_WINDOW_SIZE;
            }
            self.update_pacing_time();
        } else if self.window_size > self.sent_packets.len() as u32 {
            self.send_buffered();
        } else {
            self.schedule_send();
        }
    }

    fn schedule_resend(&mut self) {
        if self.status == StreamStatus::Terminated {
            return;
        }
        let weak = self.self_ref.clone();
        self.resend_timer
            .schedule(Duration::from_millis(self.rto), async move {
                if let Some(inner) = weak.upgrade() {
                    inner.lock().await.handle_resend_timer();
                }
            });
    }

    fn handle_resend_timer(&mut self) {
        if self.status == StreamStatus::Terminated {
            return;
        }
        self.is_send_time = true;
        if self.rto > INITIAL_RTO {
            self.rto = INITIAL_RTO;
        }
        self.send_timer.cancel(); // no acks in RTO: disable fast retransmit
        self.is_timeout_resend = true;
        self.is_nacked = false;
        self.resend_packet(); // one packet per RTO, waiting for ack
    }

    fn schedule_ack(&mut self, timeout: u64) {
        if self.is_ack_send_scheduled {
            self.ack_send_timer.cancel();
        }
        self.is_ack_send_scheduled = true;
        let timeout = timeout.max(MIN_SEND_ACK_TIMEOUT);
        let weak = self.self_ref.clone();
        self.ack_send_timer
            .schedule(Duration::from_millis(timeout), async move {
                if let Some(inner) = weak.upgrade() {
                    inner.lock().await.handle_ack_send_timer();
                }
            });
    }

    fn handle_ack_send_timer(&mut self) {
        if !self.is_ack_send_scheduled || self.status == StreamStatus::Terminated {
            return;
        }
        if self.last_received_sequence_number < 0 {
            warn!(
                "SYN has not been received after {} ms after follow on, terminate rSID={}, sSID={}",
                SYN_TIMEOUT, self.recv_stream_id, self.send_stream_id
            );
            self.status = StreamStatus::Reset;
            self.close_internal();
            return;
        }
        if self.status == StreamStatus::Open {
            let unconfirmed = self
                .routing_session
                .as_ref()
                .map(|session| {
                    session.is_lease_set_non_confirmed()
                        && Instant::now()
                            > session.lease_set_submission_time() + LEASESET_CONFIRMATION_TIMEOUT
                })
                .unwrap_or(false);
            if unconfirmed {
                // something went wrong, re-select tunnels
                self.current_outbound_tunnel = None;
                self.current_remote_lease = None;
            }
            self.send_quick_ack();
        }
        self.is_ack_send_scheduled = false;
    }

    // ── lease and tunnel rotation ─────────────────────────────────────────

    fn update_current_remote_lease(&mut self, mut expired: bool) {
        let owner = self.local.owner();
        let needs_refresh = match &self.remote_lease_set {
            None => true,
            Some(lease_set) => lease_set.is_expired(),
        };
        if needs_refresh {
            let Some(identity) = self.remote_identity.clone() else {
                self.current_remote_lease = None;
                return;
            };
            match owner.find_lease_set(identity.ident_hash()) {
                None => {
                    warn!(
                        "LeaseSet {:?} {}",
                        identity.ident_hash(),
                        if self.remote_lease_set.is_some() {
                            "expired"
                        } else {
                            "not found"
                        }
                    );
                    let published_encrypted = self
                        .remote_lease_set
                        .as_ref()
                        .map(|lease_set| lease_set.is_published_encrypted())
                        .unwrap_or(false);
                    if published_encrypted {
                        owner.request_destination_encrypted(identity.ident_hash());
                        return; // keep the lease set for a possible next request
                    }
                    self.remote_lease_set = None;
                    owner.request_destination(identity.ident_hash());
                }
                Some(lease_set) => {
                    self.remote_identity = Some(lease_set.identity().clone());
                    self.transient_verifier = lease_set.transient_verifier();
                    self.remote_lease_set = Some(lease_set);
                }
            }
        }

        let Some(lease_set) = self.remote_lease_set.clone() else {
            warn!("Remote LeaseSet not found");
            self.current_remote_lease = None;
            return;
        };
        if self.routing_session.is_none() {
            self.routing_session = Some(owner.routing_session(&lease_set));
        }
        let mut leases = lease_set.non_expired_leases(false); // without threshold first
        if leases.is_empty() {
            expired = false;
            // time to request a fresh lease set
            if lease_set.is_published_encrypted() {
                owner.request_destination_encrypted(lease_set.identity().ident_hash());
            } else {
                owner.request_destination(lease_set.identity().ident_hash());
            }
            leases = lease_set.non_expired_leases(true); // then with threshold
        }
        if leases.is_empty() {
            warn!("All remote leases are expired");
            self.remote_lease_set = None;
            self.current_remote_lease = None;
            return;
        }
        if expired {
            if let Some(current) = &self.current_remote_lease {
                // prefer the same gateway on a different tunnel
                if let Some(lease) = leases.iter().find(|lease| {
                    lease.tunnel_gateway == current.tunnel_gateway
                        && lease.tunnel_id != current.tunnel_id
                }) {
                    self.current_remote_lease = Some(lease.clone());
                    return;
                }
            }
        }
        let mut i = rand::thread_rng().gen_range(0..leases.len());
        if let Some(current) = &self.current_remote_lease {
            if leases[i].tunnel_id == current.tunnel_id {
                // make sure we don't select the previous one
                i = (i + 1) % leases.len();
            }
        }
        self.current_remote_lease = Some(leases[i].clone());
    }

    fn reset_routing_path(&mut self) {
        self.current_outbound_tunnel = None;
        self.current_remote_lease = None;
        self.rtt = INITIAL_RTT as f64;
        self.rto = INITIAL_RTO;
        if let Some(session) = &self.routing_session {
            session.set_shared_routing_path(None);
        }
    }

    fn update_pacing_time(&mut self) {
        self.pacing_time = (self.rtt * 1000.0 / self.window_size as f64).round() as u64;
        if self.min_pacing_time > 0 && self.pacing_time < self.min_pacing_time {
            self.pacing_time = self.min_pacing_time;
        }
    }

    // ── lifecycle ─────────────────────────────────────────────────────────

    fn close_internal(&mut self) {
        debug!(
            "Closing stream sSID={}, rSID={}, status={:?}",
            self.send_stream_id, self.recv_stream_id, self.status
        );
        loop {
            match self.status {
                StreamStatus::Open => {
                    self.status = StreamStatus::Closing;
                    continue;
                }
                StreamStatus::Closing => {
                    if self.sent_packets.is_empty() && self.send_buffer.is_empty() {
                        self.status = StreamStatus::Closed;
                        self.send_close();
                    } else {
                        debug!(
                            "Trying to send stream data before closing, sSID={}",
                            self.send_stream_id
                        );
                    }
                    return;
                }
                StreamStatus::Reset | StreamStatus::Closed => {
                    self.terminate(true);
                    return;
                }
                StreamStatus::Terminated => return,
                StreamStatus::New => {
                    warn!(
                        "Unexpected stream status {:?} for sSID={}",
                        self.status, self.send_stream_id
                    );
                    return;
                }
            }
        }
    }

    fn terminate(&mut self, delete_from_destination: bool) {
        self.status = StreamStatus::Terminated;
        self.ack_send_timer.cancel();
        self.resend_timer.cancel();
        self.send_timer.cancel();
        self.send_buffer.clean_up();
        // the receive queue survives so buffered data can still be drained
        self.read_notify.notify_waiters();
        if delete_from_destination {
            self.local
                .unregister_stream(self.recv_stream_id, self.send_stream_id);
        }
    }

    /// Move in-order payload bytes into `buf`
    fn concatenate_packets(&mut self, buf: &mut [u8]) -> usize {
        let mut pos = 0;
        while pos < buf.len() {
            let Some(front) = self.receive_queue.front_mut() else {
                break;
            };
            let chunk = front.remaining();
            let n = chunk.len().min(buf.len() - pos);
            buf[pos..pos + n].copy_from_slice(&chunk[..n]);
            front.consume(n);
            pos += n;
            if front.remaining().is_empty() {
                self.receive_queue.pop_front();
            }
        }
        pos
    }
}

/// A reliable, ordered, full-duplex byte channel to a remote destination.
///
/// Handles are cheap to clone through the destination registry; all engine
/// state lives behind one lock.
pub struct Stream {
    recv_stream_id: u32,
    inner: Arc<Mutex<StreamInner>>,
    read_notify: Arc<Notify>,
}

impl Stream {
    fn build(
        local: StreamingDestination,
        remote: Option<Arc<LeaseSet>>,
        port: u16,
    ) -> Arc<Self> {
        let owner = local.owner();
        let config = owner.streaming_config();
        let ack_delay = config.ack_delay;
        let min_pacing_time = if config.outbound_speed > 0 {
            1_000_000 * STREAMING_MTU as u64 / config.outbound_speed
        } else {
            0
        };
        let mut recv_stream_id: u32 = rand::thread_rng().gen();
        while recv_stream_id == 0 {
            recv_stream_id = rand::thread_rng().gen();
        }
        let read_notify = Arc::new(Notify::new());
        let remote_identity = remote.as_ref().map(|lease_set| lease_set.identity().clone());

        let notify = read_notify.clone();
        let inner = Arc::new_cyclic(|weak: &Weak<Mutex<StreamInner>>| {
            Mutex::new(StreamInner {
                self_ref: weak.clone(),
                local,
                send_stream_id: 0,
                recv_stream_id,
                sequence_number: 0,
                tunnels_change_sequence_number: 0,
                last_received_sequence_number: -1,
                previous_received_sequence_number: -1,
                status: StreamStatus::New,
                port,
                is_ack_send_scheduled: false,
                is_nacked: false,
                is_send_time: true,
                is_win_dropped: true,
                is_timeout_resend: false,
                remote_lease_set: remote,
                remote_identity,
                transient_verifier: None,
                current_outbound_tunnel: None,
                current_remote_lease: None,
                routing_session: None,
                rtt: INITIAL_RTT as f64,
                prev_rtt_sample: INITIAL_RTT as f64,
                prev_rtt: INITIAL_RTT as f64,
                jitter: 0.0,
                rto: INITIAL_RTO,
                window_size: INITIAL_WINDOW_SIZE,
                min_pacing_time,
                pacing_time: INITIAL_PACING_TIME,
                ack_delay,
                mtu: STREAMING_MTU,
                num_resend_attempts: 0,
                num_sent_bytes: 0,
                num_received_bytes: 0,
                send_buffer: SendBufferQueue::new(),
                sent_packets: BTreeMap::new(),
                saved_packets: BTreeMap::new(),
                receive_queue: VecDeque::new(),
                read_notify: notify,
                send_timer: OneShot::new(),
                resend_timer: OneShot::new(),
                ack_send_timer: OneShot::new(),
            })
        });
        Arc::new(Self {
            recv_stream_id,
            inner,
            read_notify,
        })
    }

    /// An initiator stream bound to a known remote lease set
    pub(crate) fn new_outgoing(
        local: StreamingDestination,
        remote: Arc<LeaseSet>,
        port: u16,
    ) -> Arc<Self> {
        Self::build(local, Some(remote), port)
    }

    /// An acceptor-side stream; the remote identity arrives with its SYN
    pub(crate) fn new_incoming(local: StreamingDestination) -> Arc<Self> {
        Self::build(local, None, 0)
    }

    pub fn recv_stream_id(&self) -> u32 {
        self.recv_stream_id
    }

    pub async fn send_stream_id(&self) -> u32 {
        self.inner.lock().await.send_stream_id
    }

    pub async fn status(&self) -> StreamStatus {
        self.inner.lock().await.status
    }

    pub async fn remote_identity(&self) -> Option<Arc<Identity>> {
        self.inner.lock().await.remote_identity.clone()
    }

    pub async fn bytes_sent(&self) -> u64 {
        self.inner.lock().await.num_sent_bytes
    }

    pub async fn bytes_received(&self) -> u64 {
        self.inner.lock().await.num_received_bytes
    }

    /// Queue `buf` for ordered delivery. Returns the number of bytes queued.
    pub async fn send(&self, buf: &[u8]) -> Result<usize> {
        let mut inner = self.inner.lock().await;
        if buf.is_empty() {
            return Ok(0);
        }
        inner.send_buffer.add(SendBuffer::new(buf.to_vec(), None));
        inner.send_buffered();
        Ok(buf.len())
    }

    /// Queue `data` with a completion handler invoked at the moment of
    /// transmission, or with an aborted status on teardown.
    pub async fn async_send(&self, data: Vec<u8>, handler: SendHandler) {
        let mut inner = self.inner.lock().await;
        if data.is_empty() {
            handler(Ok(()));
        } else {
            inner.send_buffer.add(SendBuffer::new(data, Some(handler)));
        }
        inner.send_buffered();
    }

    /// Read in-order bytes into `buf`, waiting up to `timeout`. Returns 0 on
    /// timeout or once the stream has closed and its queue is drained.
    pub async fn receive(&self, buf: &mut [u8], timeout: Duration) -> usize {
        if buf.is_empty() {
            return 0;
        }
        let deadline = Instant::now() + timeout;
        loop {
            let notified = self.read_notify.notified();
            tokio::pin!(notified);
            {
                let mut inner = self.inner.lock().await;
                if !inner.receive_queue.is_empty() {
                    return inner.concatenate_packets(buf);
                }
                if matches!(
                    inner.status,
                    StreamStatus::Closed | StreamStatus::Reset | StreamStatus::Terminated
                ) {
                    return 0;
                }
                // register the waiter before releasing the lock so a packet
                // arriving in between still wakes us
                notified.as_mut().enable();
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return 0;
            }
        }
    }

    /// Begin graceful close: drain outbound data, then exchange CLOSE
    pub async fn close(&self) {
        self.inner.lock().await.close_internal();
    }

    pub(crate) async fn handle_next_packet(&self, packet: Packet) {
        self.inner.lock().await.handle_next_packet(packet);
    }

    pub(crate) async fn handle_ping(&self, mut packet: Packet) {
        self.inner.lock().await.handle_ping(&mut packet);
    }

    pub(crate) async fn send_ping(&self) {
        self.inner.lock().await.send_ping();
    }

    /// Re-announce the local lease set when the garlic layer reports it stale
    pub async fn send_updated_lease_set(&self) {
        self.inner.lock().await.send_updated_lease_set();
    }

    pub(crate) async fn reset_routing_path(&self) {
        self.inner.lock().await.reset_routing_path();
    }

    pub(crate) async fn terminate(&self, delete_from_destination: bool) {
        self.inner.lock().await.terminate(delete_from_destination);
    }
}
