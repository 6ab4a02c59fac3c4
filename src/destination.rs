use crate::error::{Error, Result};
use crate::pool::BufferPool;
use crate::protocol::{Packet, MAX_PACKET_SIZE};
use crate::routing::{LeaseSet, Owner};
use crate::stream::{Stream, StreamStatus};
use crate::timer::OneShot;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use std::collections::hash_map::Entry;
use std::collections::{HashMap, VecDeque};
use std::io::{Read, Write};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tracing::{debug, info, trace, warn};

/// Incoming streams queued for an acceptor before one is set
pub const MAX_PENDING_INCOMING_BACKLOG: usize = 128;

/// How long a pending stream or a pre-SYN packet buffer is kept
pub const PENDING_INCOMING_TIMEOUT: Duration = Duration::from_secs(10);

/// Protocol number of streaming inside a data message
pub const PROTOCOL_TYPE_STREAMING: u8 = 6;

/// Callback receiving accepted streams; `None` is the unblock sentinel sent
/// when the acceptor is reset.
pub type Acceptor = Arc<dyn Fn(Option<Arc<Stream>>) + Send + Sync>;

/// Packets that arrived before their stream's SYN, dropped on expiry
struct SavedPackets {
    packets: Vec<Packet>,
    expiry: OneShot,
}

#[derive(Default)]
struct DestState {
    /// All local streams, keyed by their receive stream id
    streams: HashMap<u32, Arc<Stream>>,
    /// Incoming streams, keyed by the peer's send stream id
    incoming_streams: HashMap<u32, Arc<Stream>>,
    /// Most recent lookup hit
    last_stream: Option<Arc<Stream>>,
    saved_packets: HashMap<u32, SavedPackets>,
    pending_incoming: VecDeque<Arc<Stream>>,
    pending_incoming_timer: OneShot,
    acceptor: Option<Acceptor>,
}

struct DestShared {
    owner: Arc<dyn Owner>,
    local_port: u16,
    gzip: bool,
    state: Mutex<DestState>,
    pool: BufferPool,
}

impl DestShared {
    fn state(&self) -> MutexGuard<'_, DestState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Demultiplexes inbound datagrams to streams and accepts new ones.
///
/// Cheap to clone; all clones share the same registries.
#[derive(Clone)]
pub struct StreamingDestination {
    shared: Arc<DestShared>,
}

impl StreamingDestination {
    pub fn new(owner: Arc<dyn Owner>, local_port: u16, gzip: bool) -> Self {
        Self {
            shared: Arc::new(DestShared {
                owner,
                local_port,
                gzip,
                state: Mutex::new(DestState::default()),
                pool: BufferPool::new(MAX_PACKET_SIZE),
            }),
        }
    }

    pub fn start(&self) {}

    /// Terminate every stream and drop the accept backlog
    pub async fn stop(&self) {
        self.reset_acceptor();
        let streams: Vec<_> = {
            let mut state = self.shared.state();
            state.pending_incoming_timer.cancel();
            state.pending_incoming.clear();
            let streams: Vec<_> = state.streams.values().cloned().collect();
            state.streams.clear();
            state.incoming_streams.clear();
            state.last_stream = None;
            streams
        };
        for stream in streams {
            stream.terminate(false).await;
        }
    }

    pub(crate) fn owner(&self) -> Arc<dyn Owner> {
        self.shared.owner.clone()
    }

    pub async fn stream_count(&self) -> usize {
        self.shared.state().streams.len()
    }

    /// Route one decoded packet to its stream, a new incoming stream, the
    /// ping responder, or the pre-SYN buffer.
    pub async fn handle_next_packet(&self, packet: Packet) {
        let send_stream_id = packet.send_stream_id();
        if send_stream_id != 0 {
            let stream = {
                let mut state = self.shared.state();
                let cached = state
                    .last_stream
                    .as_ref()
                    .filter(|stream| stream.recv_stream_id() == send_stream_id)
                    .cloned();
                match cached {
                    Some(stream) => Some(stream),
                    None => {
                        let found = state.streams.get(&send_stream_id).cloned();
                        state.last_stream = found.clone();
                        found
                    }
                }
            };
            if let Some(stream) = stream {
                stream.handle_next_packet(packet).await;
            } else if packet.is_echo() && self.shared.owner.streaming_config().answer_pings {
                info!("Ping received sSID={}", send_stream_id);
                let stream = Stream::new_incoming(self.clone());
                stream.handle_ping(packet).await;
            } else {
                info!("Unknown stream sSID={}", send_stream_id);
            }
            return;
        }

        if packet.is_echo() {
            info!("Pong received rSID={}", packet.receive_stream_id());
            return;
        }

        if packet.is_syn() && packet.seqn() == 0 {
            self.handle_incoming_syn(packet).await;
            return;
        }

        // follow-on packet without its SYN yet
        let receive_stream_id = packet.receive_stream_id();
        let existing = {
            self.shared
                .state()
                .incoming_streams
                .get(&receive_stream_id)
                .cloned()
        };
        if let Some(stream) = existing {
            stream.handle_next_packet(packet).await;
            return;
        }
        let mut state = self.shared.state();
        match state.saved_packets.entry(receive_stream_id) {
            Entry::Occupied(mut entry) => entry.get_mut().packets.push(packet),
            Entry::Vacant(entry) => {
                let mut saved = SavedPackets {
                    packets: vec![packet],
                    expiry: OneShot::new(),
                };
                let weak = Arc::downgrade(&self.shared);
                saved.expiry.schedule(PENDING_INCOMING_TIMEOUT, async move {
                    if let Some(shared) = weak.upgrade() {
                        if shared.state().saved_packets.remove(&receive_stream_id).is_some() {
                            debug!("Saved packets for rSID={} dropped", receive_stream_id);
                        }
                    }
                });
                entry.insert(saved);
            }
        }
    }

    async fn handle_incoming_syn(&self, packet: Packet) {
        let receive_stream_id = packet.receive_stream_id();
        let existing = {
            self.shared
                .state()
                .incoming_streams
                .get(&receive_stream_id)
                .cloned()
        };
        if let Some(stream) = existing {
            // our SYN-ACK was lost: change the reply path, the previous
            // stream should connect
            warn!(
                "Incoming stream with rSID={} already exists",
                receive_stream_id
            );
            stream.reset_routing_path().await;
            return;
        }

        let incoming = Stream::new_incoming(self.clone());
        {
            let mut state = self.shared.state();
            state
                .streams
                .insert(incoming.recv_stream_id(), incoming.clone());
            state
                .incoming_streams
                .insert(receive_stream_id, incoming.clone());
        }
        incoming.handle_next_packet(packet).await;

        // flush packets that raced ahead of the SYN
        let saved = { self.shared.state().saved_packets.remove(&receive_stream_id) };
        if let Some(saved) = saved {
            debug!(
                "Processing {} saved packets for rSID={}",
                saved.packets.len(),
                receive_stream_id
            );
            for packet in saved.packets {
                incoming.handle_next_packet(packet).await;
            }
        }

        let acceptor = { self.shared.state().acceptor.clone() };
        match acceptor {
            Some(acceptor) => acceptor(Some(incoming)),
            None => {
                warn!("Acceptor for incoming stream is not set");
                let overflow = {
                    let mut state = self.shared.state();
                    if state.pending_incoming.len() < MAX_PENDING_INCOMING_BACKLOG {
                        state.pending_incoming.push_back(incoming.clone());
                        let weak = Arc::downgrade(&self.shared);
                        state
                            .pending_incoming_timer
                            .schedule(PENDING_INCOMING_TIMEOUT, async move {
                                if let Some(shared) = weak.upgrade() {
                                    let destination = StreamingDestination { shared };
                                    destination.handle_pending_incoming_timer().await;
                                }
                            });
                        debug!("Pending incoming stream added, rSID={}", receive_stream_id);
                        false
                    } else {
                        true
                    }
                };
                if overflow {
                    warn!(
                        "Pending incoming streams backlog exceeds {}",
                        MAX_PENDING_INCOMING_BACKLOG
                    );
                    incoming.close().await;
                }
            }
        }
    }

    async fn handle_pending_incoming_timer(&self) {
        warn!("Pending incoming timeout expired");
        let pending: Vec<_> = {
            let mut state = self.shared.state();
            state.pending_incoming.drain(..).collect()
        };
        for stream in pending {
            stream.close().await;
        }
    }

    /// Open an initiator stream to `remote`
    pub fn create_new_outgoing_stream(&self, remote: Arc<LeaseSet>, port: u16) -> Arc<Stream> {
        let stream = Stream::new_outgoing(self.clone(), remote, port);
        self.shared
            .state()
            .streams
            .insert(stream.recv_stream_id(), stream.clone());
        stream
    }

    /// Fire a signed ping at `remote` over an ephemeral stream
    pub async fn send_ping(&self, remote: Arc<LeaseSet>) {
        let stream = Stream::new_outgoing(self.clone(), remote, 0);
        stream.send_ping().await;
    }

    /// Close and tear down a stream by its receive stream id
    pub async fn delete_stream(&self, recv_stream_id: u32) -> bool {
        let stream = { self.shared.state().streams.get(&recv_stream_id).cloned() };
        let Some(stream) = stream else {
            return false;
        };
        stream.close().await; // try to send CLOSE first
        let send_stream_id = stream.send_stream_id().await;
        stream.terminate(false).await;
        self.unregister_stream(recv_stream_id, send_stream_id);
        true
    }

    pub(crate) fn unregister_stream(&self, recv_stream_id: u32, send_stream_id: u32) {
        let mut state = self.shared.state();
        state.streams.remove(&recv_stream_id);
        state.incoming_streams.remove(&send_stream_id);
        if state
            .last_stream
            .as_ref()
            .map(|stream| stream.recv_stream_id())
            == Some(recv_stream_id)
        {
            state.last_stream = None;
        }
        if state.streams.is_empty() {
            self.shared.pool.clean();
        }
    }

    /// Install an acceptor and hand it the queued backlog
    pub async fn set_acceptor(&self, acceptor: Acceptor) {
        let pending: Vec<_> = {
            let mut state = self.shared.state();
            state.acceptor = Some(acceptor.clone());
            state.pending_incoming_timer.cancel();
            state.pending_incoming.drain(..).collect()
        };
        for stream in pending {
            if stream.status().await == StreamStatus::Open {
                acceptor(Some(stream));
            }
        }
    }

    /// Remove the acceptor, unblocking it once with the `None` sentinel
    pub fn reset_acceptor(&self) {
        let acceptor = { self.shared.state().acceptor.take() };
        if let Some(acceptor) = acceptor {
            acceptor(None);
        }
    }

    /// Deliver exactly one stream to `acceptor`: the backlog head if any,
    /// otherwise the next incoming SYN, restoring the previous acceptor after
    /// that single delivery.
    pub async fn accept_once(&self, acceptor: Acceptor) {
        let next = {
            let mut state = self.shared.state();
            let next = state.pending_incoming.pop_front();
            if next.is_some() && state.pending_incoming.is_empty() {
                state.pending_incoming_timer.cancel();
            }
            next
        };
        match next {
            Some(stream) => acceptor(Some(stream)),
            None => {
                let mut state = self.shared.state();
                let prev = state.acceptor.take();
                let slot = Arc::new(Mutex::new(Some((acceptor, prev))));
                let weak = Arc::downgrade(&self.shared);
                state.acceptor = Some(Arc::new(move |stream| {
                    let taken = slot
                        .lock()
                        .unwrap_or_else(|poisoned| poisoned.into_inner())
                        .take();
                    if let Some((acceptor, prev)) = taken {
                        if let Some(shared) = weak.upgrade() {
                            shared.state().acceptor = prev;
                        }
                        acceptor(stream);
                    }
                }));
            }
        }
    }

    /// Wait up to `timeout` for the next incoming stream
    pub async fn accept_stream(&self, timeout: Duration) -> Result<Arc<Stream>> {
        let (tx, rx) = tokio::sync::oneshot::channel();
        let tx = Mutex::new(Some(tx));
        self.accept_once(Arc::new(move |stream| {
            if let Some(tx) = tx
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner())
                .take()
            {
                let _ = tx.send(stream);
            }
        }))
        .await;
        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(Some(stream))) => Ok(stream),
            Ok(Ok(None)) => Err(Error::StreamClosed),
            Ok(Err(_)) => Err(Error::StreamClosed),
            Err(_) => Err(Error::Timeout),
        }
    }

    /// Wrap a packet image into a data message: 4-byte length prefix over a
    /// gzip stream whose MTIME header bytes carry the ports and whose OS byte
    /// carries the protocol number.
    pub fn create_data_message(
        &self,
        payload: &[u8],
        to_port: u16,
        force_gzip: bool,
    ) -> Result<Vec<u8>> {
        let level = if self.shared.gzip || force_gzip {
            Compression::default()
        } else {
            Compression::none()
        };
        let mut encoder = GzEncoder::new(Vec::new(), level);
        encoder.write_all(payload)?;
        let mut blob = encoder.finish()?;
        blob[4..6].copy_from_slice(&self.shared.local_port.to_be_bytes());
        blob[6..8].copy_from_slice(&to_port.to_be_bytes());
        blob[9] = PROTOCOL_TYPE_STREAMING;
        let mut msg = Vec::with_capacity(4 + blob.len());
        msg.extend_from_slice(&(blob.len() as u32).to_be_bytes());
        msg.extend_from_slice(&blob);
        Ok(msg)
    }

    /// Unwrap an inbound data message and dispatch the packet inside
    pub async fn handle_data_message(&self, buf: &[u8]) {
        if buf.len() < 4 {
            warn!("Data message too short: {} bytes", buf.len());
            return;
        }
        let len = u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]) as usize;
        if len < 10 || buf.len() < 4 + len {
            warn!(
                "Data message length mismatch: {} declared, {} available",
                len,
                buf.len() - 4
            );
            return;
        }
        let from_port = u16::from_be_bytes([buf[8], buf[9]]);
        let to_port = u16::from_be_bytes([buf[10], buf[11]]);
        if buf[13] != PROTOCOL_TYPE_STREAMING {
            warn!("Data message with unexpected protocol {}", buf[13]);
            return;
        }
        trace!("Data message from port {} to port {}", from_port, to_port);

        let mut scratch = self.shared.pool.acquire();
        let mut decoder = GzDecoder::new(&buf[4..4 + len]);
        let mut total = 0;
        loop {
            match decoder.read(&mut scratch[total..]) {
                Ok(0) => break,
                Ok(n) => {
                    total += n;
                    if total == scratch.len() {
                        break;
                    }
                }
                Err(e) => {
                    warn!("Failed to inflate data message: {}", e);
                    self.shared.pool.release(scratch);
                    return;
                }
            }
        }
        let packet = Packet::from_buffer(scratch[..total].to_vec());
        self.shared.pool.release(scratch);
        match packet {
            Ok(packet) => self.handle_next_packet(packet).await,
            Err(e) => warn!("Malformed packet in data message: {}", e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::PacketBuilder;
    use crate::testutil::{build_syn, unwrap_data_message, MockOwner};
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test]
    async fn test_data_message_roundtrip() {
        let owner = MockOwner::new();
        let destination = StreamingDestination::new(owner, 7070, false);
        let packet = PacketBuilder::new(1, 2, 3, 0).payload(b"wrapped".to_vec()).build();

        let msg = destination
            .create_data_message(packet.as_bytes(), 9090, false)
            .unwrap();
        // ports ride in the gzip header
        assert_eq!(&msg[8..10], &7070u16.to_be_bytes());
        assert_eq!(&msg[10..12], &9090u16.to_be_bytes());
        assert_eq!(msg[13], PROTOCOL_TYPE_STREAMING);

        let unwrapped = unwrap_data_message(&msg);
        assert_eq!(unwrapped.as_bytes(), packet.as_bytes());
    }

    #[tokio::test]
    async fn test_data_message_gzip_roundtrip() {
        let owner = MockOwner::new();
        let destination = StreamingDestination::new(owner, 1, true);
        let packet = PacketBuilder::new(1, 2, 3, 0)
            .payload(vec![0x41; 1200])
            .build();
        let msg = destination
            .create_data_message(packet.as_bytes(), 2, false)
            .unwrap();
        // compressible payload actually shrinks
        assert!(msg.len() < packet.len());
        assert_eq!(unwrap_data_message(&msg).as_bytes(), packet.as_bytes());
    }

    #[tokio::test]
    async fn test_incoming_syn_creates_pending_stream() {
        let alice = MockOwner::new();
        let bob = MockOwner::new();
        bob.add_lease_set(alice.make_lease_set());
        let destination = StreamingDestination::new(bob.clone(), 0, false);

        let syn = build_syn(
            alice.keys(),
            0x42,
            *bob.keys().identity().ident_hash().as_bytes(),
            b"hello",
        );
        destination.handle_next_packet(syn).await;

        assert_eq!(destination.stream_count().await, 1);
        let stream = destination
            .accept_stream(Duration::from_millis(100))
            .await
            .unwrap();
        assert_eq!(stream.send_stream_id().await, 0x42);
        let mut buf = [0u8; 16];
        let n = stream.receive(&mut buf, Duration::from_millis(100)).await;
        assert_eq!(&buf[..n], b"hello");
    }

    #[tokio::test]
    async fn test_follow_on_buffered_until_syn() {
        let alice = MockOwner::new();
        let bob = MockOwner::new();
        bob.add_lease_set(alice.make_lease_set());
        let destination = StreamingDestination::new(bob.clone(), 0, false);

        // follow-on data for an unknown stream arrives first
        let follow_on = PacketBuilder::new(0, 0x77, 1, 0)
            .flags(crate::protocol::FLAG_NO_ACK)
            .payload(b" world".to_vec())
            .build();
        destination.handle_next_packet(follow_on).await;
        assert_eq!(destination.stream_count().await, 0);
        assert_eq!(destination.shared.state().saved_packets.len(), 1);

        // its SYN shows up: buffered packet is flushed in order
        let syn = build_syn(
            alice.keys(),
            0x77,
            *bob.keys().identity().ident_hash().as_bytes(),
            b"hello",
        );
        destination.handle_next_packet(syn).await;
        assert!(destination.shared.state().saved_packets.is_empty());

        let stream = destination
            .accept_stream(Duration::from_millis(100))
            .await
            .unwrap();
        let mut buf = [0u8; 16];
        let n = stream.receive(&mut buf, Duration::from_millis(100)).await;
        assert_eq!(&buf[..n], b"hello world");
    }

    #[tokio::test(start_paused = true)]
    async fn test_pending_incoming_expires() {
        let alice = MockOwner::new();
        let bob = MockOwner::new();
        bob.add_lease_set(alice.make_lease_set());
        let destination = StreamingDestination::new(bob.clone(), 0, false);
        let hash = *bob.keys().identity().ident_hash().as_bytes();
        destination
            .handle_next_packet(build_syn(alice.keys(), 0x31, hash, b""))
            .await;
        let stream = {
            let state = destination.shared.state();
            assert_eq!(state.pending_incoming.len(), 1);
            state.pending_incoming[0].clone()
        };

        // nobody accepts in time
        tokio::time::sleep(PENDING_INCOMING_TIMEOUT + Duration::from_secs(1)).await;
        assert!(destination.shared.state().pending_incoming.is_empty());
        assert_eq!(stream.status().await, StreamStatus::Closing);
    }

    #[tokio::test(start_paused = true)]
    async fn test_saved_packets_dropped_on_expiry() {
        let bob = MockOwner::new();
        let destination = StreamingDestination::new(bob, 0, false);
        let follow_on = PacketBuilder::new(0, 0x88, 1, 0)
            .flags(crate::protocol::FLAG_NO_ACK)
            .payload(b"orphan".to_vec())
            .build();
        destination.handle_next_packet(follow_on).await;
        assert_eq!(destination.shared.state().saved_packets.len(), 1);

        tokio::time::sleep(PENDING_INCOMING_TIMEOUT + Duration::from_secs(1)).await;
        assert!(destination.shared.state().saved_packets.is_empty());
    }

    #[tokio::test]
    async fn test_duplicate_syn_resets_path_not_stream() {
        let alice = MockOwner::new();
        let bob = MockOwner::new();
        bob.add_lease_set(alice.make_lease_set());
        let destination = StreamingDestination::new(bob.clone(), 0, false);

        let hash = *bob.keys().identity().ident_hash().as_bytes();
        destination
            .handle_next_packet(build_syn(alice.keys(), 0x55, hash, b"first"))
            .await;
        assert_eq!(destination.stream_count().await, 1);

        // the replayed SYN must not spawn a twin stream
        destination
            .handle_next_packet(build_syn(alice.keys(), 0x55, hash, b"first"))
            .await;
        assert_eq!(destination.stream_count().await, 1);
    }

    #[tokio::test]
    async fn test_accept_once_restores_previous_acceptor() {
        let alice = MockOwner::new();
        let bob = MockOwner::new();
        bob.add_lease_set(alice.make_lease_set());
        let destination = StreamingDestination::new(bob.clone(), 0, false);
        let hash = *bob.keys().identity().ident_hash().as_bytes();

        let default_hits = Arc::new(AtomicUsize::new(0));
        let hits = default_hits.clone();
        destination
            .set_acceptor(Arc::new(move |_stream| {
                hits.fetch_add(1, Ordering::SeqCst);
            }))
            .await;

        let once_hits = Arc::new(AtomicUsize::new(0));
        let hits = once_hits.clone();
        destination
            .accept_once(Arc::new(move |_stream| {
                hits.fetch_add(1, Ordering::SeqCst);
            }))
            .await;

        destination
            .handle_next_packet(build_syn(alice.keys(), 0x61, hash, b""))
            .await;
        destination
            .handle_next_packet(build_syn(alice.keys(), 0x62, hash, b""))
            .await;

        // first SYN went to the one-shot acceptor, second to the restored one
        assert_eq!(once_hits.load(Ordering::SeqCst), 1);
        assert_eq!(default_hits.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_backlog_overflow_closes_stream() {
        let alice = MockOwner::new();
        let bob = MockOwner::new();
        bob.add_lease_set(alice.make_lease_set());
        let destination = StreamingDestination::new(bob.clone(), 0, false);
        let hash = *bob.keys().identity().ident_hash().as_bytes();

        for i in 0..MAX_PENDING_INCOMING_BACKLOG + 1 {
            destination
                .handle_next_packet(build_syn(alice.keys(), 1000 + i as u32, hash, b""))
                .await;
        }
        let pending = destination.shared.state().pending_incoming.len();
        assert_eq!(pending, MAX_PENDING_INCOMING_BACKLOG);
    }

    #[tokio::test]
    async fn test_offline_signed_syn_accepted() {
        use crate::identity::PrivateKeys;
        use crate::protocol::{
            FLAG_FROM_INCLUDED, FLAG_MAX_PACKET_SIZE_INCLUDED, FLAG_NO_ACK,
            FLAG_OFFLINE_SIGNATURE, FLAG_SIGNATURE_INCLUDED, FLAG_SYN,
        };

        let bob = MockOwner::new();
        let destination = StreamingDestination::new(bob.clone(), 0, false);

        // the remote signs with an offline-endorsed transient key
        let mut rng = rand::thread_rng();
        let transient = ed25519_dalek::SigningKey::generate(&mut rng);
        let remote_keys =
            PrivateKeys::generate(&mut rng).with_offline_signature(2_000_000, transient);

        let syn = PacketBuilder::new(0, 0x99, 0, 0)
            .destination_hash(*bob.keys().identity().ident_hash().as_bytes())
            .flags(
                FLAG_SYN
                    | FLAG_FROM_INCLUDED
                    | FLAG_SIGNATURE_INCLUDED
                    | FLAG_MAX_PACKET_SIZE_INCLUDED
                    | FLAG_NO_ACK
                    | FLAG_OFFLINE_SIGNATURE,
            )
            .option_from(remote_keys.identity().to_bytes())
            .option_max_packet_size(1730)
            .option_offline_signature(remote_keys.offline_signature_block().unwrap())
            .option_signature(remote_keys.signature_len())
            .payload(b"offline".to_vec())
            .build_signed(|image| remote_keys.sign(image));
        destination.handle_next_packet(syn).await;

        let stream = destination
            .accept_stream(Duration::from_millis(100))
            .await
            .unwrap();
        let mut buf = [0u8; 16];
        let n = stream.receive(&mut buf, Duration::from_millis(100)).await;
        assert_eq!(&buf[..n], b"offline");
    }

    #[tokio::test]
    async fn test_stop_terminates_streams() {
        let alice = MockOwner::new();
        let bob = MockOwner::new();
        bob.add_lease_set(alice.make_lease_set());
        let destination = StreamingDestination::new(bob.clone(), 0, false);
        let hash = *bob.keys().identity().ident_hash().as_bytes();
        destination
            .handle_next_packet(build_syn(alice.keys(), 0x91, hash, b""))
            .await;
        let stream = destination
            .accept_stream(Duration::from_millis(100))
            .await
            .unwrap();

        destination.stop().await;
        assert_eq!(destination.stream_count().await, 0);
        assert_eq!(stream.status().await, StreamStatus::Terminated);
    }
}
