//! Shared mocks for unit tests: an owner with a tunnel pool, routing session
//! and lease sets that capture outbound traffic instead of routing it.

use crate::identity::{IdentHash, PrivateKeys};
use crate::protocol::{
    Packet, PacketBuilder, FLAG_FROM_INCLUDED, FLAG_MAX_PACKET_SIZE_INCLUDED, FLAG_NO_ACK,
    FLAG_SIGNATURE_INCLUDED, FLAG_SYN, STREAMING_MTU,
};
use crate::routing::{
    Lease, LeaseSet, OutboundTunnel, Owner, RoutingPath, RoutingSession, StreamingConfig,
    TunnelMessageBlock, TunnelPool,
};
use std::collections::HashMap;
use std::io::Read;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::time::Instant;

pub(crate) struct MockTunnel {
    id: u32,
    established: AtomicBool,
    sent: Mutex<Vec<TunnelMessageBlock>>,
}

impl MockTunnel {
    pub fn new(id: u32) -> Arc<Self> {
        Arc::new(Self {
            id,
            established: AtomicBool::new(true),
            sent: Mutex::new(Vec::new()),
        })
    }

    pub fn take_sent(&self) -> Vec<TunnelMessageBlock> {
        std::mem::take(&mut *self.sent.lock().expect("tunnel lock"))
    }

    #[allow(dead_code)]
    pub fn set_established(&self, established: bool) {
        self.established.store(established, Ordering::SeqCst);
    }
}

impl OutboundTunnel for MockTunnel {
    fn tunnel_id(&self) -> u32 {
        self.id
    }

    fn is_established(&self) -> bool {
        self.established.load(Ordering::SeqCst)
    }

    fn send_tunnel_data(&self, msgs: Vec<TunnelMessageBlock>) {
        self.sent.lock().expect("tunnel lock").extend(msgs);
    }
}

pub(crate) struct MockTunnelPool {
    tunnels: Vec<Arc<MockTunnel>>,
}

impl TunnelPool for MockTunnelPool {
    fn next_outbound_tunnel(
        &self,
        current: Option<&Arc<dyn OutboundTunnel>>,
        _gateway: Option<&IdentHash>,
    ) -> Option<Arc<dyn OutboundTunnel>> {
        let current_id = current.map(|tunnel| tunnel.tunnel_id());
        self.tunnels
            .iter()
            .find(|tunnel| Some(tunnel.tunnel_id()) != current_id)
            .map(|tunnel| tunnel.clone() as Arc<dyn OutboundTunnel>)
    }

    fn new_outbound_tunnel(
        &self,
        current: Option<&Arc<dyn OutboundTunnel>>,
    ) -> (Option<Arc<dyn OutboundTunnel>>, bool) {
        (self.next_outbound_tunnel(current, None), true)
    }
}

pub(crate) struct MockRoutingSession {
    ratchets: bool,
    path: Mutex<Option<RoutingPath>>,
    submission_time: Instant,
    non_confirmed: AtomicBool,
    updated: AtomicBool,
}

impl RoutingSession for MockRoutingSession {
    fn is_ratchets(&self) -> bool {
        self.ratchets
    }

    fn is_terminated(&self) -> bool {
        false
    }

    fn is_ready_to_send(&self) -> bool {
        true
    }

    fn is_lease_set_non_confirmed(&self) -> bool {
        self.non_confirmed.load(Ordering::SeqCst)
    }

    fn is_lease_set_updated(&self) -> bool {
        self.updated.load(Ordering::SeqCst)
    }

    fn lease_set_submission_time(&self) -> Instant {
        self.submission_time
    }

    fn shared_routing_path(&self) -> Option<RoutingPath> {
        self.path.lock().expect("session lock").clone()
    }

    fn set_shared_routing_path(&self, path: Option<RoutingPath>) {
        *self.path.lock().expect("session lock") = path;
    }

    fn wrap_single_message(&self, msg: Vec<u8>) -> Vec<u8> {
        msg
    }
}

pub(crate) struct MockOwner {
    keys: PrivateKeys,
    config: StreamingConfig,
    lease_sets: Mutex<HashMap<IdentHash, Arc<LeaseSet>>>,
    tunnels: Vec<Arc<MockTunnel>>,
    pool: Arc<MockTunnelPool>,
    session: Arc<MockRoutingSession>,
    requested: Mutex<Vec<IdentHash>>,
}

impl MockOwner {
    pub fn new() -> Arc<Self> {
        let tunnels = vec![MockTunnel::new(1), MockTunnel::new(2)];
        let pool = Arc::new(MockTunnelPool {
            tunnels: tunnels.clone(),
        });
        Arc::new(Self {
            keys: PrivateKeys::generate(&mut rand::thread_rng()),
            config: StreamingConfig::default(),
            lease_sets: Mutex::new(HashMap::new()),
            tunnels,
            pool,
            session: Arc::new(MockRoutingSession {
                ratchets: false,
                path: Mutex::new(None),
                submission_time: Instant::now(),
                non_confirmed: AtomicBool::new(false),
                updated: AtomicBool::new(false),
            }),
            requested: Mutex::new(Vec::new()),
        })
    }

    pub fn keys(&self) -> &PrivateKeys {
        &self.keys
    }

    pub fn tunnel(&self, i: usize) -> &Arc<MockTunnel> {
        &self.tunnels[i]
    }

    pub fn tunnels(&self) -> &[Arc<MockTunnel>] {
        &self.tunnels
    }

    #[allow(dead_code)]
    pub fn session(&self) -> &Arc<MockRoutingSession> {
        &self.session
    }

    pub fn add_lease_set(&self, lease_set: Arc<LeaseSet>) {
        self.lease_sets
            .lock()
            .expect("lease sets lock")
            .insert(*lease_set.identity().ident_hash(), lease_set);
    }

    /// A two-lease set for this owner's identity, valid for ten minutes
    pub fn make_lease_set(&self) -> Arc<LeaseSet> {
        let identity = Arc::new(self.keys.identity().clone());
        let gateway = *identity.ident_hash();
        let end_date = Instant::now() + Duration::from_secs(600);
        Arc::new(LeaseSet::new(
            identity,
            vec![
                Lease {
                    tunnel_gateway: gateway,
                    tunnel_id: 11,
                    end_date,
                },
                Lease {
                    tunnel_gateway: gateway,
                    tunnel_id: 12,
                    end_date,
                },
            ],
        ))
    }

    #[allow(dead_code)]
    pub fn requested(&self) -> Vec<IdentHash> {
        self.requested.lock().expect("requested lock").clone()
    }
}

impl Owner for MockOwner {
    fn private_keys(&self) -> &PrivateKeys {
        &self.keys
    }

    fn streaming_config(&self) -> &StreamingConfig {
        &self.config
    }

    fn find_lease_set(&self, ident: &IdentHash) -> Option<Arc<LeaseSet>> {
        self.lease_sets.lock().expect("lease sets lock").get(ident).cloned()
    }

    fn request_destination(&self, ident: &IdentHash) {
        self.requested.lock().expect("requested lock").push(*ident);
    }

    fn request_destination_encrypted(&self, ident: &IdentHash) {
        self.requested.lock().expect("requested lock").push(*ident);
    }

    fn tunnel_pool(&self) -> Arc<dyn TunnelPool> {
        self.pool.clone()
    }

    fn routing_session(&self, _remote: &Arc<LeaseSet>) -> Arc<dyn RoutingSession> {
        self.session.clone()
    }
}

/// Strip the data-message wrapper and decode the packet inside
pub(crate) fn unwrap_data_message(msg: &[u8]) -> Packet {
    let len = u32::from_be_bytes([msg[0], msg[1], msg[2], msg[3]]) as usize;
    let mut decoder = flate2::read::GzDecoder::new(&msg[4..4 + len]);
    let mut buf = Vec::new();
    decoder.read_to_end(&mut buf).expect("inflate data message");
    Packet::from_buffer(buf).expect("decode packet")
}

/// The SYN an initiator engine would emit, signed by `keys`
pub(crate) fn build_syn(
    keys: &PrivateKeys,
    recv_stream_id: u32,
    destination_hash: [u8; 32],
    payload: &[u8],
) -> Packet {
    PacketBuilder::new(0, recv_stream_id, 0, 0)
        .destination_hash(destination_hash)
        .flags(
            FLAG_SYN
                | FLAG_FROM_INCLUDED
                | FLAG_SIGNATURE_INCLUDED
                | FLAG_MAX_PACKET_SIZE_INCLUDED
                | FLAG_NO_ACK,
        )
        .option_from(keys.identity().to_bytes())
        .option_max_packet_size(STREAMING_MTU as u16)
        .option_signature(keys.signature_len())
        .payload(payload.to_vec())
        .build_signed(|image| keys.sign(image))
}
