use crate::identity::{Identity, IdentHash, PrivateKeys, TransientVerifier};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

/// A lease nearing its end date by this much is rotated away from
pub const LEASE_ENDDATE_THRESHOLD: Duration = Duration::from_millis(51_000);

/// How long the garlic layer gets to confirm a submitted lease set
pub const LEASESET_CONFIRMATION_TIMEOUT: Duration = Duration::from_millis(4_000);

/// One inbound gateway of a remote destination
#[derive(Clone, Debug)]
pub struct Lease {
    pub tunnel_gateway: IdentHash,
    pub tunnel_id: u32,
    pub end_date: Instant,
}

/// A signed record enumerating the current leases of a destination
pub struct LeaseSet {
    identity: Arc<Identity>,
    leases: Vec<Lease>,
    transient_verifier: Option<Arc<TransientVerifier>>,
    published_encrypted: bool,
}

impl LeaseSet {
    pub fn new(identity: Arc<Identity>, leases: Vec<Lease>) -> Self {
        Self {
            identity,
            leases,
            transient_verifier: None,
            published_encrypted: false,
        }
    }

    pub fn with_transient_verifier(mut self, verifier: Arc<TransientVerifier>) -> Self {
        self.transient_verifier = Some(verifier);
        self
    }

    pub fn published_encrypted(mut self) -> Self {
        self.published_encrypted = true;
        self
    }

    pub fn identity(&self) -> &Arc<Identity> {
        &self.identity
    }

    pub fn transient_verifier(&self) -> Option<Arc<TransientVerifier>> {
        self.transient_verifier.clone()
    }

    pub fn is_published_encrypted(&self) -> bool {
        self.published_encrypted
    }

    /// Expired once every lease has passed its end date
    pub fn is_expired(&self) -> bool {
        let now = Instant::now();
        self.leases.iter().all(|l| l.end_date <= now)
    }

    /// Leases still usable at this instant. `with_threshold` additionally
    /// admits leases expired by less than [`LEASE_ENDDATE_THRESHOLD`].
    pub fn non_expired_leases(&self, with_threshold: bool) -> Vec<Lease> {
        let now = Instant::now();
        self.leases
            .iter()
            .filter(|l| {
                if with_threshold {
                    l.end_date + LEASE_ENDDATE_THRESHOLD > now
                } else {
                    l.end_date > now
                }
            })
            .cloned()
            .collect()
    }
}

/// A wrapped message bound for a lease's gateway tunnel
pub struct TunnelMessageBlock {
    pub gateway: IdentHash,
    pub tunnel_id: u32,
    pub msg: Vec<u8>,
}

/// A locally owned anonymizing path for sending
pub trait OutboundTunnel: Send + Sync {
    fn tunnel_id(&self) -> u32;
    fn is_established(&self) -> bool;
    fn send_tunnel_data(&self, msgs: Vec<TunnelMessageBlock>);
}

/// Pool of outbound tunnels owned by the destination runtime
pub trait TunnelPool: Send + Sync {
    /// An established tunnel different from `current`, preferring ones
    /// compatible with `gateway`'s transports when known
    fn next_outbound_tunnel(
        &self,
        current: Option<&Arc<dyn OutboundTunnel>>,
        gateway: Option<&IdentHash>,
    ) -> Option<Arc<dyn OutboundTunnel>>;

    /// A replacement for a broken tunnel; the flag reports whether the
    /// returned tunnel is fresh (not the one passed in)
    fn new_outbound_tunnel(
        &self,
        current: Option<&Arc<dyn OutboundTunnel>>,
    ) -> (Option<Arc<dyn OutboundTunnel>>, bool);
}

/// Routing path shared between streams of one peer pair
#[derive(Clone)]
pub struct RoutingPath {
    pub outbound_tunnel: Arc<dyn OutboundTunnel>,
    pub remote_lease: Lease,
    /// Round-trip time observed on this path, in milliseconds
    pub rtt: u64,
}

/// Per-peer cryptographic session used to wrap outbound messages
pub trait RoutingSession: Send + Sync {
    fn is_ratchets(&self) -> bool;
    fn is_terminated(&self) -> bool;
    fn is_ready_to_send(&self) -> bool;
    fn is_lease_set_non_confirmed(&self) -> bool;
    fn is_lease_set_updated(&self) -> bool;
    fn lease_set_submission_time(&self) -> Instant;
    fn shared_routing_path(&self) -> Option<RoutingPath>;
    fn set_shared_routing_path(&self, path: Option<RoutingPath>);
    fn wrap_single_message(&self, msg: Vec<u8>) -> Vec<u8>;
}

/// Streaming knobs carried by the owner
pub struct StreamingConfig {
    /// Upper bound on delayed-ack wait, in milliseconds
    pub ack_delay: u64,
    /// Outbound rate limit in bytes per second; 0 disables pacing floor
    pub outbound_speed: u64,
    /// Compress data messages instead of the zero-compression wrapper
    pub gzip: bool,
    /// Answer inbound pings with pongs
    pub answer_pings: bool,
}

impl Default for StreamingConfig {
    fn default() -> Self {
        Self {
            ack_delay: 200,
            outbound_speed: 0,
            gzip: false,
            answer_pings: true,
        }
    }
}

/// The destination runtime a streaming engine runs inside.
///
/// Everything behind this trait — tunnel construction, lease-set lookup and
/// publication, garlic sessions — is out of scope for the stream itself;
/// these are the contracts it consumes.
pub trait Owner: Send + Sync {
    fn private_keys(&self) -> &PrivateKeys;
    fn streaming_config(&self) -> &StreamingConfig;

    /// Locally known lease set of a destination, if any
    fn find_lease_set(&self, ident: &IdentHash) -> Option<Arc<LeaseSet>>;
    /// Kick off a lease-set lookup for a future attempt
    fn request_destination(&self, ident: &IdentHash);
    /// Same, through an encrypted (blinded) lookup
    fn request_destination_encrypted(&self, ident: &IdentHash);

    fn tunnel_pool(&self) -> Arc<dyn TunnelPool>;
    fn routing_session(&self, remote: &Arc<LeaseSet>) -> Arc<dyn RoutingSession>;
}
