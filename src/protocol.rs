use crate::error::{Error, Result};
use bytes::{BufMut, BytesMut};

/// Protocol flags
pub const FLAG_SYN: u16 = 0x01; // Synchronize (open stream)
pub const FLAG_CLOSE: u16 = 0x02; // Close stream gracefully
pub const FLAG_RESET: u16 = 0x04; // Reset stream (abort)
pub const FLAG_SIGNATURE_INCLUDED: u16 = 0x08;
pub const FLAG_SIGNATURE_REQUESTED: u16 = 0x10;
pub const FLAG_FROM_INCLUDED: u16 = 0x20;
pub const FLAG_DELAY_REQUESTED: u16 = 0x40;
pub const FLAG_MAX_PACKET_SIZE_INCLUDED: u16 = 0x80;
pub const FLAG_PROFILE_INTERACTIVE: u16 = 0x100;
pub const FLAG_ECHO: u16 = 0x200;
pub const FLAG_NO_ACK: u16 = 0x400;
pub const FLAG_OFFLINE_SIGNATURE: u16 = 0x800;

/// Maximum wire size of a single packet
pub const MAX_PACKET_SIZE: usize = 4096;

/// Payload ceiling for ElGamal/AES routing sessions
pub const STREAMING_MTU: usize = 1730;

/// Payload ceiling for ratchet routing sessions
pub const STREAMING_MTU_RATCHETS: usize = 1812;

/// Header size with an empty NACK list and no options
pub const MIN_HEADER_SIZE: usize = 22;

fn be32(buf: &[u8]) -> u32 {
    u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]])
}

fn be16(buf: &[u8]) -> u16 {
    u16::from_be_bytes([buf[0], buf[1]])
}

/// A single protocol datagram.
///
/// Wire format (all integers big-endian):
/// ```text
/// [sendStreamID: u32][receiveStreamID: u32][sequenceNumber: u32][ackThrough: u32]
/// [nackCount: u8][NACKs: u32 x nackCount][resendDelay: u8][flags: u16]
/// [optionsSize: u16][options][payload]
/// ```
///
/// The packet owns its wire buffer; accessors are bounds-checked once at
/// [`Packet::from_buffer`] so they never re-validate. A read cursor lets the
/// receive queue drain a payload across several application reads.
#[derive(Debug, Clone)]
pub struct Packet {
    buf: Vec<u8>,
    /// Read cursor into the payload, advanced by [`Packet::consume`]
    cursor: usize,
}

impl Packet {
    /// Validate and adopt a wire buffer
    pub fn from_buffer(buf: Vec<u8>) -> Result<Self> {
        if buf.len() > MAX_PACKET_SIZE {
            return Err(Error::PacketTooLarge(buf.len(), MAX_PACKET_SIZE));
        }
        if buf.len() < MIN_HEADER_SIZE {
            return Err(Error::Protocol(format!(
                "packet too short: {} bytes (expected at least {})",
                buf.len(),
                MIN_HEADER_SIZE
            )));
        }
        let nack_count = buf[16] as usize;
        let fixed = MIN_HEADER_SIZE + nack_count * 4;
        if buf.len() < fixed {
            return Err(Error::Protocol(format!(
                "truncated NACK list: {} entries do not fit in {} bytes",
                nack_count,
                buf.len()
            )));
        }
        let options_size = be16(&buf[fixed - 2..]) as usize;
        if buf.len() < fixed + options_size {
            return Err(Error::Protocol(format!(
                "truncated options: {} bytes declared, {} available",
                options_size,
                buf.len() - fixed
            )));
        }
        Ok(Self { buf, cursor: 0 })
    }

    /// Whole wire image
    pub fn as_bytes(&self) -> &[u8] {
        &self.buf
    }

    pub(crate) fn buf_mut(&mut self) -> &mut [u8] {
        &mut self.buf
    }

    /// Wire length of the packet
    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    pub fn send_stream_id(&self) -> u32 {
        be32(&self.buf[0..])
    }

    pub fn receive_stream_id(&self) -> u32 {
        be32(&self.buf[4..])
    }

    pub fn seqn(&self) -> u32 {
        be32(&self.buf[8..])
    }

    pub fn ack_through(&self) -> u32 {
        be32(&self.buf[12..])
    }

    pub fn nack_count(&self) -> usize {
        self.buf[16] as usize
    }

    /// NACK entry `i`; caller keeps `i < nack_count()`
    pub fn nack(&self, i: usize) -> u32 {
        be32(&self.buf[17 + i * 4..])
    }

    /// Raw NACK block. A first SYN carries the remote destination hash here.
    pub fn nack_bytes(&self) -> &[u8] {
        &self.buf[17..17 + self.nack_count() * 4]
    }

    /// Requested resend delay in seconds
    pub fn resend_delay(&self) -> u8 {
        self.buf[17 + self.nack_count() * 4]
    }

    pub fn flags(&self) -> u16 {
        be16(&self.buf[18 + self.nack_count() * 4..])
    }

    /// Offset of the options block within the wire buffer
    pub(crate) fn options_offset(&self) -> usize {
        MIN_HEADER_SIZE + self.nack_count() * 4
    }

    pub fn option_size(&self) -> usize {
        be16(&self.buf[20 + self.nack_count() * 4..]) as usize
    }

    pub fn option_data(&self) -> &[u8] {
        let start = self.options_offset();
        &self.buf[start..start + self.option_size()]
    }

    fn payload_offset(&self) -> usize {
        self.options_offset() + self.option_size()
    }

    pub fn payload(&self) -> &[u8] {
        &self.buf[self.payload_offset()..]
    }

    /// Undrained payload bytes
    pub fn remaining(&self) -> &[u8] {
        &self.buf[self.payload_offset() + self.cursor..]
    }

    /// Advance the payload read cursor
    pub fn consume(&mut self, n: usize) {
        self.cursor = (self.cursor + n).min(self.buf.len() - self.payload_offset());
    }

    pub fn is_syn(&self) -> bool {
        self.flags() & FLAG_SYN != 0
    }

    pub fn is_echo(&self) -> bool {
        self.flags() & FLAG_ECHO != 0
    }

    pub fn is_no_ack(&self) -> bool {
        self.flags() & FLAG_NO_ACK != 0
    }

    /// seqn 0 with no flags is a bare acknowledgement
    pub fn is_plain_ack(&self) -> bool {
        self.seqn() == 0 && self.flags() == 0
    }

    /// Run `verify` over the wire image with the signature bytes at
    /// `sig_offset..sig_offset + sig_len` zeroed, restoring them afterwards so
    /// later inspection sees the original buffer.
    pub(crate) fn verify_with<F>(&mut self, sig_offset: usize, sig_len: usize, verify: F) -> bool
    where
        F: FnOnce(&[u8], &[u8]) -> bool,
    {
        if sig_offset + sig_len > self.buf.len() || sig_len > 256 {
            return false;
        }
        let mut signature = [0u8; 256];
        signature[..sig_len].copy_from_slice(&self.buf[sig_offset..sig_offset + sig_len]);
        self.buf[sig_offset..sig_offset + sig_len].fill(0);
        let ok = verify(&self.buf, &signature[..sig_len]);
        self.buf[sig_offset..sig_offset + sig_len].copy_from_slice(&signature[..sig_len]);
        ok
    }
}

/// NACK block of an outgoing packet
enum Nacks {
    List(Vec<u32>),
    /// Eight slots carrying the expected remote destination hash (first SYN only)
    DestinationHash([u8; 32]),
}

/// Assembles an outgoing packet.
///
/// Options must be appended in flag order (delay, from, max packet size,
/// offline signature, signature); the builder records where the signature
/// placeholder lands so [`PacketBuilder::build_signed`] can sign the image
/// with the placeholder zeroed and patch the signature in place.
pub struct PacketBuilder {
    send_stream_id: u32,
    receive_stream_id: u32,
    seqn: u32,
    ack_through: u32,
    nacks: Nacks,
    resend_delay: u8,
    flags: u16,
    options: BytesMut,
    signature: Option<(usize, usize)>,
    payload: Vec<u8>,
}

impl PacketBuilder {
    pub fn new(send_stream_id: u32, receive_stream_id: u32, seqn: u32, ack_through: u32) -> Self {
        Self {
            send_stream_id,
            receive_stream_id,
            seqn,
            ack_through,
            nacks: Nacks::List(Vec::new()),
            resend_delay: 0,
            flags: 0,
            options: BytesMut::new(),
            signature: None,
            payload: Vec::new(),
        }
    }

    pub fn nacks(mut self, nacks: Vec<u32>) -> Self {
        self.nacks = Nacks::List(nacks);
        self
    }

    /// First-SYN destination guard: 8 NACK slots holding the remote ident hash
    pub fn destination_hash(mut self, hash: [u8; 32]) -> Self {
        self.nacks = Nacks::DestinationHash(hash);
        self
    }

    pub fn resend_delay(mut self, secs: u8) -> Self {
        self.resend_delay = secs;
        self
    }

    pub fn flags(mut self, flags: u16) -> Self {
        self.flags = flags;
        self
    }

    pub fn option_delay(mut self, millis: u16) -> Self {
        self.options.put_u16(millis);
        self
    }

    pub fn option_from(mut self, identity: &[u8]) -> Self {
        self.options.put_slice(identity);
        self
    }

    pub fn option_max_packet_size(mut self, mtu: u16) -> Self {
        self.options.put_u16(mtu);
        self
    }

    pub fn option_offline_signature(mut self, block: &[u8]) -> Self {
        self.options.put_slice(block);
        self
    }

    /// Reserve `len` zeroed bytes for the packet signature
    pub fn option_signature(mut self, len: usize) -> Self {
        self.signature = Some((self.options.len(), len));
        self.options.put_bytes(0, len);
        self
    }

    pub fn payload(mut self, payload: Vec<u8>) -> Self {
        self.payload = payload;
        self
    }

    fn encode(self) -> (Vec<u8>, Option<(usize, usize)>) {
        let nack_len = match &self.nacks {
            Nacks::List(list) => list.len() * 4,
            Nacks::DestinationHash(_) => 32,
        };
        let mut buf =
            BytesMut::with_capacity(MIN_HEADER_SIZE + nack_len + self.options.len() + self.payload.len());
        buf.put_u32(self.send_stream_id);
        buf.put_u32(self.receive_stream_id);
        buf.put_u32(self.seqn);
        buf.put_u32(self.ack_through);
        match &self.nacks {
            Nacks::List(list) => {
                buf.put_u8(list.len() as u8);
                for nack in list {
                    buf.put_u32(*nack);
                }
            }
            Nacks::DestinationHash(hash) => {
                buf.put_u8(8);
                buf.put_slice(hash);
            }
        }
        buf.put_u8(self.resend_delay);
        buf.put_u16(self.flags);
        buf.put_u16(self.options.len() as u16);
        let options_offset = buf.len();
        buf.put_slice(&self.options);
        buf.put_slice(&self.payload);
        let signature = self
            .signature
            .map(|(offset, len)| (options_offset + offset, len));
        (buf.to_vec(), signature)
    }

    /// Assemble an unsigned packet
    pub fn build(self) -> Packet {
        let (buf, _) = self.encode();
        Packet { buf, cursor: 0 }
    }

    /// Assemble the packet, sign the image with the signature field zeroed,
    /// and patch the signature in place.
    pub fn build_signed<F>(self, sign: F) -> Packet
    where
        F: FnOnce(&[u8]) -> Vec<u8>,
    {
        let (mut buf, signature) = self.encode();
        if let Some((offset, len)) = signature {
            let sig = sign(&buf);
            let n = len.min(sig.len());
            buf[offset..offset + n].copy_from_slice(&sig[..n]);
        }
        Packet { buf, cursor: 0 }
    }
}
