use std::fmt::{Debug, Formatter};

use anyhow::bail;
use bytes::{BufMut, BytesMut};
use num_enum::{IntoPrimitive, TryFromPrimitive};
use tracing::trace;

use crate::packet::compress::Compressor;
use crate::packet::crypto::PacketCrypto;
use crate::util::safe_converter::{PrecheckedCast, SafeCast};

/// size of a command packet's header after the size prefix: connection id + proto id
pub const OPT_SIZE_CMD: usize = 6;
/// size of a data packet's header after the size prefix: connection id, proto id, version, flags
pub const OPT_SIZE_DATA: usize = 8;
pub const MAX_PACKET_SIZE: usize = 32 * 1024;

pub const FLAG_ZLIB: u8 = 0x01;
pub const FLAG_XOR: u8 = 0x02;
pub const FLAG_HMAC_SHA1: u8 = 0x04;
/// any of the bits reserved for signature algorithms - a set bit means the payload is preceded by
///  a length-prefixed signature block
pub const SIGN_FLAGS_MASK: u8 = 0x0C;

pub const CMD_PING: u16 = 0x0000;
pub const CMD_REGISTER: u16 = 0x0001;

const OFFSET_CONN_ID: usize = 2;
const OFFSET_PROTO_ID: usize = 6;
const OFFSET_PROTO_VER: usize = 8;
const OFFSET_DATA_FLAG: usize = 9;
const OFFSET_SIGN_LEN: usize = 2 + OPT_SIZE_DATA;

/// The command codes carried in the proto id of a command packet
#[repr(u16)]
#[derive(Debug, Copy, Clone, Eq, PartialEq, TryFromPrimitive, IntoPrimitive)]
pub enum Command {
    Ping = CMD_PING,
    Register = CMD_REGISTER,
}

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum PacketKind {
    /// a control packet, with the raw command code (which may be unknown to this side)
    Command(u16),
    /// a request to be routed by module / action id
    Request,
}

/// Checks that `b` is a complete packet: its length is within bounds, and the size prefix matches
///  the number of bytes following it. Returns the size prefix.
pub fn validate(b: &[u8]) -> anyhow::Result<u16> {
    let len = b.len();
    if !(OPT_SIZE_CMD..=MAX_PACKET_SIZE).contains(&len) {
        bail!("invalid packet size {}", len);
    }
    let data_size = u16::from_be_bytes([b[0], b[1]]);
    if data_size.safe_cast() != len - 2 {
        bail!("invalid packet size: size field is {}, but {} bytes follow it", data_size, len - 2);
    }
    Ok(data_size)
}

pub fn make_proto_id(mid: u8, aid: u8) -> u16 {
    u16::from_be_bytes([mid, aid])
}

pub fn split_proto_id(proto_id: u16) -> (u8, u8) {
    let [mid, aid] = proto_id.to_be_bytes();
    (mid, aid)
}

/// A packet of the tunnel protocol: a view with fixed-offset accessors over a byte buffer. The
///  buffer is typically pool owned ([crate::pool::buffer_pool::PooledBuf]), a borrowed slice or a
///  [BytesMut].
///
/// ```text
/// | size (2) | conn id (4) | mid (1) | aid (1) | version (1) | flags (1) | [sign len (1) | sign] | payload |
/// ```
///
/// All multi-byte fields are big endian. Command packets (ping, register) end after the proto id.
#[derive(Clone, Eq, PartialEq)]
pub struct Packet<B = BytesMut> {
    buf: B,
}

impl Packet<BytesMut> {
    /// creates a zeroed packet with the given size prefix
    pub fn new(data_size: u16) -> Packet {
        let mut buf = BytesMut::with_capacity(2 + data_size.safe_cast());
        buf.put_u16(data_size);
        buf.resize(2 + data_size.safe_cast(), 0);
        Packet { buf }
    }

    /// Builds a data packet around `payload`: the payload is passed through the compressor first
    ///  (which may leave it as is), and a signature block is written only if a non-empty signature
    ///  is passed.
    pub fn from_payload(payload: &[u8], sign: Option<&[u8]>, compressor: &dyn Compressor) -> anyhow::Result<Packet> {
        let zlib_payload = compressor.compress(payload)?;
        let (payload, compressed) = match &zlib_payload {
            Some(z) => (z.as_slice(), true),
            None => (payload, false),
        };

        let sign = sign.filter(|s| !s.is_empty());
        let sign_block_len = match sign {
            Some(s) if s.len() > u8::MAX as usize => bail!("signature of {} bytes does not fit a one-byte length prefix", s.len()),
            Some(s) => 1 + s.len(),
            None => 0,
        };

        let total_len = 2 + OPT_SIZE_DATA + sign_block_len + payload.len();
        if total_len > MAX_PACKET_SIZE {
            bail!("packet of {} bytes exceeds the maximum packet size of {}", total_len, MAX_PACKET_SIZE);
        }

        let mut packet = Packet::new((total_len - 2).prechecked_cast());
        packet.set_zlib_compressed(compressed);
        if let Some(sign) = sign {
            packet.set_data_flag(FLAG_HMAC_SHA1);
            packet.set_data_sign(sign);
        }
        packet.set_data_load(&payload);
        Ok(packet)
    }

    pub fn ping() -> Packet {
        Self::command(0, Command::Ping)
    }

    /// a command packet announcing the sender's session id to the peer
    pub fn register(sid: u32) -> Packet {
        Self::command(sid, Command::Register)
    }

    fn command(conn_id: u32, command: Command) -> Packet {
        let mut packet = Packet::new(OPT_SIZE_CMD.prechecked_cast());
        packet.set_conn_id(conn_id);
        packet.set_proto_id(command.into());
        packet
    }

    pub fn into_bytes(self) -> BytesMut {
        self.buf
    }
}

impl <B: AsRef<[u8]>> Packet<B> {
    /// Wraps a received buffer after checking that it is a complete packet with at least the
    ///  command header, so that no field access can run past its end.
    pub fn from_bytes(buf: B) -> anyhow::Result<Packet<B>> {
        validate(buf.as_ref())?;
        let packet = Packet { buf };
        if !packet.is_valid() {
            bail!("packet of {} bytes is shorter than the command header", packet.len());
        }
        Ok(packet)
    }

    pub fn as_bytes(&self) -> &[u8] {
        self.buf.as_ref()
    }

    pub fn into_inner(self) -> B {
        self.buf
    }

    pub fn len(&self) -> usize {
        self.as_bytes().len()
    }

    pub fn is_empty(&self) -> bool {
        self.as_bytes().is_empty()
    }

    pub fn is_valid(&self) -> bool {
        self.len() >= 2 + OPT_SIZE_CMD
    }

    /// true for packets that end after the proto id, i.e. ping / register
    pub fn is_cmd_size(&self) -> bool {
        self.data_size().safe_cast() == OPT_SIZE_CMD
    }

    /// module id 0 is reserved for commands
    pub fn is_cmd_proto(&self) -> bool {
        self.mid() == 0
    }

    pub fn cmd(&self) -> u16 {
        self.proto_id()
    }

    pub fn kind(&self) -> PacketKind {
        if self.is_cmd_size() || self.is_cmd_proto() {
            PacketKind::Command(self.cmd())
        }
        else {
            PacketKind::Request
        }
    }

    fn byte_at(&self, offset: usize) -> u8 {
        self.as_bytes().get(offset).copied().unwrap_or(0)
    }

    pub fn data_size(&self) -> u16 {
        u16::from_be_bytes([self.byte_at(0), self.byte_at(1)])
    }

    pub fn conn_id(&self) -> u32 {
        u32::from_be_bytes([
            self.byte_at(OFFSET_CONN_ID),
            self.byte_at(OFFSET_CONN_ID + 1),
            self.byte_at(OFFSET_CONN_ID + 2),
            self.byte_at(OFFSET_CONN_ID + 3),
        ])
    }

    pub fn proto_id(&self) -> u16 {
        make_proto_id(self.mid(), self.aid())
    }

    pub fn mid(&self) -> u8 {
        self.byte_at(OFFSET_PROTO_ID)
    }

    pub fn aid(&self) -> u8 {
        self.byte_at(OFFSET_PROTO_ID + 1)
    }

    /// 0 for command packets, which have no version field
    pub fn proto_ver(&self) -> u8 {
        self.byte_at(OFFSET_PROTO_VER)
    }

    /// 0 for command packets, which have no flags field
    pub fn data_flag(&self) -> u8 {
        self.byte_at(OFFSET_DATA_FLAG)
    }

    pub fn has_data_flag(&self, flag: u8) -> bool {
        self.data_flag() & flag == flag
    }

    pub fn has_data_sign(&self) -> bool {
        self.data_flag() & SIGN_FLAGS_MASK != 0
    }

    pub fn is_zlib_compressed(&self) -> bool {
        self.has_data_flag(FLAG_ZLIB)
    }

    pub fn is_xor_encrypted(&self) -> bool {
        self.has_data_flag(FLAG_XOR)
    }

    /// the signature block's content, or `None` if the packet is not signed or the block runs past
    ///  the end of the packet
    pub fn data_sign(&self) -> Option<&[u8]> {
        if !self.has_data_sign() {
            return None;
        }
        let sign_len: usize = self.as_bytes().get(OFFSET_SIGN_LEN).copied()?.into();
        self.as_bytes().get(OFFSET_SIGN_LEN + 1 .. OFFSET_SIGN_LEN + 1 + sign_len)
    }

    fn data_load_index(&self) -> usize {
        if self.has_data_sign() {
            OFFSET_SIGN_LEN + 1 + self.byte_at(OFFSET_SIGN_LEN) as usize
        }
        else {
            2 + OPT_SIZE_DATA
        }
    }

    /// the (possibly compressed / obfuscated) payload - empty if the packet has none
    pub fn data_load(&self) -> &[u8] {
        self.as_bytes().get(self.data_load_index()..).unwrap_or(&[])
    }
}

impl <B: AsRef<[u8]> + AsMut<[u8]>> Packet<B> {
    pub fn as_bytes_mut(&mut self) -> &mut [u8] {
        self.buf.as_mut()
    }

    pub fn set_data_size(&mut self, data_size: u16) {
        self.as_bytes_mut()[..2].copy_from_slice(&data_size.to_be_bytes());
    }

    pub fn set_conn_id(&mut self, conn_id: u32) {
        self.as_bytes_mut()[OFFSET_CONN_ID..OFFSET_CONN_ID + 4].copy_from_slice(&conn_id.to_be_bytes());
    }

    pub fn set_proto_id(&mut self, proto_id: u16) {
        self.as_bytes_mut()[OFFSET_PROTO_ID..OFFSET_PROTO_ID + 2].copy_from_slice(&proto_id.to_be_bytes());
    }

    pub fn set_mid(&mut self, mid: u8) {
        self.as_bytes_mut()[OFFSET_PROTO_ID] = mid;
    }

    pub fn set_aid(&mut self, aid: u8) {
        self.as_bytes_mut()[OFFSET_PROTO_ID + 1] = aid;
    }

    /// # Panics
    /// on command packets, which have no version field
    pub fn set_proto_ver(&mut self, version: u8) {
        self.as_bytes_mut()[OFFSET_PROTO_VER] = version;
    }

    /// Adds flag bits; flags that are already set stay set.
    ///
    /// # Panics
    /// on command packets, which have no flags field
    pub fn set_data_flag(&mut self, flag: u8) {
        self.as_bytes_mut()[OFFSET_DATA_FLAG] |= flag;
    }

    /// Clears the ZLIB and / or XOR bits in `flag`; clearing a bit that is not set is a no-op.
    ///
    /// Signature bits are never cleared here: they determine where the payload starts, so a
    ///  packet can only lose its signed status by being rebuilt.
    ///
    /// # Panics
    /// on command packets, which have no flags field
    pub fn clear_data_flag(&mut self, flag: u8) {
        if flag & SIGN_FLAGS_MASK != 0 {
            trace!("ignoring request to clear signature flag bits {:#04x}", flag & SIGN_FLAGS_MASK);
        }
        self.as_bytes_mut()[OFFSET_DATA_FLAG] &= !(flag & !SIGN_FLAGS_MASK);
    }

    /// Overwrites the entire flags byte
    ///
    /// # Panics
    /// on command packets, which have no flags field
    pub fn reset_data_flag(&mut self, flag: u8) {
        self.as_bytes_mut()[OFFSET_DATA_FLAG] = flag;
    }

    pub fn set_zlib_compressed(&mut self, compressed: bool) {
        if compressed {
            self.set_data_flag(FLAG_ZLIB);
        }
    }

    fn set_data_sign(&mut self, sign: &[u8]) {
        let bytes = self.as_bytes_mut();
        bytes[OFFSET_SIGN_LEN] = sign.len().prechecked_cast();
        bytes[OFFSET_SIGN_LEN + 1 .. OFFSET_SIGN_LEN + 1 + sign.len()].copy_from_slice(sign);
    }

    fn set_data_load(&mut self, data: &[u8]) {
        let index = self.data_load_index();
        self.as_bytes_mut()[index..index + data.len()].copy_from_slice(data);
    }

    pub fn encrypt(&mut self, crypto: &dyn PacketCrypto) {
        crypto.encrypt(self.as_bytes_mut());
    }

    pub fn decrypt(&mut self, crypto: &dyn PacketCrypto) {
        crypto.decrypt(self.as_bytes_mut());
    }
}

impl <B: AsRef<[u8]>> Debug for Packet<B> {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        if self.is_cmd_size() {
            write!(f, "Packet{{conn_id:{}, cmd:{:#06x}}}", self.conn_id(), self.cmd())
        }
        else {
            write!(f, "Packet{{conn_id:{}, mid:{}, aid:{}, ver:{}, flags:{:#04x}, len:{}}}",
                   self.conn_id(), self.mid(), self.aid(), self.proto_ver(), self.data_flag(), self.len())
        }
    }
}
