use std::fmt::{Debug, Formatter};

use anyhow::bail;

use crate::packet::crypto::PacketCrypto;
use crate::packet::packet::{Packet, PacketKind, OPT_SIZE_DATA};
use crate::pool::buffer_pool::PooledBuf;

/// A routed request: a view of a received data packet. The packet's buffer goes back to its pool
///  when the request is dropped.
pub struct Request {
    packet: Packet<PooledBuf>,
}

impl Request {
    /// Decodes a packet received directly from a client: it is decrypted first. Command packets
    ///  are rejected, they are not routed.
    pub fn from_client(mut packet: Packet<PooledBuf>, crypto: &dyn PacketCrypto) -> anyhow::Result<Request> {
        if !packet.is_valid() {
            bail!("invalid packet of {} bytes", packet.len());
        }
        packet.decrypt(crypto);
        Self::from_agent(packet)
    }

    /// Decodes a packet received through the tunnel. There is no decryption on this leg.
    pub fn from_agent(packet: Packet<PooledBuf>) -> anyhow::Result<Request> {
        if let PacketKind::Command(cmd) = packet.kind() {
            bail!("command packet {:#06x} is not a routed request", cmd);
        }
        if packet.len() < 2 + OPT_SIZE_DATA {
            bail!("request packet of {} bytes has no flags field", packet.len());
        }
        Ok(Request { packet })
    }

    pub fn conn_id(&self) -> u32 {
        self.packet.conn_id()
    }

    pub fn mid(&self) -> u8 {
        self.packet.mid()
    }

    pub fn aid(&self) -> u8 {
        self.packet.aid()
    }

    pub fn proto_ver(&self) -> u8 {
        self.packet.proto_ver()
    }

    pub fn data_flag(&self) -> u8 {
        self.packet.data_flag()
    }

    pub fn data(&self) -> &[u8] {
        self.packet.data_load()
    }

    pub fn sign(&self) -> Option<&[u8]> {
        self.packet.data_sign()
    }

    pub fn packet(&self) -> &Packet<PooledBuf> {
        &self.packet
    }

    pub fn into_packet(self) -> Packet<PooledBuf> {
        self.packet
    }
}

impl Debug for Request {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "Request{{conn_id:{}, mid:{}, aid:{}, ver:{}, len:{}}}", self.conn_id(), self.mid(), self.aid(), self.proto_ver(), self.data().len())
    }
}
