use anyhow::bail;

use crate::config::TunnelConfig;
use crate::packet::compress::{zlib_decompress, ZlibCompressor};
use crate::packet::crypto::{PacketCrypto, XorCrypto};
use crate::packet::packet::Packet;
use crate::packet::signature::{HmacSha1Signature, Signature};
use crate::pool::SessionPools;

/// Payload handling for applications on either end of the tunnel. The tunnel itself carries
///  payloads as they are; this is where they are compressed, signed and obfuscated the way the
///  configuration says.
///
/// Signatures are computed over the uncompressed payload, keyed by the configured sign secret and
///  a per-session token.
pub struct PayloadCodec {
    compressor: ZlibCompressor,
    signature: HmacSha1Signature,
    crypto: XorCrypto,
}

impl PayloadCodec {
    pub fn new(config: &TunnelConfig, pools: &SessionPools) -> anyhow::Result<PayloadCodec> {
        Ok(PayloadCodec {
            compressor: pools.compressor(config),
            signature: config.signature(),
            crypto: config.crypto()?,
        })
    }

    /// A request as a client sends it: compressed above the threshold, signed if there is a
    ///  session token, and XOR encrypted
    pub fn encode_request(&self, mid: u8, aid: u8, ver: u8, payload: &[u8], token: Option<&[u8]>) -> anyhow::Result<Packet> {
        let sign = match token {
            Some(token) => Some(self.signature.sum(token, payload)?),
            None => None,
        };

        let mut packet = Packet::from_payload(payload, sign.as_deref(), &self.compressor)?;
        packet.set_mid(mid);
        packet.set_aid(aid);
        packet.set_proto_ver(ver);
        packet.encrypt(&self.crypto);
        Ok(packet)
    }

    /// The plain payload of a received packet. An encrypted packet is decrypted in place. With a
    ///  session token the packet must carry a valid signature.
    pub fn decode_payload<B: AsRef<[u8]> + AsMut<[u8]>>(&self, packet: &mut Packet<B>, token: Option<&[u8]>) -> anyhow::Result<Vec<u8>> {
        packet.decrypt(&self.crypto);

        let payload = if packet.is_zlib_compressed() {
            zlib_decompress(packet.data_load())?
        }
        else {
            packet.data_load().to_vec()
        };

        if let Some(token) = token {
            let Some(sign) = packet.data_sign()
            else {
                bail!("payload is not signed");
            };
            if !self.signature.verify(token, &payload, sign)? {
                bail!("payload signature does not match");
            }
        }
        Ok(payload)
    }
}
