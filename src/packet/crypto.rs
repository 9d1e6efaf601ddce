use anyhow::bail;

use crate::packet::packet::{FLAG_XOR, OPT_SIZE_DATA};

const HEADER_START: usize = 2;
const FLAG_OFFSET: usize = 9;
const PAYLOAD_START: usize = 2 + OPT_SIZE_DATA;

/// A reversible transform over an entire packet buffer. Implementations must keep the size prefix
///  and the flags byte readable, and must record in the flags byte whether the packet is currently
///  transformed.
pub trait PacketCrypto: Send + Sync {
    fn encrypt(&self, packet: &mut [u8]);

    /// a no-op if the packet is not currently encrypted
    fn decrypt(&self, packet: &mut [u8]);
}

/// XOR obfuscation with keys derived from packet fields.
///
/// The header range (conn id, proto id, version) is keyed by the two size prefix bytes, the
///  payload range (everything after the flags byte) by module and action id. The flags byte itself
///  stays in the clear. Key bytes that are zero are replaced from the configured secret so that no
///  range is ever left unmasked.
///
/// This is obfuscation, not encryption: it keeps the wire format opaque to casual inspection and
///  offers no confidentiality.
pub struct XorCrypto {
    secret: [u8; 2],
}

impl XorCrypto {
    pub fn new(secret: &[u8]) -> anyhow::Result<XorCrypto> {
        match secret {
            [a, b, ..] if *a != 0 && *b != 0 => Ok(XorCrypto { secret: [*a, *b] }),
            _ => bail!("XOR secret must have at least two bytes, and the first two must not be zero"),
        }
    }

    fn fix_key(&self, mut key: [u8; 2]) -> [u8; 2] {
        let mut secret_idx = 0;
        if key[0] == 0 {
            key[0] = self.secret[0];
            secret_idx = 1;
        }
        if key[1] == 0 {
            key[1] = self.secret[secret_idx];
        }
        key
    }

    fn xor_header(&self, packet: &mut [u8]) {
        let key = self.fix_key([packet[0], packet[1]]);
        let end = FLAG_OFFSET.min(packet.len());
        for i in HEADER_START..end {
            packet[i] ^= key[i & 1];
        }
    }

    fn xor_payload(&self, packet: &mut [u8]) {
        let key = self.fix_key([packet[6], packet[7]]);
        for i in PAYLOAD_START..packet.len() {
            packet[i] ^= key[i & 1];
        }
    }
}

impl PacketCrypto for XorCrypto {
    fn encrypt(&self, packet: &mut [u8]) {
        // control packets have no flags byte to record the transform in
        if packet.len() <= FLAG_OFFSET {
            return;
        }
        self.xor_payload(packet);
        self.xor_header(packet);
        packet[FLAG_OFFSET] |= FLAG_XOR;
    }

    fn decrypt(&self, packet: &mut [u8]) {
        if packet.len() <= FLAG_OFFSET || packet[FLAG_OFFSET] & FLAG_XOR == 0 {
            return;
        }
        self.xor_header(packet);
        self.xor_payload(packet);
        packet[FLAG_OFFSET] &= !FLAG_XOR;
    }
}
