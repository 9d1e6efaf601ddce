use anyhow::anyhow;
use hmac::{Hmac, Mac};
use sha1::Sha1;

/// Computes payload signatures. The tunnel only carries signatures; verifying them is up to
///  whoever consumes the payload.
pub trait Signature: Send + Sync {
    fn sum(&self, token: &[u8], data: &[u8]) -> anyhow::Result<Vec<u8>>;

    fn verify(&self, token: &[u8], data: &[u8], sign: &[u8]) -> anyhow::Result<bool>;
}

type HmacSha1 = Hmac<Sha1>;

/// HMAC-SHA1 over the payload, keyed by a shared secret followed by a per-session token
pub struct HmacSha1Signature {
    secret: Vec<u8>,
}

impl HmacSha1Signature {
    pub fn new(secret: &[u8]) -> HmacSha1Signature {
        HmacSha1Signature {
            secret: secret.to_vec(),
        }
    }

    fn mac(&self, token: &[u8], data: &[u8]) -> anyhow::Result<HmacSha1> {
        let mut key = Vec::with_capacity(self.secret.len() + token.len());
        key.extend_from_slice(&self.secret);
        key.extend_from_slice(token);

        let mut mac = HmacSha1::new_from_slice(&key)
            .map_err(|e| anyhow!("invalid HMAC key: {}", e))?;
        mac.update(data);
        Ok(mac)
    }
}

impl Signature for HmacSha1Signature {
    fn sum(&self, token: &[u8], data: &[u8]) -> anyhow::Result<Vec<u8>> {
        Ok(self.mac(token, data)?
            .finalize()
            .into_bytes()
            .to_vec())
    }

    fn verify(&self, token: &[u8], data: &[u8], sign: &[u8]) -> anyhow::Result<bool> {
        Ok(self.mac(token, data)?
            .verify_slice(sign)
            .is_ok())
    }
}
