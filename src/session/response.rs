use crate::packet::compress::NoneCompressor;
use crate::packet::crypto::PacketCrypto;
use crate::packet::packet::{Packet, FLAG_ZLIB};
use crate::session::request::Request;
use crate::session::router::Marshal;

/// A response to a routed request, encoded as a data packet with the request's module id, action
///  id and version
pub struct Response<'a> {
    pub mid: u8,
    pub aid: u8,
    pub ver: u8,
    /// only the ZLIB bit is carried over: the encoded packet has no signature block, and XOR is
    ///  applied (or not) by [Response::encode]
    pub flag: u8,
    pub result: &'a dyn Marshal,
}

impl <'a> Response<'a> {
    pub fn for_request(request: &Request, result: &'a dyn Marshal) -> Response<'a> {
        Response {
            mid: request.mid(),
            aid: request.aid(),
            ver: request.proto_ver(),
            flag: 0,
            result,
        }
    }

    pub fn encode(&self, conn_id: u32, crypto: Option<&dyn PacketCrypto>) -> anyhow::Result<Packet> {
        let payload = self.result.marshal()?;
        let mut packet = Packet::from_payload(&payload, None, &NoneCompressor)?;
        packet.set_conn_id(conn_id);
        packet.set_mid(self.mid);
        packet.set_aid(self.aid);
        packet.set_proto_ver(self.ver);
        packet.set_data_flag(self.flag & FLAG_ZLIB);
        if let Some(crypto) = crypto {
            packet.encrypt(crypto);
        }
        Ok(packet)
    }

    /// The response as a client gets it: connection id 0, XOR encrypted
    pub fn encode_for_client(&self, crypto: &dyn PacketCrypto) -> anyhow::Result<Packet> {
        self.encode(0, Some(crypto))
    }
}

#[cfg(test)]
mod tests {
    use bytes::Bytes;
    use crate::packet::crypto::XorCrypto;
    use crate::packet::packet::{FLAG_HMAC_SHA1, FLAG_XOR};
    use crate::session::router::{BytesResult, MockMarshal};
    use super::*;

    fn response(flag: u8, result: &dyn Marshal) -> Response<'_> {
        Response {
            mid: 3,
            aid: 4,
            ver: 5,
            flag,
            result,
        }
    }

    #[test]
    fn test_encode_for_tunnel() {
        let result = BytesResult(Bytes::from_static(b"result"));
        let packet = response(0, &result).encode(4711, None).unwrap();
        assert_eq!(packet.conn_id(), 4711);
        assert_eq!((packet.mid(), packet.aid(), packet.proto_ver()), (3, 4, 5));
        assert_eq!(packet.data_flag(), 0);
        assert_eq!(packet.data_load(), b"result");
    }

    #[test]
    fn test_encode_for_client() {
        let crypto = XorCrypto::new(b"tunnelmux").unwrap();
        let result = BytesResult(Bytes::from_static(b"result"));
        let mut packet = response(FLAG_ZLIB | FLAG_HMAC_SHA1, &result).encode_for_client(&crypto).unwrap();
        assert_eq!(packet.data_flag(), FLAG_ZLIB | FLAG_XOR);

        packet.decrypt(&crypto);
        assert_eq!(packet.conn_id(), 0);
        assert_eq!(packet.data_flag(), FLAG_ZLIB);
        assert_eq!(packet.data_load(), b"result");
    }

    #[test]
    fn test_marshal_failure() {
        let mut result = MockMarshal::new();
        result.expect_marshal()
            .once()
            .returning(|| Err(anyhow::anyhow!("broken")));
        assert!(response(0, &result).encode(1, None).is_err());
    }
}
