//! Frame encoding/decoding for the uplink
//!
//! Every frame is one binary WebSocket message whose first two bytes are
//! a big-endian prefix:
//!
//! ```text
//! 0x0000            DELETE     | session id (2B)
//! 0x0001/3/4 (ATYP) CONNECT    | session id (2B) | rep (1B) | port (2B) | addr (NB)
//! anything else     DATA       | payload (prefix is the session id)
//! ```
//!
//! CONNECT requests and replies share the layout; a request carries
//! rep = 0 as a placeholder and the destination address, a reply carries
//! the result code and the bound address. Domain addresses are raw ASCII
//! bytes with no length prefix (the address runs to the end of the
//! frame).
//!
//! Because session ids share the numeric space with the opcode prefixes,
//! the values {0, 1, 3, 4} are reserved and never valid as session ids.

use super::TunnelError;
use crate::socks::{Address, AddressType};
use bytes::{BufMut, Bytes, BytesMut};

/// Prefix announcing a deleted session
pub const PREFIX_DELETE: u16 = 0x0000;

/// Whether a value collides with an opcode prefix and must not be used
/// as a session id
pub fn is_reserved_session(id: u16) -> bool {
    matches!(id, 0 | 1 | 3 | 4)
}

/// CONNECT request/reply body
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectFrame {
    /// Session the connect belongs to
    pub session: u16,
    /// SOCKS5 reply code; 0 in requests
    pub rep: u8,
    /// Destination (request) or bound address (reply)
    pub addr: Address,
}

/// A decoded uplink frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    /// Peer announces a session is gone
    Delete { session: u16 },
    /// CONNECT request or reply
    Connect(ConnectFrame),
    /// Raw payload for a session
    Data { session: u16, payload: Bytes },
}

impl Frame {
    /// Create a CLOSE frame announcing `session` is finished on our side
    pub fn close(session: u16) -> Result<Self, TunnelError> {
        check_session(session)?;
        Ok(Frame::Delete { session })
    }

    /// Create a CONNECT request for a destination
    pub fn connect_request(session: u16, addr: Address) -> Result<Self, TunnelError> {
        check_session(session)?;
        Ok(Frame::Connect(ConnectFrame {
            session,
            rep: 0,
            addr,
        }))
    }

    /// Create a CONNECT reply
    pub fn connect_reply(session: u16, rep: u8, addr: Address) -> Result<Self, TunnelError> {
        check_session(session)?;
        Ok(Frame::Connect(ConnectFrame { session, rep, addr }))
    }

    /// Create a DATA frame
    pub fn data(session: u16, payload: Bytes) -> Result<Self, TunnelError> {
        check_session(session)?;
        Ok(Frame::Data { session, payload })
    }

    /// Session id the frame refers to
    pub fn session(&self) -> u16 {
        match self {
            Frame::Delete { session } => *session,
            Frame::Connect(connect) => connect.session,
            Frame::Data { session, .. } => *session,
        }
    }

    /// Encode to wire bytes
    pub fn encode(&self) -> Bytes {
        match self {
            Frame::Delete { session } => {
                let mut buf = BytesMut::with_capacity(4);
                buf.put_u16(PREFIX_DELETE);
                buf.put_u16(*session);
                buf.freeze()
            }
            Frame::Connect(connect) => {
                let addr = connect.addr.raw();
                let mut buf = BytesMut::with_capacity(7 + addr.len());
                buf.put_u16(connect.addr.atyp() as u16);
                buf.put_u16(connect.session);
                buf.put_u8(connect.rep);
                buf.put_u16(connect.addr.port());
                buf.put_slice(addr);
                buf.freeze()
            }
            Frame::Data { session, payload } => {
                let mut buf = BytesMut::with_capacity(2 + payload.len());
                buf.put_u16(*session);
                buf.put_slice(payload);
                buf.freeze()
            }
        }
    }

    /// Decode a wire frame. The payload of a DATA frame is a zero-copy
    /// slice of the input buffer.
    pub fn decode(buf: &Bytes) -> Result<Self, TunnelError> {
        if buf.len() < 2 {
            return Err(TunnelError::InvalidFrame(format!(
                "frame too short: {} bytes",
                buf.len()
            )));
        }
        let prefix = u16::from_be_bytes([buf[0], buf[1]]);

        match prefix {
            PREFIX_DELETE => {
                if buf.len() < 4 {
                    return Err(TunnelError::InvalidFrame("short delete frame".to_string()));
                }
                let session = u16::from_be_bytes([buf[2], buf[3]]);
                check_session(session)?;
                Ok(Frame::Delete { session })
            }
            1 | 3 | 4 => {
                if buf.len() < 8 {
                    return Err(TunnelError::InvalidFrame("short connect frame".to_string()));
                }
                let atyp = AddressType::try_from(prefix as u8)
                    .map_err(|e| TunnelError::InvalidFrame(e.to_string()))?;
                let session = u16::from_be_bytes([buf[2], buf[3]]);
                check_session(session)?;
                let rep = buf[4];
                let port = u16::from_be_bytes([buf[5], buf[6]]);
                let addr = Address::from_raw(atyp, &buf[7..], port)
                    .map_err(|e| TunnelError::InvalidFrame(e.to_string()))?;
                Ok(Frame::Connect(ConnectFrame { session, rep, addr }))
            }
            session => Ok(Frame::Data {
                session,
                payload: buf.slice(2..),
            }),
        }
    }
}

fn check_session(session: u16) -> Result<(), TunnelError> {
    if is_reserved_session(session) {
        return Err(TunnelError::ReservedSession(session));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_close_frame_wire_format() {
        let frame = Frame::close(0xBEEF).unwrap();
        let encoded = frame.encode();
        assert_eq!(&encoded[..], &[0x00, 0x00, 0xBE, 0xEF]);

        let decoded = Frame::decode(&encoded).unwrap();
        assert_eq!(decoded, frame);
    }

    #[test]
    fn test_connect_request_ipv4_wire_format() {
        let addr = Address::Ipv4([93, 184, 216, 34], 80);
        let frame = Frame::connect_request(0x1234, addr).unwrap();
        let encoded = frame.encode();

        assert_eq!(
            &encoded[..],
            &[0x00, 0x01, 0x12, 0x34, 0x00, 0x00, 0x50, 93, 184, 216, 34]
        );
    }

    #[test]
    fn test_connect_request_domain_payload_is_ascii() {
        let addr = Address::Domain("example.com".to_string(), 443);
        let frame = Frame::connect_request(5000, addr).unwrap();
        let encoded = frame.encode();

        assert_eq!(&encoded[..2], &[0x00, 0x03]);
        assert_eq!(&encoded[7..], b"example.com");

        let decoded = Frame::decode(&encoded).unwrap();
        assert_eq!(decoded, frame);
    }

    #[test]
    fn test_connect_reply_decode() {
        // Success reply bound to 0.0.0.0:0 for session 0x1F90
        let raw = Bytes::from_static(&[0x00, 0x01, 0x1F, 0x90, 0x00, 0x00, 0x00, 0, 0, 0, 0]);
        let frame = Frame::decode(&raw).unwrap();

        match frame {
            Frame::Connect(connect) => {
                assert_eq!(connect.session, 0x1F90);
                assert_eq!(connect.rep, 0);
                assert_eq!(connect.addr, Address::Ipv4([0, 0, 0, 0], 0));
            }
            other => panic!("expected connect frame, got {:?}", other),
        }
    }

    #[test]
    fn test_data_frame_roundtrip() {
        let payload = Bytes::from_static(b"GET / HTTP/1.1\r\n\r\n");
        let frame = Frame::data(40000, payload.clone()).unwrap();
        let encoded = frame.encode();

        assert_eq!(&encoded[..2], &[0x9C, 0x40]);

        let decoded = Frame::decode(&encoded).unwrap();
        match decoded {
            Frame::Data { session, payload: p } => {
                assert_eq!(session, 40000);
                assert_eq!(p, payload);
            }
            other => panic!("expected data frame, got {:?}", other),
        }
    }

    #[test]
    fn test_reserved_session_ids_refused() {
        for id in [0u16, 1, 3, 4] {
            assert!(Frame::close(id).is_err());
            assert!(Frame::data(id, Bytes::new()).is_err());
            assert!(Frame::connect_request(id, Address::Ipv4([1, 2, 3, 4], 80)).is_err());
        }
        // 2 is not an opcode and is a legal session id
        assert!(Frame::data(2, Bytes::new()).is_ok());
    }

    #[test]
    fn test_reserved_session_in_delete_rejected() {
        let raw = Bytes::from_static(&[0x00, 0x00, 0x00, 0x01]);
        assert!(matches!(
            Frame::decode(&raw),
            Err(TunnelError::ReservedSession(1))
        ));
    }

    #[test]
    fn test_short_frames_rejected() {
        assert!(Frame::decode(&Bytes::new()).is_err());
        assert!(Frame::decode(&Bytes::from_static(&[0x00])).is_err());
        assert!(Frame::decode(&Bytes::from_static(&[0x00, 0x00, 0x01])).is_err());
        assert!(Frame::decode(&Bytes::from_static(&[0x00, 0x01, 0x12, 0x34])).is_err());
    }

    #[test]
    fn test_connect_with_bad_address_length_rejected() {
        // IPv4 connect with a 3-byte address
        let raw = Bytes::from_static(&[0x00, 0x01, 0x12, 0x34, 0x00, 0x00, 0x50, 93, 184, 216]);
        assert!(matches!(
            Frame::decode(&raw),
            Err(TunnelError::InvalidFrame(_))
        ));
    }
}
