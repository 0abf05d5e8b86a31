//! ESNI key record retrieval and parsing
//!
//! The server publishes its ESNI keys as a TXT record at
//! `_esni.<host>`: the record data is a quoted base64 string wrapping a
//! draft-02 `ESNIKeys` structure:
//!
//! ```text
//! struct {
//!     uint16 version;               // 0xff01
//!     uint8 checksum[4];            // first 4 bytes of SHA-256 over the
//!                                   // record with these bytes zeroed
//!     KeyShareEntry keys<4..2^16-1>;
//!     CipherSuite cipher_suites<2..2^16-2>;
//!     uint16 padded_length;
//!     uint64 not_before;
//!     uint64 not_after;
//!     Extension extensions<0..2^16-1>;
//! } ESNIKeys;
//! ```

use super::{DohClient, ResolveError};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use ring::digest;

/// ESNIKeys version for draft-02 records
pub const ESNI_KEYS_VERSION: u16 = 0xff01;

/// Offset of the checksum field inside the record
const CHECKSUM_OFFSET: usize = 2;

/// Length of the checksum field
const CHECKSUM_LEN: usize = 4;

/// A single key share published in the record
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyShare {
    /// TLS named group (e.g. 0x001d for x25519)
    pub group: u16,
    /// Raw key exchange bytes
    pub key_exchange: Vec<u8>,
}

/// Parsed ESNI key record
#[derive(Debug, Clone)]
pub struct EsniKeys {
    pub version: u16,
    pub keys: Vec<KeyShare>,
    pub cipher_suites: Vec<u16>,
    pub padded_length: u16,
    pub not_before: u64,
    pub not_after: u64,
}

/// Fetch and parse the ESNI keys for a domain over DoH
pub async fn fetch(doh: &DohClient, domain: &str) -> Result<EsniKeys, ResolveError> {
    let record_name = format!("_esni.{}", domain);
    let txt = doh.lookup_txt(&record_name).await?;

    // TXT record data arrives with its surrounding quote characters.
    let raw = BASE64.decode(txt.trim_matches('"'))?;
    EsniKeys::parse(&raw)
}

impl EsniKeys {
    /// Parse and checksum-verify a raw ESNIKeys record
    pub fn parse(record: &[u8]) -> Result<Self, ResolveError> {
        let mut cursor = Cursor::new(record);

        let version = cursor.read_u16()?;
        if version != ESNI_KEYS_VERSION {
            return Err(ResolveError::InvalidEsniKeys(format!(
                "unsupported version: {:#06x}",
                version
            )));
        }

        let checksum = cursor.read_bytes(CHECKSUM_LEN)?.to_vec();
        verify_checksum(record, &checksum)?;

        let mut keys = Vec::new();
        let keys_len = cursor.read_u16()? as usize;
        let keys_end = cursor.pos + keys_len;
        if keys_end > record.len() {
            return Err(ResolveError::InvalidEsniKeys("truncated key shares".into()));
        }
        while cursor.pos < keys_end {
            let group = cursor.read_u16()?;
            let kx_len = cursor.read_u16()? as usize;
            let key_exchange = cursor.read_bytes(kx_len)?.to_vec();
            keys.push(KeyShare { group, key_exchange });
        }
        if keys.is_empty() {
            return Err(ResolveError::InvalidEsniKeys("no key shares".into()));
        }

        let mut cipher_suites = Vec::new();
        let suites_len = cursor.read_u16()? as usize;
        if suites_len % 2 != 0 {
            return Err(ResolveError::InvalidEsniKeys("odd cipher suite length".into()));
        }
        for _ in 0..suites_len / 2 {
            cipher_suites.push(cursor.read_u16()?);
        }

        let padded_length = cursor.read_u16()?;
        let not_before = cursor.read_u64()?;
        let not_after = cursor.read_u64()?;

        // Extensions are not interpreted, but the vector must be intact.
        let ext_len = cursor.read_u16()? as usize;
        cursor.read_bytes(ext_len)?;

        Ok(Self {
            version,
            keys,
            cipher_suites,
            padded_length,
            not_before,
            not_after,
        })
    }

    /// Whether the record is within its validity window at the given unix time
    pub fn valid_at(&self, unix_secs: u64) -> bool {
        unix_secs >= self.not_before && unix_secs <= self.not_after
    }
}

fn verify_checksum(record: &[u8], checksum: &[u8]) -> Result<(), ResolveError> {
    let mut zeroed = record.to_vec();
    zeroed[CHECKSUM_OFFSET..CHECKSUM_OFFSET + CHECKSUM_LEN].fill(0);

    let hash = digest::digest(&digest::SHA256, &zeroed);
    if &hash.as_ref()[..CHECKSUM_LEN] != checksum {
        return Err(ResolveError::InvalidEsniKeys("checksum mismatch".into()));
    }
    Ok(())
}

/// Minimal big-endian cursor over the record bytes
struct Cursor<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    fn read_bytes(&mut self, len: usize) -> Result<&'a [u8], ResolveError> {
        if self.pos + len > self.buf.len() {
            return Err(ResolveError::InvalidEsniKeys("truncated record".into()));
        }
        let out = &self.buf[self.pos..self.pos + len];
        self.pos += len;
        Ok(out)
    }

    fn read_u16(&mut self) -> Result<u16, ResolveError> {
        let b = self.read_bytes(2)?;
        Ok(u16::from_be_bytes([b[0], b[1]]))
    }

    fn read_u64(&mut self) -> Result<u64, ResolveError> {
        let b = self.read_bytes(8)?;
        let mut out = [0u8; 8];
        out.copy_from_slice(b);
        Ok(u64::from_be_bytes(out))
    }
}
