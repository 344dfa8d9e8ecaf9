//! Ferry wire format — the two datagram kinds that share the UDP channel.
//!
//! These layouts ARE the protocol. Every field, every width, every byte of
//! magic is part of the wire format; changing anything here is a breaking
//! change between sender and receiver.
//!
//! All integers are big-endian. There is no handshake and no session state:
//! a DATA packet fully describes one chunk, an ACK names one chunk. Encoding
//! and decoding are pure — no I/O, no allocation beyond the output buffer.

use bytes::{BufMut, Bytes, BytesMut};

/// Largest datagram the protocol will emit. UDP over IPv4 tops out at
/// 65507 payload bytes; a DATA packet must fit in a single datagram.
pub const MAX_DATAGRAM: usize = 65507;

/// Magic prefix distinguishing ACK packets from DATA packets.
pub const ACK_MAGIC: &[u8; 3] = b"ACK";

/// Fixed overhead of a DATA packet around the file id and payload:
/// fid_len(1) + chunk_id(4) + offset(8) + original_size(4) + flag(1)
/// + payload_size(4) + chunk_hash(8).
const DATA_FIXED_OVERHEAD: usize = 30;

// ── DATA packet ───────────────────────────────────────────────────────────────

/// One chunk on the wire.
///
/// Layout:
/// `fid_len:u8 | fid | chunk_id:u32 | offset:u64 | original_size:u32 |
///  compressed_flag:u8 | payload_size:u32 | chunk_hash:[u8;8] | payload`
///
/// `chunk_hash` is the xxh64 digest of the *uncompressed* chunk bytes.
/// `original_size` is the uncompressed length and must match the payload
/// after decompression. `compressed_flag` is 1 only when zlib compression
/// strictly shrank the payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DataPacket {
    pub file_id: String,
    pub chunk_id: u32,
    pub offset: u64,
    pub original_size: u32,
    pub compressed: bool,
    pub chunk_hash: [u8; 8],
    pub payload: Bytes,
}

impl DataPacket {
    pub fn encode(&self) -> Result<Bytes, WireError> {
        let fid = self.file_id.as_bytes();
        if fid.len() > u8::MAX as usize {
            return Err(WireError::FileIdTooLong(fid.len()));
        }
        let total = DATA_FIXED_OVERHEAD + fid.len() + self.payload.len();
        if total > MAX_DATAGRAM {
            return Err(WireError::DatagramTooLarge(total));
        }

        let mut buf = BytesMut::with_capacity(total);
        buf.put_u8(fid.len() as u8);
        buf.put_slice(fid);
        buf.put_u32(self.chunk_id);
        buf.put_u64(self.offset);
        buf.put_u32(self.original_size);
        buf.put_u8(self.compressed as u8);
        buf.put_u32(self.payload.len() as u32);
        buf.put_slice(&self.chunk_hash);
        buf.put_slice(&self.payload);
        Ok(buf.freeze())
    }

    pub fn decode(data: &[u8]) -> Result<Self, WireError> {
        let mut r = Reader::new(data);
        let fid_len = r.u8()? as usize;
        let file_id = r.str(fid_len)?;
        let chunk_id = r.u32()?;
        let offset = r.u64()?;
        let original_size = r.u32()?;
        let compressed = match r.u8()? {
            0 => false,
            1 => true,
            other => return Err(WireError::InvalidFlag(other)),
        };
        let payload_size = r.u32()? as usize;
        let chunk_hash = r.array::<8>()?;
        let payload = r.bytes(payload_size)?;
        r.finish()?;

        Ok(DataPacket {
            file_id,
            chunk_id,
            offset,
            original_size,
            compressed,
            chunk_hash,
            payload,
        })
    }
}

// ── ACK packet ────────────────────────────────────────────────────────────────

/// Acknowledgement of one chunk.
///
/// Layout: `"ACK" | fid_len:u8 | fid | chunk_id:u32`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AckPacket {
    pub file_id: String,
    pub chunk_id: u32,
}

impl AckPacket {
    pub fn encode(&self) -> Result<Bytes, WireError> {
        let fid = self.file_id.as_bytes();
        if fid.len() > u8::MAX as usize {
            return Err(WireError::FileIdTooLong(fid.len()));
        }
        let mut buf = BytesMut::with_capacity(3 + 1 + fid.len() + 4);
        buf.put_slice(ACK_MAGIC);
        buf.put_u8(fid.len() as u8);
        buf.put_slice(fid);
        buf.put_u32(self.chunk_id);
        Ok(buf.freeze())
    }

    pub fn decode(data: &[u8]) -> Result<Self, WireError> {
        let mut r = Reader::new(data);
        let magic = r.array::<3>()?;
        if &magic != ACK_MAGIC {
            return Err(WireError::BadMagic);
        }
        let fid_len = r.u8()? as usize;
        let file_id = r.str(fid_len)?;
        let chunk_id = r.u32()?;
        r.finish()?;
        Ok(AckPacket { file_id, chunk_id })
    }
}

// ── Errors ────────────────────────────────────────────────────────────────────

/// Failures interpreting wire-format data.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum WireError {
    #[error("datagram truncated: needed {needed} more bytes")]
    Truncated { needed: usize },

    #[error("trailing garbage: {0} bytes past end of packet")]
    TrailingBytes(usize),

    #[error("file id is not valid UTF-8")]
    InvalidFileId,

    #[error("file id length {0} exceeds 255")]
    FileIdTooLong(usize),

    #[error("encoded datagram would be {0} bytes, exceeding {MAX_DATAGRAM}")]
    DatagramTooLarge(usize),

    #[error("invalid compressed flag: 0x{0:02x}")]
    InvalidFlag(u8),

    #[error("missing ACK magic")]
    BadMagic,
}

// ── Bounds-checked reader ─────────────────────────────────────────────────────

struct Reader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn new(data: &'a [u8]) -> Self {
        Reader { data, pos: 0 }
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8], WireError> {
        let remaining = self.data.len() - self.pos;
        if remaining < n {
            return Err(WireError::Truncated {
                needed: n - remaining,
            });
        }
        let out = &self.data[self.pos..self.pos + n];
        self.pos += n;
        Ok(out)
    }

    fn u8(&mut self) -> Result<u8, WireError> {
        Ok(self.take(1)?[0])
    }

    fn u32(&mut self) -> Result<u32, WireError> {
        Ok(u32::from_be_bytes(self.take(4)?.try_into().unwrap()))
    }

    fn u64(&mut self) -> Result<u64, WireError> {
        Ok(u64::from_be_bytes(self.take(8)?.try_into().unwrap()))
    }

    fn array<const N: usize>(&mut self) -> Result<[u8; N], WireError> {
        Ok(self.take(N)?.try_into().unwrap())
    }

    fn str(&mut self, n: usize) -> Result<String, WireError> {
        std::str::from_utf8(self.take(n)?)
            .map(str::to_owned)
            .map_err(|_| WireError::InvalidFileId)
    }

    fn bytes(&mut self, n: usize) -> Result<Bytes, WireError> {
        Ok(Bytes::copy_from_slice(self.take(n)?))
    }

    fn finish(&self) -> Result<(), WireError> {
        let left = self.data.len() - self.pos;
        if left > 0 {
            return Err(WireError::TrailingBytes(left));
        }
        Ok(())
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
