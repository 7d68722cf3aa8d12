//! Wire codec for gossip messages.
//!
//! Everything is big-endian. Strings and payloads are a `u32` byte length
//! followed by the raw bytes; UUIDs are 16 raw bytes; lists are a `u32`
//! element count followed by the elements; TTLs and the protocol version are
//! `u64`. Decoders ignore trailing bytes after the last field so older nodes
//! can read frames from newer ones.

use crate::types::{Address, DataItem, FetchReq, KeyAd, Message, NodeAd, NodeAddress};
use bytes::BufMut;
use thiserror::Error;
use uuid::Uuid;

/// Refused before allocation; no sane frame carries this many elements.
const MAX_LIST_LEN: u32 = 1 << 20;

/// Decoding errors.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum WireError {
    #[error("unknown message tag: {0}")]
    UnknownTag(u8),
    #[error("truncated frame")]
    Truncated,
    #[error("list count {0} exceeds limit")]
    Oversize(u32),
    #[error("invalid utf-8 in string field")]
    BadUtf8,
}

impl Message {
    /// Encode the message body. The tag travels in the frame header.
    pub fn encode_body(&self) -> Vec<u8> {
        let mut buf = Vec::new();
        match self {
            Message::Init {
                version,
                id,
                node,
                ttl_ms,
            } => {
                buf.put_u64(*version);
                put_uuid(&mut buf, id);
                put_addrs(&mut buf, node);
                buf.put_u64(*ttl_ms);
            }
            Message::Keys(ads) => {
                buf.put_u32(ads.len() as u32);
                for ad in ads {
                    put_string(&mut buf, &ad.key);
                    put_uuid(&mut buf, &ad.key_id);
                    put_addrs(&mut buf, &ad.addrs);
                    buf.put_u64(ad.ttl_ms);
                }
            }
            Message::Query(keys) => {
                buf.put_u32(keys.len() as u32);
                for key in keys {
                    put_string(&mut buf, key);
                }
            }
            Message::Nodes(ads) => {
                buf.put_u32(ads.len() as u32);
                for ad in ads {
                    put_uuid(&mut buf, &ad.id);
                    put_addrs(&mut buf, &ad.addrs);
                    buf.put_u64(ad.ttl_ms);
                }
            }
            Message::Fetch(reqs) => {
                buf.put_u32(reqs.len() as u32);
                for req in reqs {
                    put_string(&mut buf, &req.key);
                    put_uuid(&mut buf, &req.key_id);
                }
            }
            Message::Data(items) => {
                buf.put_u32(items.len() as u32);
                for item in items {
                    put_string(&mut buf, &item.key);
                    put_uuid(&mut buf, &item.key_id);
                    put_bytes(&mut buf, &item.payload);
                }
            }
        }
        buf
    }

    /// Decode a message body for the given tag.
    pub fn decode(tag: u8, body: &[u8]) -> Result<Message, WireError> {
        let mut cur = Cursor { rest: body };
        match tag {
            Message::TAG_INIT => {
                let version = cur.u64()?;
                let id = cur.uuid()?;
                let node = cur.addrs()?;
                let ttl_ms = cur.u64()?;
                Ok(Message::Init {
                    version,
                    id,
                    node,
                    ttl_ms,
                })
            }
            Message::TAG_KEYS => {
                let count = cur.count()?;
                let mut ads = Vec::with_capacity(count);
                for _ in 0..count {
                    ads.push(KeyAd {
                        key: cur.string()?,
                        key_id: cur.uuid()?,
                        addrs: cur.addrs()?,
                        ttl_ms: cur.u64()?,
                    });
                }
                Ok(Message::Keys(ads))
            }
            Message::TAG_QUERY => {
                let count = cur.count()?;
                let mut keys = Vec::with_capacity(count);
                for _ in 0..count {
                    keys.push(cur.string()?);
                }
                Ok(Message::Query(keys))
            }
            Message::TAG_NODES => {
                let count = cur.count()?;
                let mut ads = Vec::with_capacity(count);
                for _ in 0..count {
                    ads.push(NodeAd {
                        id: cur.uuid()?,
                        addrs: cur.addrs()?,
                        ttl_ms: cur.u64()?,
                    });
                }
                Ok(Message::Nodes(ads))
            }
            Message::TAG_FETCH => {
                let count = cur.count()?;
                let mut reqs = Vec::with_capacity(count);
                for _ in 0..count {
                    reqs.push(FetchReq {
                        key: cur.string()?,
                        key_id: cur.uuid()?,
                    });
                }
                Ok(Message::Fetch(reqs))
            }
            Message::TAG_DATA => {
                let count = cur.count()?;
                let mut items = Vec::with_capacity(count);
                for _ in 0..count {
                    items.push(DataItem {
                        key: cur.string()?,
                        key_id: cur.uuid()?,
                        payload: cur.bytes()?,
                    });
                }
                Ok(Message::Data(items))
            }
            other => Err(WireError::UnknownTag(other)),
        }
    }
}

fn put_string(buf: &mut Vec<u8>, s: &str) {
    buf.put_u32(s.len() as u32);
    buf.put_slice(s.as_bytes());
}

fn put_bytes(buf: &mut Vec<u8>, b: &[u8]) {
    buf.put_u32(b.len() as u32);
    buf.put_slice(b);
}

fn put_uuid(buf: &mut Vec<u8>, id: &Uuid) {
    buf.put_slice(id.as_bytes());
}

fn put_addrs(buf: &mut Vec<u8>, addrs: &NodeAddress) {
    buf.put_u32(addrs.0.len() as u32);
    for addr in addrs.iter() {
        put_string(buf, &addr.host);
        buf.put_u16(addr.port);
    }
}

/// Checked reader over a message body.
struct Cursor<'a> {
    rest: &'a [u8],
}

impl<'a> Cursor<'a> {
    fn take(&mut self, n: usize) -> Result<&'a [u8], WireError> {
        if self.rest.len() < n {
            return Err(WireError::Truncated);
        }
        let (head, tail) = self.rest.split_at(n);
        self.rest = tail;
        Ok(head)
    }

    fn u16(&mut self) -> Result<u16, WireError> {
        let b = self.take(2)?;
        Ok(u16::from_be_bytes([b[0], b[1]]))
    }

    fn u32(&mut self) -> Result<u32, WireError> {
        let b = self.take(4)?;
        Ok(u32::from_be_bytes([b[0], b[1], b[2], b[3]]))
    }

    fn u64(&mut self) -> Result<u64, WireError> {
        let b = self.take(8)?;
        let mut raw = [0u8; 8];
        raw.copy_from_slice(b);
        Ok(u64::from_be_bytes(raw))
    }

    fn count(&mut self) -> Result<usize, WireError> {
        let n = self.u32()?;
        if n > MAX_LIST_LEN {
            return Err(WireError::Oversize(n));
        }
        Ok(n as usize)
    }

    fn uuid(&mut self) -> Result<Uuid, WireError> {
        let b = self.take(16)?;
        let mut raw = [0u8; 16];
        raw.copy_from_slice(b);
        Ok(Uuid::from_bytes(raw))
    }

    fn string(&mut self) -> Result<String, WireError> {
        let len = self.count()?;
        let b = self.take(len)?;
        String::from_utf8(b.to_vec()).map_err(|_| WireError::BadUtf8)
    }

    fn bytes(&mut self) -> Result<Vec<u8>, WireError> {
        let len = self.count()?;
        Ok(self.take(len)?.to_vec())
    }

    fn addrs(&mut self) -> Result<NodeAddress, WireError> {
        let count = self.count()?;
        let mut addrs = Vec::with_capacity(count);
        for _ in 0..count {
            let host = self.string()?;
            let port = self.u16()?;
            addrs.push(Address { host, port });
        }
        Ok(NodeAddress(addrs))
    }
}
