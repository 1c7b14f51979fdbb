//! 9P2000.L wire codec.
//!
//! Every message is `size[4] type[1] tag[2]` followed by a type-specific
//! body, all little-endian. Strings are `len[2]` + UTF-8 bytes; qids are
//! `type[1] version[4] path[8]`. This module only implements the messages
//! this client issues.

use bytes::{Bytes, BytesMut};

use crate::{Attr, AttrMask, Dirent, Error, Qid, Result, SetAttr, SetAttrMask};

/// Fixed header length: size[4] + type[1] + tag[2].
pub const HEADER_SIZE: usize = 7;

/// The reserved "no fid" value.
pub const NOFID: u32 = u32::MAX;

/// The reserved tag used by Tversion.
pub const NOTAG: u16 = u16::MAX;

/// `n_uname` value meaning "uname carries no numeric identity".
pub const NONUNAME: u32 = u32::MAX;

// Message type codes. R-types are always T + 1.
pub const RLERROR: u8 = 7;
pub const TLOPEN: u8 = 12;
pub const TREADLINK: u8 = 22;
pub const TGETATTR: u8 = 24;
pub const TSETATTR: u8 = 26;
pub const TXATTRWALK: u8 = 30;
pub const TXATTRCREATE: u8 = 32;
pub const TREADDIR: u8 = 40;
pub const TFSYNC: u8 = 50;
pub const TRENAMEAT: u8 = 74;
pub const TUNLINKAT: u8 = 76;
pub const TVERSION: u8 = 100;
pub const TATTACH: u8 = 104;
pub const TWALK: u8 = 110;
pub const TREAD: u8 = 116;
pub const TWRITE: u8 = 118;
pub const TCLUNK: u8 = 120;

/// Builds one outgoing message, patching the size field on completion.
pub struct Encoder {
    buf: BytesMut,
}

impl Encoder {
    pub fn new(type_: u8, tag: u16) -> Self {
        let mut buf = BytesMut::with_capacity(64);
        buf.extend_from_slice(&[0; 4]); // size, patched by finish()
        buf.extend_from_slice(&[type_]);
        buf.extend_from_slice(&tag.to_le_bytes());
        Self { buf }
    }

    pub fn u8(&mut self, v: u8) -> &mut Self {
        self.buf.extend_from_slice(&[v]);
        self
    }

    pub fn u16(&mut self, v: u16) -> &mut Self {
        self.buf.extend_from_slice(&v.to_le_bytes());
        self
    }

    pub fn u32(&mut self, v: u32) -> &mut Self {
        self.buf.extend_from_slice(&v.to_le_bytes());
        self
    }

    pub fn u64(&mut self, v: u64) -> &mut Self {
        self.buf.extend_from_slice(&v.to_le_bytes());
        self
    }

    pub fn string(&mut self, s: &str) -> &mut Self {
        debug_assert!(s.len() <= u16::MAX as usize, "string too long for wire");
        self.u16(s.len() as u16);
        self.buf.extend_from_slice(s.as_bytes());
        self
    }

    pub fn bytes(&mut self, b: &[u8]) -> &mut Self {
        self.buf.extend_from_slice(b);
        self
    }

    pub fn set_attr(&mut self, attr: &SetAttr) -> &mut Self {
        self.u32(attr.mode)
            .u32(attr.uid)
            .u32(attr.gid)
            .u64(attr.size)
            .u64(attr.atime_sec)
            .u64(attr.atime_nsec)
            .u64(attr.mtime_sec)
            .u64(attr.mtime_nsec)
    }

    pub fn finish(mut self) -> Bytes {
        let size = self.buf.len() as u32;
        self.buf[0..4].copy_from_slice(&size.to_le_bytes());
        self.buf.freeze()
    }
}

/// Reads one incoming message body.
pub struct Decoder<'a> {
    buf: &'a [u8],
}

impl<'a> Decoder<'a> {
    pub fn new(body: &'a [u8]) -> Self {
        Self { buf: body }
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8]> {
        if self.buf.len() < n {
            return Err(Error::Protocol(format!(
                "message truncated: wanted {n} bytes, have {}",
                self.buf.len()
            )));
        }
        let (head, tail) = self.buf.split_at(n);
        self.buf = tail;
        Ok(head)
    }

    pub fn u8(&mut self) -> Result<u8> {
        Ok(self.take(1)?[0])
    }

    pub fn u16(&mut self) -> Result<u16> {
        let b = self.take(2)?;
        Ok(u16::from_le_bytes([b[0], b[1]]))
    }

    pub fn u32(&mut self) -> Result<u32> {
        let b = self.take(4)?;
        Ok(u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }

    pub fn u64(&mut self) -> Result<u64> {
        let b = self.take(8)?;
        let mut raw = [0u8; 8];
        raw.copy_from_slice(b);
        Ok(u64::from_le_bytes(raw))
    }

    pub fn string(&mut self) -> Result<String> {
        let len = self.u16()? as usize;
        let raw = self.take(len)?;
        String::from_utf8(raw.to_vec())
            .map_err(|_| Error::Protocol("string is not valid UTF-8".into()))
    }

    pub fn qid(&mut self) -> Result<Qid> {
        Ok(Qid {
            type_: self.u8()?,
            version: self.u32()?,
            path: self.u64()?,
        })
    }

    pub fn data(&mut self) -> Result<&'a [u8]> {
        let len = self.u32()? as usize;
        self.take(len)
    }

    pub fn attr(&mut self) -> Result<Attr> {
        Ok(Attr {
            mode: self.u32()?,
            uid: self.u32()?,
            gid: self.u32()?,
            nlink: self.u64()?,
            rdev: self.u64()?,
            size: self.u64()?,
            blksize: self.u64()?,
            blocks: self.u64()?,
            atime_sec: self.u64()?,
            atime_nsec: self.u64()?,
            mtime_sec: self.u64()?,
            mtime_nsec: self.u64()?,
            ctime_sec: self.u64()?,
            ctime_nsec: self.u64()?,
            btime_sec: self.u64()?,
            btime_nsec: self.u64()?,
            r#gen: self.u64()?,
            data_version: self.u64()?,
        })
    }

    pub fn remaining(&self) -> usize {
        self.buf.len()
    }
}

/// A parsed message header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Header {
    pub size: u32,
    pub type_: u8,
    pub tag: u16,
}

/// Split a complete framed message into its header and body.
pub fn split_message(msg: &[u8]) -> Result<(Header, &[u8])> {
    if msg.len() < HEADER_SIZE {
        return Err(Error::Protocol(format!(
            "frame of {} bytes is shorter than a 9P header",
            msg.len()
        )));
    }
    let size = u32::from_le_bytes([msg[0], msg[1], msg[2], msg[3]]);
    if size as usize != msg.len() {
        return Err(Error::Protocol(format!(
            "frame length {} disagrees with size field {size}",
            msg.len()
        )));
    }
    let header = Header {
        size,
        type_: msg[4],
        tag: u16::from_le_bytes([msg[5], msg[6]]),
    };
    Ok((header, &msg[HEADER_SIZE..]))
}

/// Decode an Rgetattr body into `(valid, qid, attr)`.
pub fn decode_rgetattr(body: &[u8]) -> Result<(AttrMask, Qid, Attr)> {
    let mut d = Decoder::new(body);
    let valid = AttrMask::from_bits_truncate(d.u64()?);
    let qid = d.qid()?;
    let attr = d.attr()?;
    Ok((valid, qid, attr))
}

/// Encode a Tsetattr body onto `enc`.
pub fn encode_tsetattr(enc: &mut Encoder, fid: u32, valid: SetAttrMask, attr: &SetAttr) {
    enc.u32(fid).u32(valid.bits()).set_attr(attr);
}

/// Decode an Rreaddir body into dirents.
pub fn decode_rreaddir(body: &[u8]) -> Result<Vec<Dirent>> {
    let mut d = Decoder::new(body);
    let data = d.data()?;
    let mut entries = Vec::new();
    let mut d = Decoder::new(data);
    while d.remaining() > 0 {
        entries.push(Dirent {
            qid: d.qid()?,
            offset: d.u64()?,
            type_: d.u8()?,
            name: d.string()?,
        });
    }
    Ok(entries)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trip_header_and_scalars() {
        let mut enc = Encoder::new(TWALK, 9);
        enc.u32(1).u32(2).u16(1).string("etc");
        let msg = enc.finish();

        let (header, body) = split_message(&msg).expect("frame should parse");
        assert_eq!(header.type_, TWALK);
        assert_eq!(header.tag, 9);
        assert_eq!(header.size as usize, msg.len());

        let mut d = Decoder::new(body);
        assert_eq!(d.u32().unwrap(), 1);
        assert_eq!(d.u32().unwrap(), 2);
        assert_eq!(d.u16().unwrap(), 1);
        assert_eq!(d.string().unwrap(), "etc");
        assert_eq!(d.remaining(), 0, "nothing should trail the last field");
    }

    #[test]
    fn truncated_body_is_a_protocol_error() {
        let mut d = Decoder::new(&[0x01, 0x02]);
        assert!(d.u32().is_err(), "2 bytes cannot yield a u32");
    }

    #[test]
    fn size_field_must_match_frame_length() {
        let mut enc = Encoder::new(TCLUNK, 1);
        enc.u32(7);
        let mut msg = enc.finish().to_vec();
        msg[0] = 3; // lie about the size
        assert!(split_message(&msg).is_err());
    }

    #[test]
    fn rreaddir_decodes_entries_in_order() {
        // Hand-build a two-entry Rreaddir payload.
        let mut enc = Encoder::new(TREADDIR + 1, 0);
        let mut inner = BytesMut::new();
        for (i, name) in ["alpha", "beta"].iter().enumerate() {
            inner.extend_from_slice(&[0x00]); // qid type
            inner.extend_from_slice(&1u32.to_le_bytes()); // qid version
            inner.extend_from_slice(&(10 + i as u64).to_le_bytes()); // qid path
            inner.extend_from_slice(&((i + 1) as u64).to_le_bytes()); // offset
            inner.extend_from_slice(&[4]); // DT_DIR-ish type byte
            inner.extend_from_slice(&(name.len() as u16).to_le_bytes());
            inner.extend_from_slice(name.as_bytes());
        }
        enc.u32(inner.len() as u32).bytes(&inner);
        let msg = enc.finish();
        let (_, body) = split_message(&msg).unwrap();

        let entries = decode_rreaddir(body).expect("well-formed payload");
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].name, "alpha");
        assert_eq!(entries[0].qid.path, 10);
        assert_eq!(entries[1].name, "beta");
        assert_eq!(entries[1].offset, 2);
    }
}
