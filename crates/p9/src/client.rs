//! Blocking 9P2000.L client.
//!
//! One RPC is in flight at a time; callers serialise on the transport lock.
//! Fids are minted from a monotonic counter and surface as [`ClientFile`]
//! values implementing the [`File`](crate::File) contract.

use std::any::Any;
use std::os::fd::OwnedFd;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU16, AtomicU32, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use tracing::{debug, warn};

use crate::messages::{
    Decoder, Encoder, HEADER_SIZE, NOFID, NONUNAME, NOTAG, RLERROR, TATTACH, TCLUNK, TFSYNC,
    TGETATTR, TLOPEN, TREAD, TREADDIR, TREADLINK, TRENAMEAT, TSETATTR, TUNLINKAT, TVERSION,
    TWALK, TWRITE, TXATTRCREATE, TXATTRWALK, decode_rgetattr, decode_rreaddir, encode_tsetattr,
    split_message,
};
use crate::transport::Transport;
use crate::{
    Attr, AttrMask, Dirent, Error, File, HIGHEST_VERSION, OpenFlags, Qid, Result, SetAttr,
    SetAttrMask,
};

/// Per-RPC framing overhead we reserve out of msize for Tread/Twrite.
const IO_OVERHEAD: u32 = (HEADER_SIZE + 4 + 8 + 4) as u32;

/// `XATTR_REPLACE`, used to express xattr removal as a zero-length replace.
const XATTR_REPLACE: u32 = 0x2;

struct ClientInner {
    /// `None` once the client has been closed; closing the transport drops
    /// the descriptor, which implicitly clunks every outstanding fid.
    transport: Mutex<Option<Box<dyn Transport>>>,
    msize: u32,
    version: String,
    next_fid: AtomicU32,
    next_tag: AtomicU16,
}

impl ClientInner {
    fn allocate_fid(&self) -> u32 {
        // NOFID is never handed out: the counter wraps long before u32::MAX
        // fids are simultaneously live on any plausible mount.
        self.next_fid.fetch_add(1, Ordering::Relaxed)
    }

    fn allocate_tag(&self) -> u16 {
        self.next_tag.fetch_add(1, Ordering::Relaxed) & 0x7fff
    }

    /// Send one request, wait for its reply, unwrap Rlerror.
    fn rpc(&self, msg: Bytes, expect: u8, tag: u16) -> Result<(Vec<u8>, Vec<OwnedFd>)> {
        if msg.len() as u32 > self.msize {
            return Err(Error::MessageTooLarge(msg.len() as u32, self.msize));
        }
        let mut guard = self.transport.lock().expect("transport lock poisoned");
        let transport = guard.as_mut().ok_or(Error::Closed)?;
        transport.send(&msg)?;
        let (reply, fds) = transport.recv()?;
        drop(guard);

        let (header, body) = split_message(&reply)?;
        if header.tag != tag {
            return Err(Error::Protocol(format!(
                "reply tag {} does not match request tag {tag}",
                header.tag
            )));
        }
        if header.type_ == RLERROR {
            let mut d = Decoder::new(body);
            return Err(Error::Remote(d.u32()? as i32));
        }
        if header.type_ != expect {
            return Err(Error::Protocol(format!(
                "expected message type {expect}, got {}",
                header.type_
            )));
        }
        Ok((body.to_vec(), fds))
    }

    /// Clunk a fid, ignoring failures: the fid is forgotten client-side
    /// regardless, and a dead transport clunks everything anyway.
    fn clunk_quietly(&self, fid: u32) {
        let tag = self.allocate_tag();
        let mut enc = Encoder::new(TCLUNK, tag);
        enc.u32(fid);
        if let Err(err) = self.rpc(enc.finish(), TCLUNK + 1, tag) {
            match err {
                Error::Closed => {}
                other => debug!(fid, error = %other, "clunk failed"),
            }
        }
    }
}

/// A connection to a 9P2000.L server.
pub struct Client {
    inner: Arc<ClientInner>,
}

impl Client {
    /// Negotiate the protocol version and maximum message size.
    pub fn new(mut transport: Box<dyn Transport>, msize: u32, version: &str) -> Result<Self> {
        let mut enc = Encoder::new(TVERSION, NOTAG);
        enc.u32(msize).string(version);
        transport.send(&enc.finish())?;
        let (reply, _) = transport.recv()?;
        let (header, body) = split_message(&reply)?;
        if header.type_ != TVERSION + 1 {
            return Err(Error::Protocol(format!(
                "expected Rversion, got message type {}",
                header.type_
            )));
        }
        let mut d = Decoder::new(body);
        let server_msize = d.u32()?;
        let server_version = d.string()?;
        if server_version != HIGHEST_VERSION {
            return Err(Error::UnsupportedVersion(server_version));
        }
        let msize = msize.min(server_msize);
        debug!(msize, version = %server_version, "negotiated session");

        Ok(Self {
            inner: Arc::new(ClientInner {
                transport: Mutex::new(Some(transport)),
                msize,
                version: server_version,
                next_fid: AtomicU32::new(1),
                next_tag: AtomicU16::new(1),
            }),
        })
    }

    pub fn msize(&self) -> u32 {
        self.inner.msize
    }

    pub fn version(&self) -> &str {
        &self.inner.version
    }

    /// Attach to the server-side tree named `aname`, returning the root fid.
    pub fn attach(&self, aname: &str) -> Result<Arc<dyn File>> {
        let fid = self.inner.allocate_fid();
        let tag = self.inner.allocate_tag();
        let mut enc = Encoder::new(TATTACH, tag);
        enc.u32(fid)
            .u32(NOFID)
            .string("")
            .string(aname)
            .u32(NONUNAME);
        self.inner.rpc(enc.finish(), TATTACH + 1, tag)?;
        Ok(Arc::new(ClientFile {
            client: Arc::clone(&self.inner),
            fid,
            closed: AtomicBool::new(false),
        }))
    }

    /// Shut the connection down. All outstanding fids are implicitly clunked
    /// by the server when the stream closes.
    pub fn close(&self) {
        let mut guard = self.inner.transport.lock().expect("transport lock poisoned");
        *guard = None;
    }
}

/// A fid held on the server, produced by [`Client::attach`] or by walking.
pub struct ClientFile {
    client: Arc<ClientInner>,
    fid: u32,
    closed: AtomicBool,
}

impl ClientFile {
    fn rpc(&self, msg: Bytes, expect: u8, tag: u16) -> Result<(Vec<u8>, Vec<OwnedFd>)> {
        self.client.rpc(msg, expect, tag)
    }

    /// Largest read/write payload a single RPC can carry.
    fn io_chunk(&self) -> usize {
        self.client.msize.saturating_sub(IO_OVERHEAD).max(512) as usize
    }
}

impl File for ClientFile {
    fn walk(&self, names: &[&str]) -> Result<(Vec<Qid>, Arc<dyn File>)> {
        let newfid = self.client.allocate_fid();
        let tag = self.client.allocate_tag();
        let mut enc = Encoder::new(TWALK, tag);
        enc.u32(self.fid).u32(newfid).u16(names.len() as u16);
        for name in names {
            enc.string(name);
        }
        let (body, _) = self.rpc(enc.finish(), TWALK + 1, tag)?;
        let mut d = Decoder::new(&body);
        let nwqid = d.u16()? as usize;
        let mut qids = Vec::with_capacity(nwqid);
        for _ in 0..nwqid {
            qids.push(d.qid()?);
        }
        if nwqid < names.len() {
            // Partial walk: newfid was never established on the server.
            return Err(Error::Remote(libc::ENOENT));
        }
        Ok((
            qids,
            Arc::new(ClientFile {
                client: Arc::clone(&self.client),
                fid: newfid,
                closed: AtomicBool::new(false),
            }),
        ))
    }

    fn get_attr(&self, mask: AttrMask) -> Result<(Qid, AttrMask, Attr)> {
        let tag = self.client.allocate_tag();
        let mut enc = Encoder::new(TGETATTR, tag);
        enc.u32(self.fid).u64(mask.bits());
        let (body, _) = self.rpc(enc.finish(), TGETATTR + 1, tag)?;
        let (valid, qid, attr) = decode_rgetattr(&body)?;
        Ok((qid, valid, attr))
    }

    fn set_attr(&self, valid: SetAttrMask, attr: &SetAttr) -> Result<()> {
        let tag = self.client.allocate_tag();
        let mut enc = Encoder::new(TSETATTR, tag);
        encode_tsetattr(&mut enc, self.fid, valid, attr);
        self.rpc(enc.finish(), TSETATTR + 1, tag)?;
        Ok(())
    }

    fn open(&self, flags: OpenFlags) -> Result<(Qid, u32, Option<OwnedFd>)> {
        let tag = self.client.allocate_tag();
        let mut enc = Encoder::new(TLOPEN, tag);
        enc.u32(self.fid).u32(flags.bits());
        let (body, mut fds) = self.rpc(enc.finish(), TLOPEN + 1, tag)?;
        let mut d = Decoder::new(&body);
        let qid = d.qid()?;
        let iounit = d.u32()?;
        if fds.len() > 1 {
            warn!(fid = self.fid, nfds = fds.len(), "server donated multiple FDs; keeping the first");
        }
        let donated = if fds.is_empty() { None } else { Some(fds.remove(0)) };
        Ok((qid, iounit, donated))
    }

    fn read_at(&self, buf: &mut [u8], offset: u64) -> Result<usize> {
        let count = buf.len().min(self.io_chunk()) as u32;
        let tag = self.client.allocate_tag();
        let mut enc = Encoder::new(TREAD, tag);
        enc.u32(self.fid).u64(offset).u32(count);
        let (body, _) = self.rpc(enc.finish(), TREAD + 1, tag)?;
        let mut d = Decoder::new(&body);
        let data = d.data()?;
        if data.len() > buf.len() {
            return Err(Error::Protocol(format!(
                "server returned {} bytes for a {}-byte read",
                data.len(),
                buf.len()
            )));
        }
        buf[..data.len()].copy_from_slice(data);
        Ok(data.len())
    }

    fn write_at(&self, buf: &[u8], offset: u64) -> Result<usize> {
        let chunk = &buf[..buf.len().min(self.io_chunk())];
        let tag = self.client.allocate_tag();
        let mut enc = Encoder::new(TWRITE, tag);
        enc.u32(self.fid)
            .u64(offset)
            .u32(chunk.len() as u32)
            .bytes(chunk);
        let (body, _) = self.rpc(enc.finish(), TWRITE + 1, tag)?;
        let mut d = Decoder::new(&body);
        Ok(d.u32()? as usize)
    }

    fn readdir(&self, offset: u64, count: u32) -> Result<Vec<Dirent>> {
        let count = count.min(self.io_chunk() as u32);
        let tag = self.client.allocate_tag();
        let mut enc = Encoder::new(TREADDIR, tag);
        enc.u32(self.fid).u64(offset).u32(count);
        let (body, _) = self.rpc(enc.finish(), TREADDIR + 1, tag)?;
        decode_rreaddir(&body)
    }

    fn read_link(&self) -> Result<String> {
        let tag = self.client.allocate_tag();
        let mut enc = Encoder::new(TREADLINK, tag);
        enc.u32(self.fid);
        let (body, _) = self.rpc(enc.finish(), TREADLINK + 1, tag)?;
        let mut d = Decoder::new(&body);
        d.string()
    }

    fn unlink_at(&self, name: &str, flags: u32) -> Result<()> {
        let tag = self.client.allocate_tag();
        let mut enc = Encoder::new(TUNLINKAT, tag);
        enc.u32(self.fid).string(name).u32(flags);
        self.rpc(enc.finish(), TUNLINKAT + 1, tag)?;
        Ok(())
    }

    fn rename_at(&self, old_name: &str, new_dir: &Arc<dyn File>, new_name: &str) -> Result<()> {
        let Some(new_dir) = new_dir.as_any().downcast_ref::<ClientFile>() else {
            return Err(Error::Protocol(
                "rename destination belongs to a different client".into(),
            ));
        };
        let tag = self.client.allocate_tag();
        let mut enc = Encoder::new(TRENAMEAT, tag);
        enc.u32(self.fid)
            .string(old_name)
            .u32(new_dir.fid)
            .string(new_name);
        self.rpc(enc.finish(), TRENAMEAT + 1, tag)?;
        Ok(())
    }

    fn fsync(&self) -> Result<()> {
        let tag = self.client.allocate_tag();
        let mut enc = Encoder::new(TFSYNC, tag);
        enc.u32(self.fid);
        self.rpc(enc.finish(), TFSYNC + 1, tag)?;
        Ok(())
    }

    fn list_xattr(&self, size: u64) -> Result<Vec<String>> {
        // An xattrwalk with an empty name yields a fid whose contents are
        // the NUL-separated attribute list.
        let listfid = self.client.allocate_fid();
        let tag = self.client.allocate_tag();
        let mut enc = Encoder::new(TXATTRWALK, tag);
        enc.u32(self.fid).u32(listfid).string("");
        let (body, _) = self.rpc(enc.finish(), TXATTRWALK + 1, tag)?;
        let mut d = Decoder::new(&body);
        let total = d.u64()?;
        let to_read = if size == 0 { total } else { total.min(size) };

        let mut raw = Vec::with_capacity(to_read as usize);
        let mut offset = 0u64;
        while offset < to_read {
            let want = ((to_read - offset) as usize).min(self.io_chunk());
            let mut chunk = vec![0u8; want];
            let tag = self.client.allocate_tag();
            let mut enc = Encoder::new(TREAD, tag);
            enc.u32(listfid).u64(offset).u32(want as u32);
            let res = self.rpc(enc.finish(), TREAD + 1, tag).and_then(|(body, _)| {
                let mut d = Decoder::new(&body);
                let data = d.data()?;
                if data.len() > chunk.len() {
                    return Err(Error::Protocol("oversized read reply".into()));
                }
                chunk[..data.len()].copy_from_slice(data);
                Ok(data.len())
            });
            match res {
                Ok(0) => break,
                Ok(n) => {
                    raw.extend_from_slice(&chunk[..n]);
                    offset += n as u64;
                }
                Err(err) => {
                    self.client.clunk_quietly(listfid);
                    return Err(err);
                }
            }
        }
        self.client.clunk_quietly(listfid);

        Ok(raw
            .split(|b| *b == 0)
            .filter(|s| !s.is_empty())
            .map(|s| String::from_utf8_lossy(s).into_owned())
            .collect())
    }

    fn get_xattr(&self, name: &str, size: u64) -> Result<Vec<u8>> {
        let attrfid = self.client.allocate_fid();
        let tag = self.client.allocate_tag();
        let mut enc = Encoder::new(TXATTRWALK, tag);
        enc.u32(self.fid).u32(attrfid).string(name);
        let (body, _) = self.rpc(enc.finish(), TXATTRWALK + 1, tag)?;
        let mut d = Decoder::new(&body);
        let total = d.u64()?;
        let to_read = if size == 0 { total } else { total.min(size) };

        let mut value = vec![0u8; to_read as usize];
        let mut offset = 0usize;
        while offset < value.len() {
            let tag = self.client.allocate_tag();
            let want = (value.len() - offset).min(self.io_chunk());
            let mut enc = Encoder::new(TREAD, tag);
            enc.u32(attrfid).u64(offset as u64).u32(want as u32);
            let res = self.rpc(enc.finish(), TREAD + 1, tag).and_then(|(body, _)| {
                let mut d = Decoder::new(&body);
                let data = d.data()?;
                if offset + data.len() > value.len() {
                    return Err(Error::Protocol("oversized read reply".into()));
                }
                value[offset..offset + data.len()].copy_from_slice(data);
                Ok(data.len())
            });
            match res {
                Ok(0) => break,
                Ok(n) => offset += n,
                Err(err) => {
                    self.client.clunk_quietly(attrfid);
                    return Err(err);
                }
            }
        }
        value.truncate(offset);
        self.client.clunk_quietly(attrfid);
        Ok(value)
    }

    fn set_xattr(&self, name: &str, value: &[u8], flags: u32) -> Result<()> {
        // xattrcreate turns the cloned fid into a write handle for the
        // attribute value; the clunk commits it.
        let (_, attr_file) = self.walk(&[])?;
        let attr_file = attr_file
            .as_any()
            .downcast_ref::<ClientFile>()
            .expect("walk returns our own file type");

        let tag = self.client.allocate_tag();
        let mut enc = Encoder::new(TXATTRCREATE, tag);
        enc.u32(attr_file.fid)
            .string(name)
            .u64(value.len() as u64)
            .u32(flags);
        if let Err(err) = self.rpc(enc.finish(), TXATTRCREATE + 1, tag) {
            attr_file.close();
            return Err(err);
        }

        let mut offset = 0usize;
        while offset < value.len() {
            match attr_file.write_at(&value[offset..], offset as u64) {
                Ok(0) => {
                    attr_file.close();
                    return Err(Error::Protocol("server accepted a zero-byte write".into()));
                }
                Ok(n) => offset += n,
                Err(err) => {
                    attr_file.close();
                    return Err(err);
                }
            }
        }
        attr_file.close();
        Ok(())
    }

    fn remove_xattr(&self, name: &str) -> Result<()> {
        // Removal is expressed as a zero-length XATTR_REPLACE create.
        self.set_xattr(name, &[], XATTR_REPLACE)
    }

    fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.client.clunk_quietly(self.fid);
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

impl Drop for ClientFile {
    fn drop(&mut self) {
        self.close();
    }
}
