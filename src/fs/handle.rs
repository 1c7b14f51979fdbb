//! An open handle on a remote file: the opened fid plus, when the server
//! donated one, a host descriptor for direct I/O.

use std::io;
use std::os::fd::{AsFd, AsRawFd, OwnedFd, RawFd};
use std::sync::Arc;

use crate::context::{Context, UninterruptibleSleep};
use crate::error::{FsError, Result};

/// An opened remote file. Empty handles (`file == None`) stand in for
/// "no handle yet" on dentries that have never been opened.
#[derive(Default)]
pub struct Handle {
    file: Option<Arc<dyn p9::File>>,
    fd: Option<OwnedFd>,
}

impl Handle {
    pub fn empty() -> Self {
        Self::default()
    }

    /// Open a fresh fid cloned from `base` with the requested capabilities.
    /// Collects the host descriptor if the server passed one.
    pub fn open(
        ctx: &dyn Context,
        base: &Arc<dyn p9::File>,
        read: bool,
        write: bool,
        trunc: bool,
    ) -> Result<Self> {
        let _sleep = UninterruptibleSleep::enter(ctx);
        let (_, file) = base.walk(&[])?;
        match file.open(p9::OpenFlags::from_rw(read, write, trunc)) {
            Ok((_, _, fd)) => Ok(Self {
                file: Some(file),
                fd,
            }),
            Err(err) => {
                file.close();
                Err(err.into())
            }
        }
    }

    pub fn is_open(&self) -> bool {
        self.file.is_some()
    }

    pub fn file(&self) -> Option<&Arc<dyn p9::File>> {
        self.file.as_ref()
    }

    pub fn host_fd(&self) -> Option<RawFd> {
        self.fd.as_ref().map(AsRawFd::as_raw_fd)
    }

    pub(crate) fn take_fd(&mut self) -> Option<OwnedFd> {
        self.fd.take()
    }

    pub(crate) fn set_fd(&mut self, fd: OwnedFd) {
        self.fd = Some(fd);
    }

    /// Read at `offset`, preferring the host descriptor. Returns the bytes
    /// read by a single operation; callers loop for full reads.
    pub fn read_at(&self, ctx: &dyn Context, buf: &mut [u8], offset: u64) -> Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        if let Some(fd) = &self.fd {
            return Ok(nix::sys::uio::pread(fd.as_fd(), buf, offset as i64)
                .map_err(io::Error::from)?);
        }
        let file = self.file.as_ref().ok_or(FsError::Invalid)?;
        let _sleep = UninterruptibleSleep::enter(ctx);
        Ok(file.read_at(buf, offset)?)
    }

    /// Write at `offset`, preferring the host descriptor.
    pub fn write_at(&self, ctx: &dyn Context, buf: &[u8], offset: u64) -> Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        if let Some(fd) = &self.fd {
            return Ok(nix::sys::uio::pwrite(fd.as_fd(), buf, offset as i64)
                .map_err(io::Error::from)?);
        }
        let file = self.file.as_ref().ok_or(FsError::Invalid)?;
        let _sleep = UninterruptibleSleep::enter(ctx);
        Ok(file.write_at(buf, offset)?)
    }

    /// Read until `buf` is full or the file ends. Returns the filled length.
    pub fn read_full_at(&self, ctx: &dyn Context, buf: &mut [u8], offset: u64) -> Result<usize> {
        let mut done = 0;
        while done < buf.len() {
            let n = self.read_at(ctx, &mut buf[done..], offset + done as u64)?;
            if n == 0 {
                break;
            }
            done += n;
        }
        Ok(done)
    }

    /// Write all of `buf`, failing if the server stops making progress.
    pub fn write_all_at(&self, ctx: &dyn Context, buf: &[u8], offset: u64) -> Result<()> {
        let mut done = 0;
        while done < buf.len() {
            let n = self.write_at(ctx, &buf[done..], offset + done as u64)?;
            if n == 0 {
                return Err(FsError::Io(io::Error::new(
                    io::ErrorKind::WriteZero,
                    "server accepted no bytes",
                )));
            }
            done += n;
        }
        Ok(())
    }

    pub fn fsync(&self, ctx: &dyn Context) -> Result<()> {
        if let Some(file) = &self.file {
            let _sleep = UninterruptibleSleep::enter(ctx);
            file.fsync()?;
        }
        Ok(())
    }

    /// Clunk the fid and close the host descriptor.
    pub fn close(&mut self, ctx: &dyn Context) {
        if let Some(file) = self.file.take() {
            let _sleep = UninterruptibleSleep::enter(ctx);
            file.close();
        }
        self.fd = None;
    }

    /// Clunk only the server-side fid, leaving the host descriptor in place.
    /// Used by the upgrade protocol after the descriptor has been moved onto
    /// the new handle.
    pub(crate) fn clunk(&mut self, ctx: &dyn Context) {
        if let Some(file) = self.file.take() {
            let _sleep = UninterruptibleSleep::enter(ctx);
            file.close();
        }
    }
}

/// Atomically repoint descriptor number `old` at the file description behind
/// `new`, close-on-exec. Pre-existing users of `old` observe the new
/// description without reopening.
pub(crate) fn dup3_cloexec(new: RawFd, old: RawFd) -> io::Result<()> {
    if unsafe { libc::dup3(new, old, libc::O_CLOEXEC) } < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}
