//! Byte-stream transports.
//!
//! A [`Transport`] carries whole framed messages in both directions and
//! surfaces any file descriptors the server donates alongside a reply.
//! The production transport is [`FdTransport`], wrapping a descriptor
//! inherited from the sandbox runner (usually one end of a unix socketpair,
//! over which SCM_RIGHTS donation works; a pipe-like descriptor still
//! carries messages, just never descriptors).

use std::io;
use std::io::IoSliceMut;
use std::net::SocketAddr;
use std::os::fd::{AsFd, AsRawFd, BorrowedFd, FromRawFd, OwnedFd, RawFd};

use nix::sys::socket::{ControlMessageOwned, MsgFlags, recvmsg};
use tracing::trace;

/// Hard ceiling on a single frame, independent of the negotiated msize.
/// Anything larger is treated as stream corruption.
const MAX_FRAME: u32 = 64 << 20;

/// A duplex message stream between client and server.
pub trait Transport: Send {
    /// Write one complete framed message.
    fn send(&mut self, msg: &[u8]) -> io::Result<()>;

    /// Read one complete framed message, plus any descriptors donated with
    /// it.
    fn recv(&mut self) -> io::Result<(Vec<u8>, Vec<OwnedFd>)>;
}

/// Transport over an inherited file descriptor.
pub struct FdTransport {
    fd: OwnedFd,
    /// Whether `fd` is a socket, and so can carry SCM_RIGHTS.
    is_socket: bool,
}

impl FdTransport {
    pub fn new(fd: OwnedFd) -> Self {
        let is_socket = fd_is_socket(fd.as_raw_fd());
        Self { fd, is_socket }
    }

    /// Wrap a raw descriptor number handed over by the runner (the `rfdno`
    /// mount option).
    ///
    /// # Safety
    ///
    /// `raw` must be an open descriptor owned by the caller and not used
    /// elsewhere after this call.
    pub unsafe fn from_raw(raw: RawFd) -> Self {
        Self::new(unsafe { OwnedFd::from_raw_fd(raw) })
    }

    /// Read up to `buf.len()` bytes, harvesting donated descriptors when the
    /// underlying descriptor is a socket.
    fn recv_chunk(&mut self, buf: &mut [u8], fds: &mut Vec<OwnedFd>) -> io::Result<usize> {
        if !self.is_socket {
            let n = unsafe {
                libc::read(self.fd.as_raw_fd(), buf.as_mut_ptr().cast(), buf.len())
            };
            if n < 0 {
                return Err(io::Error::last_os_error());
            }
            return Ok(n as usize);
        }

        let mut cmsg_buf = nix::cmsg_space!([RawFd; 8]);
        let mut iov = [IoSliceMut::new(buf)];
        let msg = recvmsg::<()>(
            self.fd.as_raw_fd(),
            &mut iov,
            Some(&mut cmsg_buf),
            MsgFlags::empty(),
        )
        .map_err(io::Error::from)?;
        let n = msg.bytes;
        for cmsg in msg.cmsgs().map_err(io::Error::from)? {
            if let ControlMessageOwned::ScmRights(raw_fds) = cmsg {
                for raw in raw_fds {
                    fds.push(unsafe { OwnedFd::from_raw_fd(raw) });
                }
            }
        }
        Ok(n)
    }

    fn recv_exact(&mut self, buf: &mut [u8], fds: &mut Vec<OwnedFd>) -> io::Result<()> {
        let mut filled = 0;
        while filled < buf.len() {
            let n = self.recv_chunk(&mut buf[filled..], fds)?;
            if n == 0 {
                return Err(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    "server closed the connection",
                ));
            }
            filled += n;
        }
        Ok(())
    }
}

impl Transport for FdTransport {
    fn send(&mut self, msg: &[u8]) -> io::Result<()> {
        let mut sent = 0;
        while sent < msg.len() {
            let n = unsafe {
                libc::write(
                    self.fd.as_raw_fd(),
                    msg[sent..].as_ptr().cast(),
                    msg.len() - sent,
                )
            };
            if n < 0 {
                let err = io::Error::last_os_error();
                if err.kind() == io::ErrorKind::Interrupted {
                    continue;
                }
                return Err(err);
            }
            sent += n as usize;
        }
        Ok(())
    }

    fn recv(&mut self) -> io::Result<(Vec<u8>, Vec<OwnedFd>)> {
        let mut fds = Vec::new();
        let mut size_bytes = [0u8; 4];
        self.recv_exact(&mut size_bytes, &mut fds)?;
        let size = u32::from_le_bytes(size_bytes);
        if size < 7 || size > MAX_FRAME {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("implausible frame size {size}"),
            ));
        }
        let mut msg = vec![0u8; size as usize];
        msg[0..4].copy_from_slice(&size_bytes);
        self.recv_exact(&mut msg[4..], &mut fds)?;
        trace!(size, nfds = fds.len(), "received frame");
        Ok((msg, fds))
    }
}

fn fd_is_socket(fd: RawFd) -> bool {
    let mut st: libc::stat = unsafe { std::mem::zeroed() };
    if unsafe { libc::fstat(fd, &mut st) } != 0 {
        return false;
    }
    (st.st_mode & libc::S_IFMT) == libc::S_IFSOCK
}

/// A thin TCP socket wrapper used when validating stream descriptors handed
/// to the client. It intentionally mirrors kernel semantics rather than
/// papering over them: a `recv` on a socket that was never connected fails
/// with ENOTCONN, for any buffer size.
pub struct TcpSocket {
    fd: OwnedFd,
}

impl TcpSocket {
    /// Create an unbound, unconnected IPv4 TCP socket.
    pub fn new_v4() -> io::Result<Self> {
        Self::new(libc::AF_INET)
    }

    /// Create an unbound, unconnected IPv6 TCP socket.
    pub fn new_v6() -> io::Result<Self> {
        Self::new(libc::AF_INET6)
    }

    fn new(domain: libc::c_int) -> io::Result<Self> {
        let raw = unsafe {
            libc::socket(
                domain,
                libc::SOCK_STREAM | libc::SOCK_CLOEXEC,
                libc::IPPROTO_TCP,
            )
        };
        if raw < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(Self {
            fd: unsafe { OwnedFd::from_raw_fd(raw) },
        })
    }

    pub fn connect(&self, addr: &SocketAddr) -> io::Result<()> {
        let res = match addr {
            SocketAddr::V4(v4) => {
                let sin = libc::sockaddr_in {
                    sin_family: libc::AF_INET as libc::sa_family_t,
                    sin_port: v4.port().to_be(),
                    sin_addr: libc::in_addr {
                        s_addr: u32::from_ne_bytes(v4.ip().octets()),
                    },
                    sin_zero: [0; 8],
                };
                unsafe {
                    libc::connect(
                        self.fd.as_raw_fd(),
                        (&sin as *const libc::sockaddr_in).cast(),
                        std::mem::size_of::<libc::sockaddr_in>() as libc::socklen_t,
                    )
                }
            }
            SocketAddr::V6(v6) => {
                let mut sin6: libc::sockaddr_in6 = unsafe { std::mem::zeroed() };
                sin6.sin6_family = libc::AF_INET6 as libc::sa_family_t;
                sin6.sin6_port = v6.port().to_be();
                sin6.sin6_addr.s6_addr = v6.ip().octets();
                unsafe {
                    libc::connect(
                        self.fd.as_raw_fd(),
                        (&sin6 as *const libc::sockaddr_in6).cast(),
                        std::mem::size_of::<libc::sockaddr_in6>() as libc::socklen_t,
                    )
                }
            }
        };
        if res != 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }

    pub fn recv(&self, buf: &mut [u8]) -> io::Result<usize> {
        let n = unsafe {
            libc::recv(self.fd.as_raw_fd(), buf.as_mut_ptr().cast(), buf.len(), 0)
        };
        if n < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(n as usize)
    }

    pub fn into_fd(self) -> OwnedFd {
        self.fd
    }
}

impl AsFd for TcpSocket {
    fn as_fd(&self) -> BorrowedFd<'_> {
        self.fd.as_fd()
    }
}
