use std::io;
use std::mem;
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr, SocketAddrV4, SocketAddrV6};
use std::os::unix::io::{AsRawFd, RawFd};

use libc::{c_int, c_void, sa_family_t, socklen_t, SOCK_CLOEXEC, SOCK_NONBLOCK, SOCK_STREAM};

use super::{syscall, Fd};

pub fn setsockopt<T>(sock: &TcpSock, level: c_int, opt: c_int, payload: T) -> io::Result<()> {
    let payload = &payload as *const T as *const c_void;
    syscall!(setsockopt(
        sock.as_raw_fd(),
        level,
        opt,
        payload,
        mem::size_of::<T>() as socklen_t
    ))?;
    Ok(())
}

pub fn getsockopt<T: Copy>(sock: &TcpSock, level: c_int, opt: c_int) -> io::Result<T> {
    let mut slot: T = unsafe { mem::zeroed() };
    let mut len = mem::size_of::<T>() as socklen_t;
    syscall!(getsockopt(
        sock.as_raw_fd(),
        level,
        opt,
        &mut slot as *mut _ as *mut _,
        &mut len
    ))?;
    debug_assert_eq!(len as usize, mem::size_of::<T>());
    Ok(slot)
}

fn addr_to_storage(addr: &SocketAddr) -> (libc::sockaddr_storage, socklen_t) {
    let mut storage: libc::sockaddr_storage = unsafe { mem::zeroed() };

    let len = match addr {
        SocketAddr::V4(a) => {
            let sin = libc::sockaddr_in {
                sin_family: libc::AF_INET as sa_family_t,
                sin_port: a.port().to_be(),
                sin_addr: libc::in_addr {
                    s_addr: u32::from_ne_bytes(a.ip().octets()),
                },
                sin_zero: [0; 8],
            };
            unsafe {
                *(&mut storage as *mut _ as *mut libc::sockaddr_in) = sin;
            }
            mem::size_of::<libc::sockaddr_in>()
        }
        SocketAddr::V6(a) => {
            let sin6 = libc::sockaddr_in6 {
                sin6_family: libc::AF_INET6 as sa_family_t,
                sin6_port: a.port().to_be(),
                sin6_flowinfo: a.flowinfo(),
                sin6_addr: libc::in6_addr {
                    s6_addr: a.ip().octets(),
                },
                sin6_scope_id: a.scope_id(),
            };
            unsafe {
                *(&mut storage as *mut _ as *mut libc::sockaddr_in6) = sin6;
            }
            mem::size_of::<libc::sockaddr_in6>()
        }
    };

    (storage, len as socklen_t)
}

pub fn storage_to_addr(storage: &libc::sockaddr_storage) -> io::Result<SocketAddr> {
    match storage.ss_family as c_int {
        libc::AF_INET => {
            let sin = unsafe { *(storage as *const _ as *const libc::sockaddr_in) };
            let ip = Ipv4Addr::from(sin.sin_addr.s_addr.to_ne_bytes());
            Ok(SocketAddr::V4(SocketAddrV4::new(
                ip,
                u16::from_be(sin.sin_port),
            )))
        }
        libc::AF_INET6 => {
            let sin6 = unsafe { *(storage as *const _ as *const libc::sockaddr_in6) };
            let ip = Ipv6Addr::from(sin6.sin6_addr.s6_addr);
            Ok(SocketAddr::V6(SocketAddrV6::new(
                ip,
                u16::from_be(sin6.sin6_port),
                sin6.sin6_flowinfo,
                sin6.sin6_scope_id,
            )))
        }
        _ => Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            "unsupported address family",
        )),
    }
}

fn sockname<F>(f: F) -> io::Result<SocketAddr>
where
    F: FnOnce(*mut libc::sockaddr, *mut socklen_t) -> io::Result<c_int>,
{
    let mut storage: libc::sockaddr_storage = unsafe { mem::zeroed() };
    let mut len = mem::size_of_val(&storage) as socklen_t;
    f(&mut storage as *mut _ as *mut _, &mut len)?;
    storage_to_addr(&storage)
}

/// A non-blocking, close-on-exec TCP socket.
///
/// The descriptor is closed when the value is dropped; ownership of an
/// accepted or connected descriptor is transferred by moving the `TcpSock`.
#[derive(Debug)]
pub struct TcpSock {
    inner: Fd,
}

impl TcpSock {
    /// Create an unbound stream socket of the same family as `addr`.
    pub fn new(addr: &SocketAddr) -> io::Result<TcpSock> {
        let family = match addr {
            SocketAddr::V4(..) => libc::AF_INET,
            SocketAddr::V6(..) => libc::AF_INET6,
        };
        let fd = syscall!(socket(family, SOCK_STREAM | SOCK_NONBLOCK | SOCK_CLOEXEC, 0))?;
        Ok(TcpSock { inner: Fd::new(fd) })
    }

    pub fn bind(&self, addr: &SocketAddr) -> io::Result<()> {
        let (storage, len) = addr_to_storage(addr);
        syscall!(bind(
            self.as_raw_fd(),
            &storage as *const _ as *const libc::sockaddr,
            len
        ))?;
        Ok(())
    }

    pub fn listen(&self, backlog: c_int) -> io::Result<()> {
        syscall!(listen(self.as_raw_fd(), backlog))?;
        Ok(())
    }

    pub fn accept(&self) -> io::Result<(TcpSock, SocketAddr)> {
        let mut storage: libc::sockaddr_storage = unsafe { mem::zeroed() };
        let mut len = mem::size_of_val(&storage) as socklen_t;

        let fd = syscall!(accept4(
            self.as_raw_fd(),
            &mut storage as *mut _ as *mut libc::sockaddr,
            &mut len,
            SOCK_NONBLOCK | SOCK_CLOEXEC
        ))?;

        let sock = TcpSock { inner: Fd::new(fd) };
        let peer = storage_to_addr(&storage)?;
        Ok((sock, peer))
    }

    pub fn connect(&self, addr: &SocketAddr) -> io::Result<()> {
        let (storage, len) = addr_to_storage(addr);
        syscall!(connect(
            self.as_raw_fd(),
            &storage as *const _ as *const libc::sockaddr,
            len
        ))?;
        Ok(())
    }

    /// Close the write half so the peer observes EOF while reads stay open.
    pub fn shutdown_write(&self) -> io::Result<()> {
        syscall!(shutdown(self.as_raw_fd(), libc::SHUT_WR))?;
        Ok(())
    }

    pub fn take_error(&self) -> io::Result<Option<io::Error>> {
        let raw: c_int = getsockopt(self, libc::SOL_SOCKET, libc::SO_ERROR)?;
        if raw == 0 {
            Ok(None)
        } else {
            Ok(Some(io::Error::from_raw_os_error(raw)))
        }
    }

    pub fn set_reuse_addr(&self, on: bool) -> io::Result<()> {
        setsockopt(self, libc::SOL_SOCKET, libc::SO_REUSEADDR, on as c_int)
    }

    pub fn set_reuse_port(&self, on: bool) -> io::Result<()> {
        setsockopt(self, libc::SOL_SOCKET, libc::SO_REUSEPORT, on as c_int)
    }

    pub fn set_nodelay(&self, on: bool) -> io::Result<()> {
        setsockopt(self, libc::IPPROTO_TCP, libc::TCP_NODELAY, on as c_int)
    }

    pub fn set_keep_alive(&self, on: bool) -> io::Result<()> {
        setsockopt(self, libc::SOL_SOCKET, libc::SO_KEEPALIVE, on as c_int)
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        let fd = self.as_raw_fd();
        sockname(|storage, len| syscall!(getsockname(fd, storage, len)))
    }

    pub fn peer_addr(&self) -> io::Result<SocketAddr> {
        let fd = self.as_raw_fd();
        sockname(|storage, len| syscall!(getpeername(fd, storage, len)))
    }

    pub fn read(&self, buf: &mut [u8]) -> io::Result<usize> {
        super::read(self.as_raw_fd(), buf)
    }

    pub fn write(&self, buf: &[u8]) -> io::Result<usize> {
        super::write(self.as_raw_fd(), buf)
    }
}

impl AsRawFd for TcpSock {
    fn as_raw_fd(&self) -> RawFd {
        self.inner.raw()
    }
}

#[cfg(test)]
mod test {
    use super::TcpSock;
    use std::io::{Read, Write};
    use std::net::TcpStream;

    #[test]
    fn bind_ephemeral_port() {
        let addr = "127.0.0.1:0".parse().unwrap();
        let sock = TcpSock::new(&addr).unwrap();
        sock.set_reuse_addr(true).unwrap();
        sock.bind(&addr).unwrap();

        let local = sock.local_addr().unwrap();
        assert_eq!(local.ip(), addr.ip());
        assert_ne!(local.port(), 0);
    }

    #[test]
    fn accept_and_echo() {
        let addr = "127.0.0.1:0".parse().unwrap();
        let listener = TcpSock::new(&addr).unwrap();
        listener.bind(&addr).unwrap();
        listener.listen(128).unwrap();
        let local = listener.local_addr().unwrap();

        let mut client = TcpStream::connect(local).unwrap();
        client.write_all(b"ping").unwrap();

        // The listener is non-blocking, so spin over WouldBlock until the
        // connection shows up in the accept queue.
        let (conn, peer) = loop {
            match listener.accept() {
                Ok(pair) => break pair,
                Err(ref e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                    std::thread::yield_now();
                }
                Err(e) => panic!("accept: {}", e),
            }
        };
        assert_eq!(peer, client.local_addr().unwrap());

        let mut buf = [0u8; 4];
        loop {
            match conn.read(&mut buf) {
                Ok(4) => break,
                Ok(n) => panic!("short read: {}", n),
                Err(ref e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                    std::thread::yield_now();
                }
                Err(e) => panic!("read: {}", e),
            }
        }
        assert_eq!(&buf, b"ping");

        conn.write(b"pong").unwrap();
        let mut reply = [0u8; 4];
        client.read_exact(&mut reply).unwrap();
        assert_eq!(&reply, b"pong");
    }
}
