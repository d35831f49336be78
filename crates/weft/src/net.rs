//! Thin socket facade over the hooked syscall layer
//!
//! `Socket`, `TcpListener`, and `TcpStream` wrap raw fds and call the
//! process's (interposed) libc entry points, so the same code blocks the
//! fiber on a worker thread and blocks the OS thread anywhere else.
//! Sockets are registered with the fd registry at creation, which also
//! flips them to kernel-level non-blocking.

use std::io;
use std::mem;
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr, SocketAddrV4, SocketAddrV6};
use std::time::Duration;

use tracing::debug;
use weft_runtime::fdreg::{self, NO_TIMEOUT};
use weft_runtime::hook;

fn last_error<T>() -> io::Result<T> {
    Err(io::Error::last_os_error())
}

/// Encode a `SocketAddr` for the kernel.
fn to_sockaddr(addr: &SocketAddr) -> (libc::sockaddr_storage, libc::socklen_t) {
    let mut storage: libc::sockaddr_storage = unsafe { mem::zeroed() };
    let len = match addr {
        SocketAddr::V4(v4) => {
            let sin = libc::sockaddr_in {
                sin_family: libc::AF_INET as libc::sa_family_t,
                sin_port: v4.port().to_be(),
                sin_addr: libc::in_addr {
                    s_addr: u32::from(*v4.ip()).to_be(),
                },
                sin_zero: [0; 8],
            };
            unsafe {
                std::ptr::write(&mut storage as *mut _ as *mut libc::sockaddr_in, sin);
            }
            mem::size_of::<libc::sockaddr_in>()
        }
        SocketAddr::V6(v6) => {
            let sin6 = libc::sockaddr_in6 {
                sin6_family: libc::AF_INET6 as libc::sa_family_t,
                sin6_port: v6.port().to_be(),
                sin6_flowinfo: v6.flowinfo(),
                sin6_addr: libc::in6_addr {
                    s6_addr: v6.ip().octets(),
                },
                sin6_scope_id: v6.scope_id(),
            };
            unsafe {
                std::ptr::write(&mut storage as *mut _ as *mut libc::sockaddr_in6, sin6);
            }
            mem::size_of::<libc::sockaddr_in6>()
        }
    };
    (storage, len as libc::socklen_t)
}

/// Decode a kernel address.
fn from_sockaddr(storage: &libc::sockaddr_storage) -> Option<SocketAddr> {
    match storage.ss_family as libc::c_int {
        libc::AF_INET => {
            let sin = unsafe { &*(storage as *const _ as *const libc::sockaddr_in) };
            Some(SocketAddr::V4(SocketAddrV4::new(
                Ipv4Addr::from(u32::from_be(sin.sin_addr.s_addr)),
                u16::from_be(sin.sin_port),
            )))
        }
        libc::AF_INET6 => {
            let sin6 = unsafe { &*(storage as *const _ as *const libc::sockaddr_in6) };
            Some(SocketAddr::V6(SocketAddrV6::new(
                Ipv6Addr::from(sin6.sin6_addr.s6_addr),
                u16::from_be(sin6.sin6_port),
                sin6.sin6_flowinfo,
                sin6.sin6_scope_id,
            )))
        }
        _ => None,
    }
}

/// A raw socket registered with the runtime.
pub struct Socket {
    fd: libc::c_int,
}

impl Socket {
    fn open(domain: libc::c_int, ty: libc::c_int) -> io::Result<Socket> {
        let fd = unsafe { libc::socket(domain, ty | libc::SOCK_CLOEXEC, 0) };
        if fd < 0 {
            return last_error();
        }
        // Registration flips the fd to kernel non-blocking; hooked I/O on
        // it cooperates from here on.
        fdreg::registry().get(fd, true);
        Ok(Socket { fd })
    }

    fn domain_of(addr: &SocketAddr) -> libc::c_int {
        match addr {
            SocketAddr::V4(_) => libc::AF_INET,
            SocketAddr::V6(_) => libc::AF_INET6,
        }
    }

    /// Create a TCP socket for `addr`'s family and register it.
    pub fn tcp(addr: &SocketAddr) -> io::Result<Socket> {
        Socket::open(Self::domain_of(addr), libc::SOCK_STREAM)
    }

    /// Create a UDP socket for `addr`'s family and register it.
    pub fn udp(addr: &SocketAddr) -> io::Result<Socket> {
        Socket::open(Self::domain_of(addr), libc::SOCK_DGRAM)
    }

    /// Create a Unix-domain stream socket and register it.
    pub fn unix_stream() -> io::Result<Socket> {
        Socket::open(libc::AF_UNIX, libc::SOCK_STREAM)
    }

    /// Adopt an fd returned by the kernel (e.g. from accept).
    pub fn from_raw(fd: libc::c_int) -> Socket {
        fdreg::registry().get(fd, true);
        Socket { fd }
    }

    #[inline]
    pub fn fd(&self) -> libc::c_int {
        self.fd
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        let mut storage: libc::sockaddr_storage = unsafe { mem::zeroed() };
        let mut len = mem::size_of::<libc::sockaddr_storage>() as libc::socklen_t;
        let ret = unsafe {
            libc::getsockname(self.fd, &mut storage as *mut _ as *mut libc::sockaddr, &mut len)
        };
        if ret != 0 {
            return last_error();
        }
        from_sockaddr(&storage)
            .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidData, "unknown address family"))
    }

    fn set_reuseaddr(&self) -> io::Result<()> {
        let opt: libc::c_int = 1;
        let ret = unsafe {
            libc::setsockopt(
                self.fd,
                libc::SOL_SOCKET,
                libc::SO_REUSEADDR,
                &opt as *const _ as *const libc::c_void,
                mem::size_of::<libc::c_int>() as libc::socklen_t,
            )
        };
        if ret != 0 {
            return last_error();
        }
        Ok(())
    }
}

impl Drop for Socket {
    fn drop(&mut self) {
        // The close hook cancels pending events and removes the registry
        // record on worker threads; elsewhere the record is dropped here.
        if !hook::hook_enabled() {
            fdreg::registry().remove(self.fd);
        }
        unsafe {
            libc::close(self.fd);
        }
    }
}

/// A listening TCP socket whose `accept` parks the calling fiber.
pub struct TcpListener {
    sock: Socket,
}

impl TcpListener {
    pub fn bind(addr: SocketAddr) -> io::Result<TcpListener> {
        let sock = Socket::tcp(&addr)?;
        sock.set_reuseaddr()?;
        let (storage, len) = to_sockaddr(&addr);
        let ret = unsafe {
            libc::bind(sock.fd, &storage as *const _ as *const libc::sockaddr, len)
        };
        if ret != 0 {
            return last_error();
        }
        if unsafe { libc::listen(sock.fd, 1024) } != 0 {
            return last_error();
        }
        debug!(fd = sock.fd, %addr, "listener bound");
        Ok(TcpListener { sock })
    }

    /// Accept one connection. On a worker this suspends the fiber until a
    /// client arrives (or the recv timeout, if one is set, expires).
    pub fn accept(&self) -> io::Result<(TcpStream, SocketAddr)> {
        let mut storage: libc::sockaddr_storage = unsafe { mem::zeroed() };
        let mut len = mem::size_of::<libc::sockaddr_storage>() as libc::socklen_t;
        let fd = unsafe {
            libc::accept(
                self.sock.fd,
                &mut storage as *mut _ as *mut libc::sockaddr,
                &mut len,
            )
        };
        if fd < 0 {
            return last_error();
        }
        let peer = from_sockaddr(&storage)
            .unwrap_or_else(|| SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, 0)));
        Ok((TcpStream { sock: Socket::from_raw(fd) }, peer))
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.sock.local_addr()
    }

    /// Bound the fiber-suspension time of `accept`.
    pub fn set_accept_timeout(&self, timeout: Option<Duration>) {
        set_fd_timeout(self.sock.fd, libc::SO_RCVTIMEO, timeout);
    }
}

/// A connected TCP socket with fiber-blocking reads and writes.
pub struct TcpStream {
    sock: Socket,
}

impl TcpStream {
    /// Connect with the configured `tcp.connect.timeout`.
    pub fn connect(addr: SocketAddr) -> io::Result<TcpStream> {
        let sock = Socket::tcp(&addr)?;
        let (storage, len) = to_sockaddr(&addr);
        let ret = unsafe {
            libc::connect(sock.fd, &storage as *const _ as *const libc::sockaddr, len)
        };
        if ret != 0 {
            return last_error();
        }
        Ok(TcpStream { sock })
    }

    /// Connect with an explicit deadline in milliseconds.
    pub fn connect_timeout(addr: SocketAddr, timeout_ms: u64) -> io::Result<TcpStream> {
        let sock = Socket::tcp(&addr)?;
        let (storage, len) = to_sockaddr(&addr);
        let ret = hook::connect_with_timeout(
            sock.fd,
            &storage as *const _ as *const libc::sockaddr,
            len,
            timeout_ms,
        );
        if ret != 0 {
            return last_error();
        }
        Ok(TcpStream { sock })
    }

    /// Read into `buf`; 0 means the peer closed. Parks the fiber while no
    /// data is available.
    pub fn read(&self, buf: &mut [u8]) -> io::Result<usize> {
        let n = unsafe {
            libc::read(self.sock.fd, buf.as_mut_ptr() as *mut libc::c_void, buf.len())
        };
        if n < 0 {
            return last_error();
        }
        Ok(n as usize)
    }

    /// Write from `buf`, possibly partially.
    pub fn write(&self, buf: &[u8]) -> io::Result<usize> {
        let n = unsafe {
            libc::write(self.sock.fd, buf.as_ptr() as *const libc::c_void, buf.len())
        };
        if n < 0 {
            return last_error();
        }
        Ok(n as usize)
    }

    /// Write the whole buffer, retrying partial writes.
    pub fn write_all(&self, mut buf: &[u8]) -> io::Result<()> {
        while !buf.is_empty() {
            let n = self.write(buf)?;
            if n == 0 {
                return Err(io::Error::new(io::ErrorKind::WriteZero, "wrote 0 bytes"));
            }
            buf = &buf[n..];
        }
        Ok(())
    }

    pub fn peer_addr(&self) -> io::Result<SocketAddr> {
        let mut storage: libc::sockaddr_storage = unsafe { mem::zeroed() };
        let mut len = mem::size_of::<libc::sockaddr_storage>() as libc::socklen_t;
        let ret = unsafe {
            libc::getpeername(self.sock.fd, &mut storage as *mut _ as *mut libc::sockaddr, &mut len)
        };
        if ret != 0 {
            return last_error();
        }
        from_sockaddr(&storage)
            .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidData, "unknown address family"))
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.sock.local_addr()
    }

    pub fn set_recv_timeout(&self, timeout: Option<Duration>) {
        set_fd_timeout(self.sock.fd, libc::SO_RCVTIMEO, timeout);
    }

    pub fn set_send_timeout(&self, timeout: Option<Duration>) {
        set_fd_timeout(self.sock.fd, libc::SO_SNDTIMEO, timeout);
    }

    pub fn shutdown(&self) -> io::Result<()> {
        if unsafe { libc::shutdown(self.sock.fd, libc::SHUT_RDWR) } != 0 {
            return last_error();
        }
        Ok(())
    }

    #[inline]
    pub fn fd(&self) -> libc::c_int {
        self.sock.fd
    }
}

/// A UDP socket with fiber-blocking datagram I/O.
pub struct UdpSocket {
    sock: Socket,
}

impl UdpSocket {
    pub fn bind(addr: SocketAddr) -> io::Result<UdpSocket> {
        let sock = Socket::udp(&addr)?;
        let (storage, len) = to_sockaddr(&addr);
        let ret = unsafe {
            libc::bind(sock.fd, &storage as *const _ as *const libc::sockaddr, len)
        };
        if ret != 0 {
            return last_error();
        }
        Ok(UdpSocket { sock })
    }

    pub fn send_to(&self, buf: &[u8], addr: SocketAddr) -> io::Result<usize> {
        let (storage, len) = to_sockaddr(&addr);
        let n = unsafe {
            libc::sendto(
                self.sock.fd,
                buf.as_ptr() as *const libc::c_void,
                buf.len(),
                0,
                &storage as *const _ as *const libc::sockaddr,
                len,
            )
        };
        if n < 0 {
            return last_error();
        }
        Ok(n as usize)
    }

    /// Receive one datagram; parks the fiber until one arrives (or the
    /// recv timeout expires).
    pub fn recv_from(&self, buf: &mut [u8]) -> io::Result<(usize, SocketAddr)> {
        let mut storage: libc::sockaddr_storage = unsafe { mem::zeroed() };
        let mut len = mem::size_of::<libc::sockaddr_storage>() as libc::socklen_t;
        let n = unsafe {
            libc::recvfrom(
                self.sock.fd,
                buf.as_mut_ptr() as *mut libc::c_void,
                buf.len(),
                0,
                &mut storage as *mut _ as *mut libc::sockaddr,
                &mut len,
            )
        };
        if n < 0 {
            return last_error();
        }
        let peer = from_sockaddr(&storage)
            .unwrap_or_else(|| SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, 0)));
        Ok((n as usize, peer))
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.sock.local_addr()
    }

    pub fn set_recv_timeout(&self, timeout: Option<Duration>) {
        set_fd_timeout(self.sock.fd, libc::SO_RCVTIMEO, timeout);
    }

    #[inline]
    pub fn fd(&self) -> libc::c_int {
        self.sock.fd
    }
}

/// Encode a filesystem path for AF_UNIX.
fn to_unix_sockaddr(path: &str) -> io::Result<(libc::sockaddr_un, libc::socklen_t)> {
    let mut addr: libc::sockaddr_un = unsafe { mem::zeroed() };
    addr.sun_family = libc::AF_UNIX as libc::sa_family_t;
    let bytes = path.as_bytes();
    if bytes.len() >= addr.sun_path.len() {
        return Err(io::Error::new(io::ErrorKind::InvalidInput, "socket path too long"));
    }
    for (dst, src) in addr.sun_path.iter_mut().zip(bytes) {
        *dst = *src as libc::c_char;
    }
    let len = mem::size_of::<libc::sa_family_t>() + bytes.len() + 1;
    Ok((addr, len as libc::socklen_t))
}

/// A listening Unix-domain stream socket.
pub struct UnixListener {
    sock: Socket,
    path: String,
}

impl UnixListener {
    /// Bind to `path`, replacing a stale socket file if one exists.
    pub fn bind(path: &str) -> io::Result<UnixListener> {
        let (addr, len) = to_unix_sockaddr(path)?;
        let sock = Socket::unix_stream()?;
        unsafe {
            let c_path = std::ffi::CString::new(path)
                .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "nul in path"))?;
            libc::unlink(c_path.as_ptr());
        }
        let ret = unsafe {
            libc::bind(sock.fd, &addr as *const _ as *const libc::sockaddr, len)
        };
        if ret != 0 {
            return last_error();
        }
        if unsafe { libc::listen(sock.fd, 1024) } != 0 {
            return last_error();
        }
        Ok(UnixListener {
            sock,
            path: path.to_string(),
        })
    }

    pub fn accept(&self) -> io::Result<UnixStream> {
        let fd = unsafe { libc::accept(self.sock.fd, std::ptr::null_mut(), std::ptr::null_mut()) };
        if fd < 0 {
            return last_error();
        }
        Ok(UnixStream {
            sock: Socket::from_raw(fd),
        })
    }

    pub fn path(&self) -> &str {
        &self.path
    }
}

impl Drop for UnixListener {
    fn drop(&mut self) {
        if let Ok(c_path) = std::ffi::CString::new(self.path.as_str()) {
            unsafe {
                libc::unlink(c_path.as_ptr());
            }
        }
    }
}

/// A connected Unix-domain stream.
pub struct UnixStream {
    sock: Socket,
}

impl UnixStream {
    pub fn connect(path: &str) -> io::Result<UnixStream> {
        let (addr, len) = to_unix_sockaddr(path)?;
        let sock = Socket::unix_stream()?;
        let ret = unsafe {
            libc::connect(sock.fd, &addr as *const _ as *const libc::sockaddr, len)
        };
        if ret != 0 {
            return last_error();
        }
        Ok(UnixStream { sock })
    }

    pub fn read(&self, buf: &mut [u8]) -> io::Result<usize> {
        let n = unsafe {
            libc::read(self.sock.fd, buf.as_mut_ptr() as *mut libc::c_void, buf.len())
        };
        if n < 0 {
            return last_error();
        }
        Ok(n as usize)
    }

    pub fn write_all(&self, mut buf: &[u8]) -> io::Result<()> {
        while !buf.is_empty() {
            let n = unsafe {
                libc::write(self.sock.fd, buf.as_ptr() as *const libc::c_void, buf.len())
            };
            if n < 0 {
                return last_error();
            }
            if n == 0 {
                return Err(io::Error::new(io::ErrorKind::WriteZero, "wrote 0 bytes"));
            }
            buf = &buf[n as usize..];
        }
        Ok(())
    }

    #[inline]
    pub fn fd(&self) -> libc::c_int {
        self.sock.fd
    }
}

/// Record a timeout in the fd registry, where the hooked retry loop reads
/// it. Works from any thread, hooks enabled or not.
fn set_fd_timeout(fd: libc::c_int, so_opt: libc::c_int, timeout: Option<Duration>) {
    if let Some(ctx) = fdreg::registry().get(fd, true) {
        let ms = timeout.map_or(NO_TIMEOUT, |d| d.as_millis() as u64);
        ctx.set_timeout_ms(so_opt, ms);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sockaddr_roundtrip_v4() {
        let addr: SocketAddr = "127.0.0.1:8080".parse().unwrap();
        let (storage, _) = to_sockaddr(&addr);
        assert_eq!(from_sockaddr(&storage), Some(addr));
    }

    #[test]
    fn test_sockaddr_roundtrip_v6() {
        let addr: SocketAddr = "[::1]:9090".parse().unwrap();
        let (storage, _) = to_sockaddr(&addr);
        assert_eq!(from_sockaddr(&storage), Some(addr));
    }

    #[test]
    fn test_bind_ephemeral_and_local_addr() {
        let listener = TcpListener::bind("127.0.0.1:0".parse().unwrap()).unwrap();
        let addr = listener.local_addr().unwrap();
        assert!(addr.port() != 0);
        assert!(addr.ip().is_loopback());
    }

    #[test]
    fn test_socket_registers_fd() {
        let addr: SocketAddr = "127.0.0.1:0".parse().unwrap();
        let sock = Socket::tcp(&addr).unwrap();
        let ctx = fdreg::registry().get(sock.fd(), false).unwrap();
        assert!(ctx.is_socket());
        assert!(ctx.sys_nonblock());
    }

    #[test]
    fn test_udp_bind_and_send() {
        let a = UdpSocket::bind("127.0.0.1:0".parse().unwrap()).unwrap();
        let b = UdpSocket::bind("127.0.0.1:0".parse().unwrap()).unwrap();
        let b_addr = b.local_addr().unwrap();

        assert_eq!(a.send_to(b"ping", b_addr).unwrap(), 4);

        // Off-worker the socket is non-blocking; poll briefly for arrival.
        let mut buf = [0u8; 16];
        let deadline = std::time::Instant::now() + Duration::from_secs(1);
        loop {
            match b.recv_from(&mut buf) {
                Ok((n, from)) => {
                    assert_eq!(&buf[..n], b"ping");
                    assert_eq!(from.port(), a.local_addr().unwrap().port());
                    break;
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                    assert!(std::time::Instant::now() < deadline, "datagram never arrived");
                    std::thread::sleep(Duration::from_millis(5));
                }
                Err(e) => panic!("recv_from failed: {}", e),
            }
        }
    }

    #[test]
    fn test_unix_sockaddr_rejects_long_paths() {
        let long = "/tmp/".to_string() + &"x".repeat(200);
        assert!(to_unix_sockaddr(&long).is_err());
        assert!(to_unix_sockaddr("/tmp/weft-test.sock").is_ok());
    }

    #[test]
    fn test_unix_listener_binds_and_cleans_up() {
        let path = format!("/tmp/weft-ut-{}.sock", std::process::id());
        {
            let listener = UnixListener::bind(&path).unwrap();
            assert_eq!(listener.path(), path);
            assert!(std::path::Path::new(&path).exists());
        }
        // Drop unlinks the socket file.
        assert!(!std::path::Path::new(&path).exists());
    }
}
