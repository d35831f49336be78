//! Transparent syscall interception
//!
//! The runtime exports C-ABI definitions of the blocking primitives
//! (sleep/connect/read/write/... — the full list is in `real_table!`), so
//! every call in the process resolves to these shims at link time. Each
//! shim looks up the "real" libc entry point through `dlsym(RTLD_NEXT)`
//! and either passes straight through or converts the call into a
//! cooperative suspension on the current `IoManager`.
//!
//! A thread-local `hook_enabled` flag gates the behavior: it starts false
//! everywhere and is flipped on when a worker enters its dispatcher, so
//! only code running under the runtime cooperates. The fast path (hooks
//! off, fd unknown, fd not pollable, user asked for non-blocking) is a
//! plain tail call into libc.
//!
//! Callers above this layer observe exactly the libc contract: `-1` with
//! `errno` set, or a meaningful value. Timeouts surface as `ETIMEDOUT`,
//! closed descriptors as `EBADF`.

use std::cell::Cell;
use std::sync::atomic::{AtomicI32, AtomicU64, Ordering};
use std::sync::{Arc, Once, OnceLock};

use libc::{c_int, c_long, c_uint, c_ulong, c_void, size_t, socklen_t, ssize_t};
use tracing::{debug, error, warn};

use crate::config;
use crate::fdreg;
use crate::fiber::{self, Fiber};
use crate::iomanager::{EventKind, IoManager};
use crate::scheduler::{Dispatch, Task};

// ── Real entry points ──

macro_rules! real_table {
    ($( $name:ident : $ty:ty ; )*) => {
        #[allow(dead_code)]
        struct RealFns {
            $( $name: $ty, )*
        }

        impl RealFns {
            /// Resolve every wrapped symbol's next-in-chain implementation.
            fn resolve() -> RealFns {
                unsafe {
                    RealFns {
                        $(
                            $name: {
                                let sym = libc::dlsym(
                                    libc::RTLD_NEXT,
                                    concat!(stringify!($name), "\0").as_ptr() as *const libc::c_char,
                                );
                                assert!(
                                    !sym.is_null(),
                                    concat!("dlsym(RTLD_NEXT, \"", stringify!($name), "\") failed")
                                );
                                std::mem::transmute_copy::<*mut c_void, $ty>(&sym)
                            },
                        )*
                    }
                }
            }
        }
    };
}

real_table! {
    sleep: unsafe extern "C" fn(c_uint) -> c_uint;
    usleep: unsafe extern "C" fn(libc::useconds_t) -> c_int;
    nanosleep: unsafe extern "C" fn(*const libc::timespec, *mut libc::timespec) -> c_int;
    socket: unsafe extern "C" fn(c_int, c_int, c_int) -> c_int;
    connect: unsafe extern "C" fn(c_int, *const libc::sockaddr, socklen_t) -> c_int;
    accept: unsafe extern "C" fn(c_int, *mut libc::sockaddr, *mut socklen_t) -> c_int;
    read: unsafe extern "C" fn(c_int, *mut c_void, size_t) -> ssize_t;
    readv: unsafe extern "C" fn(c_int, *const libc::iovec, c_int) -> ssize_t;
    recv: unsafe extern "C" fn(c_int, *mut c_void, size_t, c_int) -> ssize_t;
    recvfrom: unsafe extern "C" fn(
        c_int,
        *mut c_void,
        size_t,
        c_int,
        *mut libc::sockaddr,
        *mut socklen_t,
    ) -> ssize_t;
    recvmsg: unsafe extern "C" fn(c_int, *mut libc::msghdr, c_int) -> ssize_t;
    write: unsafe extern "C" fn(c_int, *const c_void, size_t) -> ssize_t;
    writev: unsafe extern "C" fn(c_int, *const libc::iovec, c_int) -> ssize_t;
    send: unsafe extern "C" fn(c_int, *const c_void, size_t, c_int) -> ssize_t;
    sendto: unsafe extern "C" fn(
        c_int,
        *const c_void,
        size_t,
        c_int,
        *const libc::sockaddr,
        socklen_t,
    ) -> ssize_t;
    sendmsg: unsafe extern "C" fn(c_int, *const libc::msghdr, c_int) -> ssize_t;
    close: unsafe extern "C" fn(c_int) -> c_int;
    fcntl: unsafe extern "C" fn(c_int, c_int, c_long) -> c_int;
    ioctl: unsafe extern "C" fn(c_int, c_ulong, *mut c_void) -> c_int;
    getsockopt: unsafe extern "C" fn(c_int, c_int, c_int, *mut c_void, *mut socklen_t) -> c_int;
    setsockopt: unsafe extern "C" fn(c_int, c_int, c_int, *const c_void, socklen_t) -> c_int;
}

static REAL: OnceLock<RealFns> = OnceLock::new();

fn real() -> &'static RealFns {
    REAL.get_or_init(RealFns::resolve)
}

// Runtime internals must reach libc through these, never through the
// plain symbol names, which resolve back into the shims below.

pub(crate) fn real_read(fd: c_int, buf: *mut c_void, len: usize) -> isize {
    unsafe { (real().read)(fd, buf, len) }
}

pub(crate) fn real_write(fd: c_int, buf: *const c_void, len: usize) -> isize {
    unsafe { (real().write)(fd, buf, len) }
}

pub(crate) fn real_close(fd: c_int) -> c_int {
    unsafe { (real().close)(fd) }
}

pub(crate) fn real_fcntl(fd: c_int, cmd: c_int, arg: c_long) -> c_int {
    unsafe { (real().fcntl)(fd, cmd, arg) }
}

// ── errno plumbing ──

#[inline]
pub(crate) fn errno() -> c_int {
    unsafe { *libc::__errno_location() }
}

#[inline]
pub(crate) fn set_errno(e: c_int) {
    unsafe {
        *libc::__errno_location() = e;
    }
}

// ── Hook gate ──

thread_local! {
    static HOOK_ENABLED: Cell<bool> = const { Cell::new(false) };
}

/// Whether blocking primitives cooperate on this thread.
#[inline]
pub fn hook_enabled() -> bool {
    HOOK_ENABLED.with(|c| c.get())
}

/// Flip the gate; workers do this when entering their dispatcher.
#[inline]
pub fn set_hook_enabled(on: bool) {
    HOOK_ENABLED.with(|c| c.set(on));
}

// ── Connect timeout cache ──

static CONNECT_TIMEOUT_MS: AtomicU64 = AtomicU64::new(config::DEFAULT_CONNECT_TIMEOUT_MS);
static CONNECT_TIMEOUT_INIT: Once = Once::new();

/// Cached `tcp.connect.timeout`, kept current by a config listener.
pub(crate) fn connect_timeout_ms() -> u64 {
    CONNECT_TIMEOUT_INIT.call_once(|| {
        let var = config::tcp_connect_timeout();
        CONNECT_TIMEOUT_MS.store(var.get(), Ordering::SeqCst);
        var.on_change(|old, new| {
            debug!(old, new, "tcp connect timeout changed");
            CONNECT_TIMEOUT_MS.store(new, Ordering::SeqCst);
        });
    });
    CONNECT_TIMEOUT_MS.load(Ordering::SeqCst)
}

// ── Cooperative cores ──

/// Park the current fiber for `ms` milliseconds via a timer. False when
/// cooperation is impossible (hooks off, no reactor, bootstrap fiber);
/// the caller falls back to the real syscall.
fn cooperative_sleep_ms(ms: u64) -> bool {
    if !hook_enabled() {
        return false;
    }
    let Some(iom) = IoManager::current() else {
        return false;
    };
    let current = Fiber::current();
    if current.is_bootstrap() {
        return false;
    }

    let target = Arc::downgrade(&iom);
    let f = current.clone();
    iom.add_timer(
        ms,
        move || {
            if let Some(m) = target.upgrade() {
                m.schedule(Task::fiber(f.clone()));
            }
        },
        false,
    );
    fiber::yield_hold();
    true
}

/// The generic hooked-I/O retry loop.
///
/// Runs the real call; on EAGAIN registers `(fd, kind)` interest plus an
/// optional conditional timeout timer, parks the fiber, and either
/// surfaces `ETIMEDOUT` or retries. EINTR always retries inline.
fn do_io<F>(fd: c_int, kind: EventKind, timeout_opt: c_int, name: &'static str, mut io: F) -> ssize_t
where
    F: FnMut() -> ssize_t,
{
    if !hook_enabled() {
        return io();
    }
    let Some(ctx) = fdreg::registry().get(fd, false) else {
        return io();
    };
    if ctx.is_closed() {
        set_errno(libc::EBADF);
        return -1;
    }
    if !ctx.is_pollable() || ctx.user_nonblock() {
        return io();
    }
    let timeout = ctx.timeout_ms(timeout_opt);
    // Dropped when this call returns; the conditional timer then becomes
    // inert even if it is still queued.
    let waiter = Arc::new(AtomicI32::new(0));

    loop {
        let mut n = io();
        while n == -1 && errno() == libc::EINTR {
            n = io();
        }
        if n != -1 {
            return n;
        }
        if errno() != libc::EAGAIN {
            return -1;
        }

        let Some(iom) = IoManager::current() else {
            // Hooked but no reactor on this thread; the caller sees the
            // non-blocking result.
            return -1;
        };

        let timer = (timeout != fdreg::NO_TIMEOUT).then(|| {
            let flag = Arc::downgrade(&waiter);
            let target = Arc::downgrade(&iom);
            iom.add_conditional_timer(
                timeout,
                move || {
                    let Some(flag) = flag.upgrade() else { return };
                    if flag.load(Ordering::SeqCst) != 0 {
                        return;
                    }
                    flag.store(libc::ETIMEDOUT, Ordering::SeqCst);
                    if let Some(m) = target.upgrade() {
                        let _ = m.cancel_event(fd, kind);
                    }
                },
                Arc::downgrade(&waiter),
                false,
            )
        });

        match iom.add_event(fd, kind, None) {
            Err(e) => {
                warn!(fd, op = name, "add_event failed: {}", e);
                if let Some(t) = timer {
                    t.cancel();
                }
                return -1;
            }
            Ok(()) => {
                fiber::yield_hold();
                if let Some(t) = timer {
                    t.cancel();
                }
                let cancelled = waiter.load(Ordering::SeqCst);
                if cancelled != 0 {
                    set_errno(cancelled);
                    return -1;
                }
                // Woken by readiness; retry the real call.
            }
        }
    }
}

/// Hooked `connect` with an explicit deadline. `u64::MAX` means no
/// deadline.
pub fn connect_with_timeout(
    sockfd: c_int,
    addr: *const libc::sockaddr,
    addrlen: socklen_t,
    timeout_ms: u64,
) -> c_int {
    if !hook_enabled() {
        return unsafe { (real().connect)(sockfd, addr, addrlen) };
    }
    let Some(ctx) = fdreg::registry().get(sockfd, true) else {
        return unsafe { (real().connect)(sockfd, addr, addrlen) };
    };
    if ctx.is_closed() {
        set_errno(libc::EBADF);
        return -1;
    }
    if !ctx.is_socket() || ctx.user_nonblock() {
        return unsafe { (real().connect)(sockfd, addr, addrlen) };
    }

    let n = unsafe { (real().connect)(sockfd, addr, addrlen) };
    if n == 0 {
        return 0;
    }
    if n != -1 || errno() != libc::EINPROGRESS {
        return n;
    }
    let Some(iom) = IoManager::current() else {
        return n;
    };

    let waiter = Arc::new(AtomicI32::new(0));
    let timer = (timeout_ms != u64::MAX).then(|| {
        let flag = Arc::downgrade(&waiter);
        let target = Arc::downgrade(&iom);
        iom.add_conditional_timer(
            timeout_ms,
            move || {
                let Some(flag) = flag.upgrade() else { return };
                if flag.load(Ordering::SeqCst) != 0 {
                    return;
                }
                flag.store(libc::ETIMEDOUT, Ordering::SeqCst);
                if let Some(m) = target.upgrade() {
                    let _ = m.cancel_event(sockfd, EventKind::WRITE);
                }
            },
            Arc::downgrade(&waiter),
            false,
        )
    });

    // The socket becomes writable as soon as the handshake settles.
    match iom.add_event(sockfd, EventKind::WRITE, None) {
        Ok(()) => {
            fiber::yield_hold();
            if let Some(t) = timer {
                t.cancel();
            }
            let cancelled = waiter.load(Ordering::SeqCst);
            if cancelled != 0 {
                set_errno(cancelled);
                return -1;
            }
        }
        Err(e) => {
            if let Some(t) = timer {
                t.cancel();
            }
            error!(fd = sockfd, "connect add_event failed: {}", e);
        }
    }

    let mut err: c_int = 0;
    let mut len = std::mem::size_of::<c_int>() as socklen_t;
    let ret = unsafe {
        (real().getsockopt)(
            sockfd,
            libc::SOL_SOCKET,
            libc::SO_ERROR,
            &mut err as *mut c_int as *mut c_void,
            &mut len,
        )
    };
    if ret == -1 {
        return -1;
    }
    if err == 0 {
        0
    } else {
        set_errno(err);
        -1
    }
}

// ── C ABI shims ──
//
// Everything below overrides the corresponding libc symbol for this
// process. Signatures must match libc exactly.

#[unsafe(no_mangle)]
pub unsafe extern "C" fn sleep(seconds: c_uint) -> c_uint {
    if cooperative_sleep_ms(seconds as u64 * 1000) {
        0
    } else {
        (real().sleep)(seconds)
    }
}

#[unsafe(no_mangle)]
pub unsafe extern "C" fn usleep(usec: libc::useconds_t) -> c_int {
    if cooperative_sleep_ms(usec as u64 / 1000) {
        0
    } else {
        (real().usleep)(usec)
    }
}

#[unsafe(no_mangle)]
pub unsafe extern "C" fn nanosleep(
    req: *const libc::timespec,
    rem: *mut libc::timespec,
) -> c_int {
    if req.is_null() {
        set_errno(libc::EFAULT);
        return -1;
    }
    let ms = (*req).tv_sec as u64 * 1000 + (*req).tv_nsec as u64 / 1_000_000;
    if cooperative_sleep_ms(ms) {
        0
    } else {
        (real().nanosleep)(req, rem)
    }
}

#[unsafe(no_mangle)]
pub unsafe extern "C" fn socket(domain: c_int, ty: c_int, protocol: c_int) -> c_int {
    let fd = (real().socket)(domain, ty, protocol);
    if fd >= 0 && hook_enabled() {
        fdreg::registry().get(fd, true);
    }
    fd
}

#[unsafe(no_mangle)]
pub unsafe extern "C" fn connect(
    sockfd: c_int,
    addr: *const libc::sockaddr,
    addrlen: socklen_t,
) -> c_int {
    connect_with_timeout(sockfd, addr, addrlen, connect_timeout_ms())
}

#[unsafe(no_mangle)]
pub unsafe extern "C" fn accept(
    sockfd: c_int,
    addr: *mut libc::sockaddr,
    addrlen: *mut socklen_t,
) -> c_int {
    let fd = do_io(sockfd, EventKind::READ, libc::SO_RCVTIMEO, "accept", || unsafe {
        (real().accept)(sockfd, addr, addrlen) as ssize_t
    }) as c_int;
    if fd >= 0 && hook_enabled() {
        fdreg::registry().get(fd, true);
    }
    fd
}

#[unsafe(no_mangle)]
pub unsafe extern "C" fn read(fd: c_int, buf: *mut c_void, count: size_t) -> ssize_t {
    do_io(fd, EventKind::READ, libc::SO_RCVTIMEO, "read", || unsafe {
        (real().read)(fd, buf, count)
    })
}

#[unsafe(no_mangle)]
pub unsafe extern "C" fn readv(fd: c_int, iov: *const libc::iovec, iovcnt: c_int) -> ssize_t {
    do_io(fd, EventKind::READ, libc::SO_RCVTIMEO, "readv", || unsafe {
        (real().readv)(fd, iov, iovcnt)
    })
}

#[unsafe(no_mangle)]
pub unsafe extern "C" fn recv(sockfd: c_int, buf: *mut c_void, len: size_t, flags: c_int) -> ssize_t {
    do_io(sockfd, EventKind::READ, libc::SO_RCVTIMEO, "recv", || unsafe {
        (real().recv)(sockfd, buf, len, flags)
    })
}

#[unsafe(no_mangle)]
pub unsafe extern "C" fn recvfrom(
    sockfd: c_int,
    buf: *mut c_void,
    len: size_t,
    flags: c_int,
    src_addr: *mut libc::sockaddr,
    addrlen: *mut socklen_t,
) -> ssize_t {
    do_io(sockfd, EventKind::READ, libc::SO_RCVTIMEO, "recvfrom", || unsafe {
        (real().recvfrom)(sockfd, buf, len, flags, src_addr, addrlen)
    })
}

#[unsafe(no_mangle)]
pub unsafe extern "C" fn recvmsg(sockfd: c_int, msg: *mut libc::msghdr, flags: c_int) -> ssize_t {
    do_io(sockfd, EventKind::READ, libc::SO_RCVTIMEO, "recvmsg", || unsafe {
        (real().recvmsg)(sockfd, msg, flags)
    })
}

#[unsafe(no_mangle)]
pub unsafe extern "C" fn write(fd: c_int, buf: *const c_void, count: size_t) -> ssize_t {
    do_io(fd, EventKind::WRITE, libc::SO_SNDTIMEO, "write", || unsafe {
        (real().write)(fd, buf, count)
    })
}

#[unsafe(no_mangle)]
pub unsafe extern "C" fn writev(fd: c_int, iov: *const libc::iovec, iovcnt: c_int) -> ssize_t {
    do_io(fd, EventKind::WRITE, libc::SO_SNDTIMEO, "writev", || unsafe {
        (real().writev)(fd, iov, iovcnt)
    })
}

#[unsafe(no_mangle)]
pub unsafe extern "C" fn send(sockfd: c_int, buf: *const c_void, len: size_t, flags: c_int) -> ssize_t {
    do_io(sockfd, EventKind::WRITE, libc::SO_SNDTIMEO, "send", || unsafe {
        (real().send)(sockfd, buf, len, flags)
    })
}

#[unsafe(no_mangle)]
pub unsafe extern "C" fn sendto(
    sockfd: c_int,
    buf: *const c_void,
    len: size_t,
    flags: c_int,
    dest_addr: *const libc::sockaddr,
    addrlen: socklen_t,
) -> ssize_t {
    do_io(sockfd, EventKind::WRITE, libc::SO_SNDTIMEO, "sendto", || unsafe {
        (real().sendto)(sockfd, buf, len, flags, dest_addr, addrlen)
    })
}

#[unsafe(no_mangle)]
pub unsafe extern "C" fn sendmsg(sockfd: c_int, msg: *const libc::msghdr, flags: c_int) -> ssize_t {
    do_io(sockfd, EventKind::WRITE, libc::SO_SNDTIMEO, "sendmsg", || unsafe {
        (real().sendmsg)(sockfd, msg, flags)
    })
}

#[unsafe(no_mangle)]
pub unsafe extern "C" fn close(fd: c_int) -> c_int {
    if hook_enabled() {
        if let Some(ctx) = fdreg::registry().get(fd, false) {
            ctx.set_closed();
            // Wake anything parked on the fd before the kernel reuses it;
            // waiters retry and observe EBADF.
            if let Some(iom) = IoManager::current() {
                let _ = iom.cancel_all(fd);
            }
            fdreg::registry().remove(fd);
        }
    }
    (real().close)(fd)
}

#[unsafe(no_mangle)]
pub unsafe extern "C" fn fcntl(fd: c_int, cmd: c_int, arg: c_long) -> c_int {
    match cmd {
        libc::F_SETFL => {
            if let Some(ctx) = fdreg::registry().get(fd, false) {
                if !ctx.is_closed() && ctx.is_pollable() {
                    let mut flags = arg as c_int;
                    // Remember what the user asked for, then force the
                    // kernel flag to follow the runtime's requirement.
                    ctx.set_user_nonblock(flags & libc::O_NONBLOCK != 0);
                    if ctx.sys_nonblock() {
                        flags |= libc::O_NONBLOCK;
                    } else {
                        flags &= !libc::O_NONBLOCK;
                    }
                    return (real().fcntl)(fd, cmd, flags as c_long);
                }
            }
            (real().fcntl)(fd, cmd, arg)
        }
        libc::F_GETFL => {
            let flags = (real().fcntl)(fd, cmd, 0);
            if flags == -1 {
                return flags;
            }
            if let Some(ctx) = fdreg::registry().get(fd, false) {
                if !ctx.is_closed() && ctx.is_pollable() {
                    // Report what the user set, not what the kernel holds.
                    return if ctx.user_nonblock() {
                        flags | libc::O_NONBLOCK
                    } else {
                        flags & !libc::O_NONBLOCK
                    };
                }
            }
            flags
        }
        _ => (real().fcntl)(fd, cmd, arg),
    }
}

#[unsafe(no_mangle)]
pub unsafe extern "C" fn ioctl(fd: c_int, request: c_ulong, arg: *mut c_void) -> c_int {
    if request == libc::FIONBIO as c_ulong && !arg.is_null() {
        let on = *(arg as *const c_int) != 0;
        if let Some(ctx) = fdreg::registry().get(fd, false) {
            if !ctx.is_closed() && ctx.is_pollable() {
                ctx.set_user_nonblock(on);
            }
        }
    }
    (real().ioctl)(fd, request, arg)
}

#[unsafe(no_mangle)]
pub unsafe extern "C" fn getsockopt(
    sockfd: c_int,
    level: c_int,
    optname: c_int,
    optval: *mut c_void,
    optlen: *mut socklen_t,
) -> c_int {
    (real().getsockopt)(sockfd, level, optname, optval, optlen)
}

#[unsafe(no_mangle)]
pub unsafe extern "C" fn setsockopt(
    sockfd: c_int,
    level: c_int,
    optname: c_int,
    optval: *const c_void,
    optlen: socklen_t,
) -> c_int {
    if hook_enabled()
        && level == libc::SOL_SOCKET
        && (optname == libc::SO_RCVTIMEO || optname == libc::SO_SNDTIMEO)
        && !optval.is_null()
        && optlen as usize >= std::mem::size_of::<libc::timeval>()
    {
        if let Some(ctx) = fdreg::registry().get(sockfd, false) {
            let tv = &*(optval as *const libc::timeval);
            let ms = tv.tv_sec as u64 * 1000 + tv.tv_usec as u64 / 1000;
            ctx.set_timeout_ms(optname, ms);
        }
    }
    (real().setsockopt)(sockfd, level, optname, optval, optlen)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hook_gate_defaults_off() {
        assert!(!hook_enabled());
        set_hook_enabled(true);
        assert!(hook_enabled());
        set_hook_enabled(false);
        assert!(!hook_enabled());
    }

    #[test]
    fn test_real_symbols_resolve() {
        // A short smoke test through the dlsym table.
        let mut fds = [0 as c_int; 2];
        assert_eq!(unsafe { libc::pipe(fds.as_mut_ptr()) }, 0);
        let (r, w) = (fds[0], fds[1]);

        let msg = b"hi";
        assert_eq!(real_write(w, msg.as_ptr() as *const c_void, 2), 2);
        let mut buf = [0u8; 8];
        assert_eq!(real_read(r, buf.as_mut_ptr() as *mut c_void, 8), 2);
        assert_eq!(&buf[..2], b"hi");

        assert_eq!(real_close(r), 0);
        assert_eq!(real_close(w), 0);
    }

    #[test]
    fn test_connect_timeout_cache_follows_config() {
        let initial = connect_timeout_ms();
        assert!(initial > 0);
        config::tcp_connect_timeout().set(1234);
        assert_eq!(connect_timeout_ms(), 1234);
        config::tcp_connect_timeout().set(initial);
        assert_eq!(connect_timeout_ms(), initial);
    }

    #[test]
    fn test_fcntl_preserves_user_blocking_illusion() {
        let fd = unsafe { libc::socket(libc::AF_INET, libc::SOCK_STREAM, 0) };
        assert!(fd >= 0);
        fdreg::registry().get(fd, true).unwrap();

        // The kernel flag is set by registration...
        let raw = real_fcntl(fd, libc::F_GETFL, 0);
        assert!(raw & libc::O_NONBLOCK != 0);

        // ...but the hooked F_GETFL hides it until the user opts in.
        let seen = unsafe { fcntl(fd, libc::F_GETFL, 0) };
        assert_eq!(seen & libc::O_NONBLOCK, 0);

        let ret = unsafe { fcntl(fd, libc::F_SETFL, (seen | libc::O_NONBLOCK) as c_long) };
        assert_eq!(ret, 0);
        let seen = unsafe { fcntl(fd, libc::F_GETFL, 0) };
        assert!(seen & libc::O_NONBLOCK != 0);

        fdreg::registry().remove(fd);
        real_close(fd);
    }

    #[test]
    fn test_setsockopt_mirrors_timeouts() {
        let fd = unsafe { libc::socket(libc::AF_INET, libc::SOCK_STREAM, 0) };
        assert!(fd >= 0);
        let ctx = fdreg::registry().get(fd, true).unwrap();

        set_hook_enabled(true);
        let tv = libc::timeval {
            tv_sec: 1,
            tv_usec: 500_000,
        };
        let ret = unsafe {
            setsockopt(
                fd,
                libc::SOL_SOCKET,
                libc::SO_RCVTIMEO,
                &tv as *const libc::timeval as *const c_void,
                std::mem::size_of::<libc::timeval>() as socklen_t,
            )
        };
        set_hook_enabled(false);
        assert_eq!(ret, 0);
        assert_eq!(ctx.timeout_ms(libc::SO_RCVTIMEO), 1500);

        fdreg::registry().remove(fd);
        real_close(fd);
    }
}
