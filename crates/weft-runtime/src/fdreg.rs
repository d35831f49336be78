//! File-descriptor registry
//!
//! Process-wide table of per-fd metadata consumed by the hook layer: what
//! kind of fd it is, whether the user asked for non-blocking mode, and the
//! recv/send timeouts. Pollable fds (sockets and fifos) get the kernel
//! O_NONBLOCK flag set unconditionally at registration; the user-visible
//! blocking illusion is maintained by the `fcntl`/`ioctl` hooks.
//!
//! Storage is a growable vector indexed by fd behind a read-write lock,
//! upgrade-on-insert: the common lookup takes the read lock only.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, OnceLock, RwLock};

use tracing::debug;

use crate::hook;

/// No timeout configured.
pub const NO_TIMEOUT: u64 = u64::MAX;

/// Per-fd metadata record.
pub struct FdCtx {
    fd: libc::c_int,
    is_socket: bool,
    is_fifo: bool,
    sys_nonblock: AtomicBool,
    user_nonblock: AtomicBool,
    closed: AtomicBool,
    recv_timeout_ms: AtomicU64,
    send_timeout_ms: AtomicU64,
}

impl FdCtx {
    fn init(fd: libc::c_int) -> FdCtx {
        let mut st: libc::stat = unsafe { std::mem::zeroed() };
        let (is_socket, is_fifo) = if unsafe { libc::fstat(fd, &mut st) } == 0 {
            let fmt = st.st_mode & libc::S_IFMT;
            (fmt == libc::S_IFSOCK, fmt == libc::S_IFIFO)
        } else {
            (false, false)
        };

        let ctx = FdCtx {
            fd,
            is_socket,
            is_fifo,
            sys_nonblock: AtomicBool::new(false),
            user_nonblock: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            recv_timeout_ms: AtomicU64::new(NO_TIMEOUT),
            send_timeout_ms: AtomicU64::new(NO_TIMEOUT),
        };

        if ctx.is_pollable() {
            // Kernel-level non-blocking is what makes hooked I/O cooperate;
            // the user did not ask for it and must not observe it.
            let flags = hook::real_fcntl(fd, libc::F_GETFL, 0);
            if flags >= 0 && flags & libc::O_NONBLOCK == 0 {
                hook::real_fcntl(fd, libc::F_SETFL, (flags | libc::O_NONBLOCK) as libc::c_long);
            }
            ctx.sys_nonblock.store(true, Ordering::Release);
            debug!(fd, socket = is_socket, fifo = is_fifo, "fd registered");
        }
        ctx
    }

    #[inline]
    pub fn fd(&self) -> libc::c_int {
        self.fd
    }

    #[inline]
    pub fn is_socket(&self) -> bool {
        self.is_socket
    }

    #[inline]
    pub fn is_fifo(&self) -> bool {
        self.is_fifo
    }

    /// Readiness-notification works for this fd; hooked I/O cooperates.
    #[inline]
    pub fn is_pollable(&self) -> bool {
        self.is_socket || self.is_fifo
    }

    #[inline]
    pub fn sys_nonblock(&self) -> bool {
        self.sys_nonblock.load(Ordering::Acquire)
    }

    #[inline]
    pub fn user_nonblock(&self) -> bool {
        self.user_nonblock.load(Ordering::Acquire)
    }

    #[inline]
    pub fn set_user_nonblock(&self, on: bool) {
        self.user_nonblock.store(on, Ordering::Release);
    }

    #[inline]
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    #[inline]
    pub fn set_closed(&self) {
        self.closed.store(true, Ordering::Release);
    }

    /// Timeout keyed by `SO_RCVTIMEO` / `SO_SNDTIMEO`; `NO_TIMEOUT` when
    /// unset.
    pub fn timeout_ms(&self, so_opt: libc::c_int) -> u64 {
        if so_opt == libc::SO_RCVTIMEO {
            self.recv_timeout_ms.load(Ordering::Acquire)
        } else {
            self.send_timeout_ms.load(Ordering::Acquire)
        }
    }

    pub fn set_timeout_ms(&self, so_opt: libc::c_int, ms: u64) {
        if so_opt == libc::SO_RCVTIMEO {
            self.recv_timeout_ms.store(ms, Ordering::Release);
        } else {
            self.send_timeout_ms.store(ms, Ordering::Release);
        }
    }
}

/// The process-wide fd table.
pub struct FdRegistry {
    slots: RwLock<Vec<Option<Arc<FdCtx>>>>,
}

static REGISTRY: OnceLock<FdRegistry> = OnceLock::new();

/// The singleton registry.
pub fn registry() -> &'static FdRegistry {
    REGISTRY.get_or_init(|| FdRegistry {
        slots: RwLock::new(Vec::new()),
    })
}

impl FdRegistry {
    /// Look up the record for `fd`, creating and initialising one on demand
    /// when `auto_create` is set.
    pub fn get(&self, fd: libc::c_int, auto_create: bool) -> Option<Arc<FdCtx>> {
        if fd < 0 {
            return None;
        }
        let idx = fd as usize;
        {
            let slots = self.slots.read().unwrap();
            if let Some(Some(ctx)) = slots.get(idx) {
                return Some(ctx.clone());
            }
            if !auto_create {
                return None;
            }
        }

        let mut slots = self.slots.write().unwrap();
        if idx >= slots.len() {
            slots.resize(idx + idx / 2 + 1, None);
        }
        // Somebody may have raced us between the locks.
        if slots[idx].is_none() {
            slots[idx] = Some(Arc::new(FdCtx::init(fd)));
        }
        slots[idx].clone()
    }

    /// Drop the record for `fd`. Called from the `close` hook so a later
    /// fd reuse starts from a fresh record.
    pub fn remove(&self, fd: libc::c_int) {
        if fd < 0 {
            return;
        }
        let mut slots = self.slots.write().unwrap();
        if let Some(slot) = slots.get_mut(fd as usize) {
            *slot = None;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn raw_pipe() -> (libc::c_int, libc::c_int) {
        let mut fds = [0 as libc::c_int; 2];
        let ret = unsafe { libc::pipe(fds.as_mut_ptr()) };
        assert_eq!(ret, 0);
        (fds[0], fds[1])
    }

    #[test]
    fn test_get_without_autocreate_is_none() {
        let (r, w) = raw_pipe();
        assert!(registry().get(r, false).is_none());
        registry().remove(r);
        hook::real_close(r);
        hook::real_close(w);
    }

    #[test]
    fn test_fifo_classified_and_nonblocked() {
        let (r, w) = raw_pipe();
        let ctx = registry().get(r, true).unwrap();
        assert!(ctx.is_fifo());
        assert!(!ctx.is_socket());
        assert!(ctx.is_pollable());
        assert!(ctx.sys_nonblock());
        assert!(!ctx.user_nonblock());

        let flags = hook::real_fcntl(r, libc::F_GETFL, 0);
        assert!(flags & libc::O_NONBLOCK != 0);

        registry().remove(r);
        hook::real_close(r);
        hook::real_close(w);
    }

    #[test]
    fn test_socket_classified() {
        let fd = unsafe { libc::socket(libc::AF_INET, libc::SOCK_STREAM, 0) };
        assert!(fd >= 0);
        let ctx = registry().get(fd, true).unwrap();
        assert!(ctx.is_socket());
        assert!(ctx.sys_nonblock());
        registry().remove(fd);
        hook::real_close(fd);
    }

    #[test]
    fn test_record_is_per_fd_and_removed() {
        let (r, w) = raw_pipe();
        let a = registry().get(r, true).unwrap();
        let b = registry().get(r, true).unwrap();
        assert!(Arc::ptr_eq(&a, &b));

        registry().remove(r);
        assert!(registry().get(r, false).is_none());
        registry().remove(w);
        hook::real_close(r);
        hook::real_close(w);
    }

    #[test]
    fn test_timeouts_roundtrip() {
        let (r, w) = raw_pipe();
        let ctx = registry().get(r, true).unwrap();
        assert_eq!(ctx.timeout_ms(libc::SO_RCVTIMEO), NO_TIMEOUT);
        ctx.set_timeout_ms(libc::SO_RCVTIMEO, 250);
        ctx.set_timeout_ms(libc::SO_SNDTIMEO, 500);
        assert_eq!(ctx.timeout_ms(libc::SO_RCVTIMEO), 250);
        assert_eq!(ctx.timeout_ms(libc::SO_SNDTIMEO), 500);
        registry().remove(r);
        hook::real_close(r);
        hook::real_close(w);
    }
}
