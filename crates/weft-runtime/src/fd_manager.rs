//! Tracked file descriptors
//!
//! The hook layer only reroutes calls on fds it knows about. An
//! `FdCtx` records whether the fd is a socket, who asked for
//! non-blocking mode (the runtime vs the user), and per-direction
//! timeouts. Sockets are forced into non-blocking mode on first
//! sight; the hook layer then simulates blocking semantics on top.

use std::os::unix::io::RawFd;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, OnceLock, PoisonError, RwLock};

/// No timeout configured
pub const NO_TIMEOUT: u64 = u64::MAX;

/// Which direction a timeout applies to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimeoutKind {
    Recv,
    Send,
}

/// Per-fd state the hook layer consults
pub struct FdCtx {
    fd: RawFd,
    is_socket: bool,
    /// Non-blocking set by the runtime (sockets always)
    sys_nonblock: AtomicBool,
    /// Non-blocking requested by the user
    user_nonblock: AtomicBool,
    closed: AtomicBool,
    recv_timeout_ms: AtomicU64,
    send_timeout_ms: AtomicU64,
}

impl FdCtx {
    fn new(fd: RawFd) -> FdCtx {
        let mut stat: libc::stat = unsafe { std::mem::zeroed() };
        let is_socket = unsafe { libc::fstat(fd, &mut stat) } == 0
            && stat.st_mode & libc::S_IFMT == libc::S_IFSOCK;

        let ctx = FdCtx {
            fd,
            is_socket,
            sys_nonblock: AtomicBool::new(false),
            user_nonblock: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            recv_timeout_ms: AtomicU64::new(NO_TIMEOUT),
            send_timeout_ms: AtomicU64::new(NO_TIMEOUT),
        };
        if is_socket {
            unsafe {
                let flags = libc::fcntl(fd, libc::F_GETFL, 0);
                if flags & libc::O_NONBLOCK == 0 {
                    libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK);
                }
            }
            ctx.sys_nonblock.store(true, Ordering::Release);
        }
        ctx
    }

    #[inline]
    pub fn fd(&self) -> RawFd {
        self.fd
    }

    #[inline]
    pub fn is_socket(&self) -> bool {
        self.is_socket
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    pub(crate) fn mark_closed(&self) {
        self.closed.store(true, Ordering::Release);
    }

    /// Non-blocking as far as the kernel is concerned
    pub fn sys_nonblock(&self) -> bool {
        self.sys_nonblock.load(Ordering::Acquire)
    }

    /// Non-blocking as far as the user asked for. The hook layer
    /// passes EAGAIN straight through on these fds.
    pub fn user_nonblock(&self) -> bool {
        self.user_nonblock.load(Ordering::Acquire)
    }

    pub fn set_user_nonblock(&self, v: bool) {
        self.user_nonblock.store(v, Ordering::Release);
    }

    /// Timeout in ms for the given direction, `NO_TIMEOUT` if unset
    pub fn timeout(&self, kind: TimeoutKind) -> u64 {
        match kind {
            TimeoutKind::Recv => self.recv_timeout_ms.load(Ordering::Acquire),
            TimeoutKind::Send => self.send_timeout_ms.load(Ordering::Acquire),
        }
    }

    pub fn set_timeout(&self, kind: TimeoutKind, ms: u64) {
        match kind {
            TimeoutKind::Recv => self.recv_timeout_ms.store(ms, Ordering::Release),
            TimeoutKind::Send => self.send_timeout_ms.store(ms, Ordering::Release),
        }
    }
}

/// Process-wide table of tracked fds
pub struct FdManager {
    fds: RwLock<Vec<Option<Arc<FdCtx>>>>,
}

impl FdManager {
    fn new() -> FdManager {
        let mut fds = Vec::new();
        fds.resize_with(64, || None);
        FdManager {
            fds: RwLock::new(fds),
        }
    }

    /// Look up the context for `fd`, creating it when `auto_create`
    pub fn get(&self, fd: RawFd, auto_create: bool) -> Option<Arc<FdCtx>> {
        if fd < 0 {
            return None;
        }
        let idx = fd as usize;
        {
            let fds = self.fds.read().unwrap_or_else(PoisonError::into_inner);
            match fds.get(idx) {
                Some(Some(ctx)) => return Some(Arc::clone(ctx)),
                Some(None) if !auto_create => return None,
                _ => {}
            }
        }
        if !auto_create {
            return None;
        }
        let mut fds = self.fds.write().unwrap_or_else(PoisonError::into_inner);
        if idx >= fds.len() {
            // x1.5 growth
            let want = (idx * 3 / 2).max(idx + 1);
            fds.resize_with(want, || None);
        }
        if let Some(ctx) = &fds[idx] {
            return Some(Arc::clone(ctx));
        }
        let ctx = Arc::new(FdCtx::new(fd));
        fds[idx] = Some(Arc::clone(&ctx));
        Some(ctx)
    }

    /// Forget `fd`; called when the fd is closed
    pub fn remove(&self, fd: RawFd) {
        if fd < 0 {
            return;
        }
        let mut fds = self.fds.write().unwrap_or_else(PoisonError::into_inner);
        if let Some(slot) = fds.get_mut(fd as usize) {
            if let Some(ctx) = slot.take() {
                ctx.mark_closed();
            }
        }
    }
}

/// The process-wide fd table
pub fn fd_manager() -> &'static FdManager {
    static MANAGER: OnceLock<FdManager> = OnceLock::new();
    MANAGER.get_or_init(FdManager::new)
}
