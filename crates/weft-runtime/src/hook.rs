//! Hooked blocking calls
//!
//! Fiber-aware replacements for the blocking POSIX calls. On a worker
//! thread with the hook flag set, a call that would block parks the
//! current fiber on the reactor instead of blocking the thread, and a
//! per-fd timeout turns into a timer racing the readiness event
//! through a shared [`CancelToken`].
//!
//! Every function returns the syscall result directly, with failures
//! as negative errno (`-ETIMEDOUT` for an expired per-fd timeout).
//!
//! Calls fall through to the raw syscall when any of these hold: the
//! hook flag is off, the fd is not a tracked socket, the user asked
//! for non-blocking mode themselves, or no reactor owns the thread.

use std::os::unix::io::RawFd;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Once};
use std::time::Duration;

use weft_core::{winfo, CancelToken, WeftError};

use crate::config;
use crate::fd_manager::{fd_manager, TimeoutKind, NO_TIMEOUT};
use crate::fiber::Fiber;
use crate::iomanager::{IoEvent, IoManager};
use crate::last_errno;
use crate::scheduler::{SchedulerExt, ANY_WORKER};
use crate::timer::Timer;
use crate::tls;

static CONNECT_TIMEOUT_MS: AtomicU64 = AtomicU64::new(config::DEFAULT_CONNECT_TIMEOUT_MS);
static INIT: Once = Once::new();

/// Flip the hook flag for the current thread. Worker threads turn it
/// on before entering their run loop.
pub fn set_enabled(v: bool) {
    if v {
        ensure_init();
    }
    tls::set_hook_enabled(v);
}

/// Whether calls on this thread are rerouted
pub fn is_enabled() -> bool {
    tls::hook_enabled()
}

/// Cache the connect timeout and keep it fresh across config updates
fn ensure_init() {
    INIT.call_once(|| {
        CONNECT_TIMEOUT_MS.store(config::config().connect_timeout_ms, Ordering::Release);
        config::on_change(|old, new| {
            if old.connect_timeout_ms != new.connect_timeout_ms {
                winfo!(
                    "connect timeout changed: {} -> {} ms",
                    old.connect_timeout_ms,
                    new.connect_timeout_ms
                );
                CONNECT_TIMEOUT_MS.store(new.connect_timeout_ms, Ordering::Release);
            }
        });
    });
}

#[inline]
fn raw_result(n: isize) -> isize {
    if n < 0 {
        -(last_errno() as isize)
    } else {
        n
    }
}

// ============================================================================
// Sleeping
// ============================================================================

/// Sleep without blocking the worker: parks the current fiber and
/// re-schedules it from a timer. Outside a hooked fiber this is a
/// plain thread sleep.
pub fn sleep_ms(ms: u64) {
    if !tls::hook_enabled() {
        std::thread::sleep(Duration::from_millis(ms));
        return;
    }
    let Some(iom) = IoManager::current() else {
        std::thread::sleep(Duration::from_millis(ms));
        return;
    };
    let fiber = Fiber::current();
    if fiber.is_main() {
        std::thread::sleep(Duration::from_millis(ms));
        return;
    }
    let weak_iom = Arc::downgrade(&iom);
    iom.timers().add_timer(
        ms,
        move || {
            if let Some(iom) = weak_iom.upgrade() {
                iom.schedule_fiber(Arc::clone(&fiber), ANY_WORKER);
            }
        },
        false,
    );
    Fiber::yield_hold();
}

pub fn sleep(seconds: u64) {
    sleep_ms(seconds * 1000);
}

pub fn sleep_us(us: u64) {
    // Timer resolution is a millisecond; round up
    sleep_ms(us.div_ceil(1000));
}

// ============================================================================
// I/O core
// ============================================================================

/// Arm the timeout timer racing a parked I/O wait
fn arm_io_timer(
    iom: &Arc<IoManager>,
    token: &Arc<CancelToken>,
    fd: RawFd,
    event: IoEvent,
    timeout_ms: u64,
) -> Option<Arc<Timer>> {
    if timeout_ms == NO_TIMEOUT {
        return None;
    }
    let weak_iom = Arc::downgrade(iom);
    let weak_token = Arc::downgrade(token);
    Some(iom.timers().add_condition_timer(
        timeout_ms,
        move || {
            let (Some(iom), Some(token)) = (weak_iom.upgrade(), weak_token.upgrade()) else {
                return;
            };
            if token.cancel(libc::ETIMEDOUT) {
                // Wakes the parked fiber; it reads the token
                iom.cancel_event(fd, event);
            }
        },
        Arc::downgrade(token),
        false,
    ))
}

/// Run `f` until it completes without blocking, parking the calling
/// fiber on `event` whenever the fd is not ready. `f` returns the raw
/// syscall result with errno in the thread's errno slot.
fn do_io<F>(fd: RawFd, event: IoEvent, kind: TimeoutKind, mut f: F) -> isize
where
    F: FnMut() -> isize,
{
    if !tls::hook_enabled() {
        return raw_result(f());
    }
    let Some(ctx) = fd_manager().get(fd, true) else {
        return raw_result(f());
    };
    if ctx.is_closed() {
        return -(libc::EBADF as isize);
    }
    if !ctx.is_socket() || ctx.user_nonblock() {
        return raw_result(f());
    }
    let Some(iom) = IoManager::current() else {
        return raw_result(f());
    };

    let timeout_ms = ctx.timeout(kind);
    loop {
        let n = f();
        if n >= 0 {
            return n;
        }
        let err = last_errno();
        if err == libc::EINTR {
            continue;
        }
        if err != libc::EAGAIN && err != libc::EWOULDBLOCK {
            return -(err as isize);
        }

        // Would block: race a readiness event against the timeout
        let token = Arc::new(CancelToken::new());
        let timer = arm_io_timer(&iom, &token, fd, event, timeout_ms);
        if let Err(e) = iom.add_event(fd, event, None) {
            if let Some(t) = &timer {
                t.cancel();
            }
            return match e {
                WeftError::PlatformError(code) => -(code as isize),
                WeftError::InvalidState(_) => -(libc::EINVAL as isize),
            };
        }
        Fiber::yield_hold();

        if let Some(t) = &timer {
            t.cancel();
        }
        if let Some(code) = token.code() {
            return -(code as isize);
        }
        // Readiness fired; retry the call
    }
}

// ============================================================================
// Hooked calls
// ============================================================================

pub fn read(fd: RawFd, buf: &mut [u8]) -> isize {
    do_io(fd, IoEvent::Read, TimeoutKind::Recv, || unsafe {
        libc::read(fd, buf.as_mut_ptr() as *mut libc::c_void, buf.len()) as isize
    })
}

pub fn write(fd: RawFd, buf: &[u8]) -> isize {
    do_io(fd, IoEvent::Write, TimeoutKind::Send, || unsafe {
        libc::write(fd, buf.as_ptr() as *const libc::c_void, buf.len()) as isize
    })
}

pub fn recv(fd: RawFd, buf: &mut [u8], flags: i32) -> isize {
    do_io(fd, IoEvent::Read, TimeoutKind::Recv, || unsafe {
        libc::recv(fd, buf.as_mut_ptr() as *mut libc::c_void, buf.len(), flags) as isize
    })
}

pub fn send(fd: RawFd, buf: &[u8], flags: i32) -> isize {
    do_io(fd, IoEvent::Write, TimeoutKind::Send, || unsafe {
        libc::send(fd, buf.as_ptr() as *const libc::c_void, buf.len(), flags) as isize
    })
}

/// Accept a connection, parking until one arrives. The accepted fd is
/// tracked (and a socket, so forced non-blocking).
pub fn accept(fd: RawFd) -> isize {
    let n = do_io(fd, IoEvent::Read, TimeoutKind::Recv, || unsafe {
        libc::accept(fd, std::ptr::null_mut(), std::ptr::null_mut()) as isize
    });
    if n >= 0 {
        fd_manager().get(n as RawFd, true);
    }
    n
}

/// Create a socket, tracking it when the hook is enabled
pub fn socket(domain: i32, ty: i32, protocol: i32) -> isize {
    let fd = unsafe { libc::socket(domain, ty, protocol) };
    if fd < 0 {
        return -(last_errno() as isize);
    }
    if tls::hook_enabled() {
        fd_manager().get(fd, true);
    }
    fd as isize
}

/// Connect with an explicit timeout in ms (`NO_TIMEOUT` for none).
///
/// # Safety
///
/// `addr` must point to a valid socket address of `addrlen` bytes.
pub unsafe fn connect_with_timeout(
    fd: RawFd,
    addr: *const libc::sockaddr,
    addrlen: libc::socklen_t,
    timeout_ms: u64,
) -> isize {
    let fall_through = || raw_result(libc::connect(fd, addr, addrlen) as isize);
    if !tls::hook_enabled() {
        return fall_through();
    }
    let Some(ctx) = fd_manager().get(fd, true) else {
        return fall_through();
    };
    if ctx.is_closed() {
        return -(libc::EBADF as isize);
    }
    if !ctx.is_socket() || ctx.user_nonblock() {
        return fall_through();
    }

    loop {
        let n = libc::connect(fd, addr, addrlen) as isize;
        if n == 0 {
            return 0;
        }
        let err = last_errno();
        if err == libc::EINTR {
            continue;
        }
        if err != libc::EINPROGRESS {
            return -(err as isize);
        }
        break;
    }

    let Some(iom) = IoManager::current() else {
        // Non-blocking connect already in flight; nothing to park on
        return -(libc::EINPROGRESS as isize);
    };

    let token = Arc::new(CancelToken::new());
    let timer = arm_io_timer(&iom, &token, fd, IoEvent::Write, timeout_ms);
    if let Err(e) = iom.add_event(fd, IoEvent::Write, None) {
        if let Some(t) = &timer {
            t.cancel();
        }
        return match e {
            WeftError::PlatformError(code) => -(code as isize),
            WeftError::InvalidState(_) => -(libc::EINVAL as isize),
        };
    }
    Fiber::yield_hold();

    if let Some(t) = &timer {
        t.cancel();
    }
    if let Some(code) = token.code() {
        return -(code as isize);
    }

    // Writable: ask the kernel how the handshake went
    let mut so_error: libc::c_int = 0;
    let mut len = std::mem::size_of::<libc::c_int>() as libc::socklen_t;
    if libc::getsockopt(
        fd,
        libc::SOL_SOCKET,
        libc::SO_ERROR,
        &mut so_error as *mut libc::c_int as *mut libc::c_void,
        &mut len,
    ) != 0
    {
        return -(last_errno() as isize);
    }
    if so_error != 0 {
        return -(so_error as isize);
    }
    0
}

/// Connect with the configured default timeout
///
/// # Safety
///
/// `addr` must point to a valid socket address of `addrlen` bytes.
pub unsafe fn connect(fd: RawFd, addr: *const libc::sockaddr, addrlen: libc::socklen_t) -> isize {
    ensure_init();
    connect_with_timeout(fd, addr, addrlen, CONNECT_TIMEOUT_MS.load(Ordering::Acquire))
}

/// Close an fd, first cancelling every waiter parked on it and
/// dropping its tracking entry
pub fn close(fd: RawFd) -> isize {
    if tls::hook_enabled() && fd_manager().get(fd, false).is_some() {
        if let Some(iom) = IoManager::current() {
            iom.cancel_all(fd);
        }
        fd_manager().remove(fd);
    }
    raw_result(unsafe { libc::close(fd) as isize })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::time::Instant;

    fn wait_for(pred: impl Fn() -> bool) {
        let deadline = Instant::now() + Duration::from_secs(5);
        while !pred() {
            assert!(Instant::now() < deadline, "timed out waiting for condition");
            std::thread::sleep(Duration::from_millis(1));
        }
    }

    fn socketpair() -> (RawFd, RawFd) {
        let mut fds = [0 as RawFd; 2];
        let rc = unsafe {
            libc::socketpair(libc::AF_UNIX, libc::SOCK_STREAM, 0, fds.as_mut_ptr())
        };
        assert_eq!(rc, 0);
        (fds[0], fds[1])
    }

    #[test]
    fn hooked_sleeps_overlap_on_one_worker() {
        let iom = IoManager::new(1, false, "sleep-test");
        let count = Arc::new(AtomicUsize::new(0));
        let start = Instant::now();
        for _ in 0..2 {
            let c = Arc::clone(&count);
            iom.schedule(move || {
                sleep_ms(200);
                c.fetch_add(1, Ordering::SeqCst);
            });
        }
        wait_for(|| count.load(Ordering::SeqCst) == 2);
        // Neither woke early, and both slept concurrently on the
        // single worker
        assert!(start.elapsed() >= Duration::from_millis(200));
        assert!(start.elapsed() < Duration::from_millis(390));
        iom.stop();
    }

    #[test]
    fn sleep_outside_fiber_blocks_the_thread() {
        let start = Instant::now();
        sleep_ms(10);
        assert!(start.elapsed() >= Duration::from_millis(10));
    }

    #[test]
    fn hooked_read_parks_until_data() {
        let iom = IoManager::new(1, false, "read-test");
        let (a, b) = socketpair();

        let got = Arc::new(AtomicUsize::new(0));
        let g = Arc::clone(&got);
        iom.schedule(move || {
            let mut buf = [0u8; 16];
            let n = read(a, &mut buf);
            assert_eq!(&buf[..4], b"ping");
            g.store(n.max(0) as usize, Ordering::SeqCst);
        });

        std::thread::sleep(Duration::from_millis(50));
        assert_eq!(got.load(Ordering::SeqCst), 0);
        let n = unsafe { libc::write(b, b"ping".as_ptr() as *const libc::c_void, 4) };
        assert_eq!(n, 4);

        wait_for(|| got.load(Ordering::SeqCst) == 4);
        iom.stop();
        unsafe {
            libc::close(a);
            libc::close(b);
        }
    }

    #[test]
    fn recv_honors_fd_timeout() {
        let iom = IoManager::new(1, false, "timeout-test");
        let (a, b) = socketpair();

        let result = Arc::new(AtomicUsize::new(0));
        let r = Arc::clone(&result);
        iom.schedule(move || {
            if let Some(ctx) = fd_manager().get(a, true) {
                ctx.set_timeout(TimeoutKind::Recv, 50);
            }
            let mut buf = [0u8; 16];
            let n = recv(a, &mut buf, 0);
            assert_eq!(n, -(libc::ETIMEDOUT as isize));
            r.store(1, Ordering::SeqCst);
        });

        let start = Instant::now();
        wait_for(|| result.load(Ordering::SeqCst) == 1);
        assert!(start.elapsed() >= Duration::from_millis(40));
        iom.stop();
        unsafe {
            libc::close(a);
            libc::close(b);
        }
    }

    #[test]
    fn non_socket_falls_through() {
        let iom = IoManager::new(1, false, "pipe-test");
        let mut fds = [0 as RawFd; 2];
        assert_eq!(unsafe { libc::pipe(fds.as_mut_ptr()) }, 0);
        let (rfd, wfd) = (fds[0], fds[1]);
        unsafe {
            libc::write(wfd, b"data".as_ptr() as *const libc::c_void, 4);
        }

        let got = Arc::new(AtomicUsize::new(0));
        let g = Arc::clone(&got);
        iom.schedule(move || {
            let mut buf = [0u8; 16];
            let n = read(rfd, &mut buf);
            g.store(n.max(0) as usize, Ordering::SeqCst);
        });

        wait_for(|| got.load(Ordering::SeqCst) == 4);
        iom.stop();
        unsafe {
            libc::close(rfd);
            libc::close(wfd);
        }
    }

    #[test]
    fn connect_to_dead_port_is_refused() {
        // Grab a port nobody is listening on
        let port = {
            let l = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
            l.local_addr().unwrap().port()
        };

        let iom = IoManager::new(1, false, "refused-test");
        let result = Arc::new(AtomicUsize::new(0));
        let r = Arc::clone(&result);
        iom.schedule(move || {
            let fd = socket(libc::AF_INET, libc::SOCK_STREAM, 0);
            assert!(fd >= 0);
            let fd = fd as RawFd;
            let addr = libc::sockaddr_in {
                sin_family: libc::AF_INET as libc::sa_family_t,
                sin_port: port.to_be(),
                sin_addr: libc::in_addr {
                    s_addr: u32::from_be_bytes([127, 0, 0, 1]).to_be(),
                },
                sin_zero: [0; 8],
            };
            let n = unsafe {
                connect(
                    fd,
                    &addr as *const libc::sockaddr_in as *const libc::sockaddr,
                    std::mem::size_of::<libc::sockaddr_in>() as libc::socklen_t,
                )
            };
            assert_eq!(n, -(libc::ECONNREFUSED as isize));
            close(fd);
            r.store(1, Ordering::SeqCst);
        });

        wait_for(|| result.load(Ordering::SeqCst) == 1);
        iom.stop();
    }

    #[test]
    fn connect_to_blackhole_times_out() {
        let iom = IoManager::new(1, false, "blackhole-test");
        let result = Arc::new(SpinSlot::new());
        let r = Arc::clone(&result);
        iom.schedule(move || {
            let fd = socket(libc::AF_INET, libc::SOCK_STREAM, 0) as RawFd;
            assert!(fd >= 0);
            // Non-routable test address
            let addr = libc::sockaddr_in {
                sin_family: libc::AF_INET as libc::sa_family_t,
                sin_port: 80u16.to_be(),
                sin_addr: libc::in_addr {
                    s_addr: u32::from_be_bytes([10, 255, 255, 1]).to_be(),
                },
                sin_zero: [0; 8],
            };
            let n = unsafe {
                connect_with_timeout(
                    fd,
                    &addr as *const libc::sockaddr_in as *const libc::sockaddr,
                    std::mem::size_of::<libc::sockaddr_in>() as libc::socklen_t,
                    100,
                )
            };
            close(fd);
            r.set(n);
        });

        wait_for(|| result.get().is_some());
        iom.stop();
        // Depending on the sandbox this is a timeout or an immediate
        // routing error; it can never succeed.
        assert!(result.get().unwrap() < 0);
    }

    struct SpinSlot {
        value: weft_core::SpinLock<Option<isize>>,
    }

    impl SpinSlot {
        fn new() -> SpinSlot {
            SpinSlot {
                value: weft_core::SpinLock::new(None),
            }
        }
        fn set(&self, v: isize) {
            *self.value.lock() = Some(v);
        }
        fn get(&self) -> Option<isize> {
            *self.value.lock()
        }
    }
}
