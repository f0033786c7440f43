//! epoll reactor
//!
//! `IoManager` embeds a [`Scheduler`] and replaces its polling idle
//! loop with `epoll_wait`, so parked workers sleep until an fd turns
//! ready, a timer expires, or a self-pipe tickle arrives. Every fd is
//! registered edge-triggered; interest bits that fire are removed
//! from the registration before the waiter is woken, so a waiter runs
//! at most once per registration.
//!
//! One waiter per (fd, direction). Registering a second waiter for
//! the same direction before the first fired is a caller bug and
//! asserts.

use std::os::unix::io::RawFd;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, PoisonError, RwLock, Weak};

use weft_core::{wdebug, werror, SpinLock, WeftError, WeftResult};

use crate::fiber::Fiber;
use crate::last_errno;
use crate::scheduler::{Scheduler, SchedulerExt, Task, Work, ANY_WORKER};
use crate::timer::{TimerManager, TimerNotify};
use crate::tls;

/// Readiness direction
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IoEvent {
    Read,
    Write,
}

impl IoEvent {
    #[inline]
    fn mask(self) -> u32 {
        match self {
            IoEvent::Read => libc::EPOLLIN as u32,
            IoEvent::Write => libc::EPOLLOUT as u32,
        }
    }
}

/// What to wake when a direction turns ready: a parked fiber or a
/// callback. At most one of the two is set.
#[derive(Default)]
struct Waiter {
    fiber: Option<Arc<Fiber>>,
    cb: Option<Box<dyn FnOnce() + Send + 'static>>,
}

impl Waiter {
    fn clear(&mut self) {
        self.fiber = None;
        self.cb = None;
    }
}

struct FdInner {
    /// Interest bits currently registered with epoll
    events: u32,
    read: Waiter,
    write: Waiter,
}

struct FdContext {
    fd: RawFd,
    inner: SpinLock<FdInner>,
}

impl FdContext {
    fn new(fd: RawFd) -> Arc<FdContext> {
        Arc::new(FdContext {
            fd,
            inner: SpinLock::new(FdInner {
                events: 0,
                read: Waiter::default(),
                write: Waiter::default(),
            }),
        })
    }
}

/// Scheduler whose idle loop is an epoll wait
pub struct IoManager {
    sched: Scheduler,
    timers: Arc<TimerManager>,
    epfd: RawFd,
    /// Self-pipe; [read, write]
    tickle_fds: [RawFd; 2],
    contexts: RwLock<Vec<Arc<FdContext>>>,
    /// Registered (fd, direction) waiters not yet fired
    pending: AtomicUsize,
}

/// Longest single epoll wait, so shutdown and latch re-arming are
/// never starved
const MAX_TIMEOUT_MS: u64 = 3000;

const MAX_EVENTS: usize = 256;

impl IoManager {
    /// Build the reactor and start its workers.
    ///
    /// Aborts the process if epoll or the self-pipe cannot be set up;
    /// nothing works without them.
    pub fn new(threads: usize, use_caller: bool, name: &str) -> Arc<IoManager> {
        let epfd = unsafe { libc::epoll_create1(libc::EPOLL_CLOEXEC) };
        if epfd < 0 {
            werror!("epoll_create1 failed: errno={}", last_errno());
            std::process::abort();
        }

        let mut pipe_fds = [0 as RawFd; 2];
        if unsafe { libc::pipe(pipe_fds.as_mut_ptr()) } != 0 {
            werror!("tickle pipe failed: errno={}", last_errno());
            std::process::abort();
        }
        unsafe {
            let flags = libc::fcntl(pipe_fds[0], libc::F_GETFL, 0);
            libc::fcntl(pipe_fds[0], libc::F_SETFL, flags | libc::O_NONBLOCK);
        }

        let mut ev = libc::epoll_event {
            events: libc::EPOLLIN as u32 | libc::EPOLLET as u32,
            u64: pipe_fds[0] as u64,
        };
        if unsafe { libc::epoll_ctl(epfd, libc::EPOLL_CTL_ADD, pipe_fds[0], &mut ev) } != 0 {
            werror!("tickle pipe registration failed: errno={}", last_errno());
            std::process::abort();
        }

        let mut contexts = Vec::with_capacity(32);
        for fd in 0..32 {
            contexts.push(FdContext::new(fd as RawFd));
        }

        let iom = Arc::new(IoManager {
            sched: Scheduler::new(threads, use_caller, name),
            timers: Arc::new(TimerManager::new()),
            epfd,
            tickle_fds: pipe_fds,
            contexts: RwLock::new(contexts),
            pending: AtomicUsize::new(0),
        });
        iom.timers
            .set_notifier(Arc::downgrade(&iom) as Weak<dyn TimerNotify>);
        iom.start();
        iom
    }

    /// The reactor owning the current worker thread, if any
    pub fn current() -> Option<Arc<IoManager>> {
        tls::current_reactor().and_then(|w| w.upgrade())
    }

    /// Timers driven by this reactor's epoll loop
    pub fn timers(&self) -> &Arc<TimerManager> {
        &self.timers
    }

    /// Waiters registered and not yet fired
    pub fn pending_events(&self) -> usize {
        self.pending.load(Ordering::Acquire)
    }

    fn fd_context(&self, fd: RawFd) -> Arc<FdContext> {
        {
            let contexts = self.read_contexts();
            if let Some(ctx) = contexts.get(fd as usize) {
                return Arc::clone(ctx);
            }
        }
        let mut contexts = self
            .contexts
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        // x1.5 growth, racing growers settle on the larger size
        let want = ((fd as usize) * 3 / 2).max(fd as usize + 1);
        for next in contexts.len()..want {
            contexts.push(FdContext::new(next as RawFd));
        }
        Arc::clone(&contexts[fd as usize])
    }

    fn read_contexts(&self) -> std::sync::RwLockReadGuard<'_, Vec<Arc<FdContext>>> {
        self.contexts.read().unwrap_or_else(PoisonError::into_inner)
    }

    /// Register interest in `event` on `fd`. Wakes `cb` when it
    /// fires, or parks and later reschedules the current fiber when
    /// `cb` is `None`.
    ///
    /// Panics if a waiter for the same (fd, direction) is already
    /// registered.
    pub fn add_event(
        &self,
        fd: RawFd,
        event: IoEvent,
        cb: Option<Box<dyn FnOnce() + Send + 'static>>,
    ) -> WeftResult<()> {
        if fd < 0 {
            return Err(WeftError::InvalidState("add_event on negative fd"));
        }
        let ctx = self.fd_context(fd);
        let mut inner = ctx.inner.lock();
        assert!(
            inner.events & event.mask() == 0,
            "fd {} already has a {:?} waiter",
            fd,
            event
        );

        let op = if inner.events != 0 {
            libc::EPOLL_CTL_MOD
        } else {
            libc::EPOLL_CTL_ADD
        };
        let new_events = inner.events | event.mask();
        let mut ev = libc::epoll_event {
            events: libc::EPOLLET as u32 | new_events,
            u64: fd as u64,
        };
        if unsafe { libc::epoll_ctl(self.epfd, op, fd, &mut ev) } != 0 {
            let errno = last_errno();
            werror!("epoll_ctl add fd={} event={:?} failed: errno={}", fd, event, errno);
            return Err(WeftError::PlatformError(errno));
        }

        inner.events = new_events;
        self.pending.fetch_add(1, Ordering::AcqRel);

        let waiter = match event {
            IoEvent::Read => &mut inner.read,
            IoEvent::Write => &mut inner.write,
        };
        match cb {
            Some(cb) => waiter.cb = Some(cb),
            None => {
                let cur = Fiber::current();
                assert!(
                    cur.state() == weft_core::FiberState::Executing,
                    "add_event without callback outside a running fiber"
                );
                waiter.fiber = Some(cur);
            }
        }
        Ok(())
    }

    /// Remove interest in `event` on `fd`, discarding its waiter.
    /// Returns false if no such interest was registered.
    pub fn del_event(&self, fd: RawFd, event: IoEvent) -> bool {
        let Some(ctx) = self.read_contexts().get(fd as usize).map(Arc::clone) else {
            return false;
        };
        let mut inner = ctx.inner.lock();
        if inner.events & event.mask() == 0 {
            return false;
        }
        let remaining = inner.events & !event.mask();
        if !self.reregister(fd, &mut inner, remaining) {
            return false;
        }
        self.pending.fetch_sub(1, Ordering::AcqRel);
        match event {
            IoEvent::Read => inner.read.clear(),
            IoEvent::Write => inner.write.clear(),
        }
        true
    }

    /// Remove interest in `event` on `fd`, waking its waiter as if
    /// the event had fired. Returns false if no such interest was
    /// registered.
    pub fn cancel_event(&self, fd: RawFd, event: IoEvent) -> bool {
        let Some(ctx) = self.read_contexts().get(fd as usize).map(Arc::clone) else {
            return false;
        };
        let mut inner = ctx.inner.lock();
        if inner.events & event.mask() == 0 {
            return false;
        }
        let remaining = inner.events & !event.mask();
        if !self.reregister(fd, &mut inner, remaining) {
            return false;
        }
        self.trigger(&mut inner, event);
        true
    }

    /// Remove all interest on `fd`, waking every waiter. Returns
    /// false if nothing was registered.
    pub fn cancel_all(&self, fd: RawFd) -> bool {
        let Some(ctx) = self.read_contexts().get(fd as usize).map(Arc::clone) else {
            return false;
        };
        let mut inner = ctx.inner.lock();
        if inner.events == 0 {
            return false;
        }
        let had = inner.events;
        if !self.reregister(fd, &mut inner, 0) {
            return false;
        }
        if had & IoEvent::Read.mask() != 0 {
            self.trigger(&mut inner, IoEvent::Read);
        }
        if had & IoEvent::Write.mask() != 0 {
            self.trigger(&mut inner, IoEvent::Write);
        }
        true
    }

    /// Swap the epoll registration of `fd` to `new_events` (DEL when
    /// zero). Logs and returns false on failure.
    fn reregister(&self, fd: RawFd, inner: &mut FdInner, new_events: u32) -> bool {
        let op = if new_events != 0 {
            libc::EPOLL_CTL_MOD
        } else {
            libc::EPOLL_CTL_DEL
        };
        let mut ev = libc::epoll_event {
            events: libc::EPOLLET as u32 | new_events,
            u64: fd as u64,
        };
        if unsafe { libc::epoll_ctl(self.epfd, op, fd, &mut ev) } != 0 {
            werror!("epoll_ctl mod fd={} failed: errno={}", fd, last_errno());
            return false;
        }
        inner.events = new_events;
        true
    }

    /// Hand a fired waiter to the run queue
    fn trigger(&self, inner: &mut FdInner, event: IoEvent) {
        let waiter = match event {
            IoEvent::Read => &mut inner.read,
            IoEvent::Write => &mut inner.write,
        };
        let task = if let Some(cb) = waiter.cb.take() {
            Some(Work::Call(cb))
        } else {
            waiter.fiber.take().map(Work::Fiber)
        };
        self.pending.fetch_sub(1, Ordering::AcqRel);
        if let Some(work) = task {
            let was_empty = self.sched.enqueue(Task {
                work,
                thread: ANY_WORKER,
            });
            if was_empty {
                self.tickle();
            }
        }
    }

    /// Next timer deadline plus the shutdown verdict, computed under
    /// one timer read
    fn next_timeout_and_stopping(&self) -> (Option<u64>, bool) {
        let next = self.timers.get_next_timeout();
        let stop = next.is_none()
            && self.pending.load(Ordering::Acquire) == 0
            && self.core().base_stopping();
        (next, stop)
    }

    fn drain_tickle_pipe(&self) {
        let mut buf = [0u8; 256];
        loop {
            let n = unsafe {
                libc::read(self.tickle_fds[0], buf.as_mut_ptr() as *mut libc::c_void, buf.len())
            };
            if n <= 0 {
                break;
            }
        }
    }
}

impl SchedulerExt for IoManager {
    fn core(&self) -> &Scheduler {
        &self.sched
    }

    /// Wake one epoll-parked worker through the self-pipe. Skipped
    /// when no worker is parked: they re-check the queue on their own.
    fn tickle(&self) {
        if self.core().idle_count() == 0 {
            return;
        }
        let n = unsafe {
            libc::write(self.tickle_fds[1], b"T".as_ptr() as *const libc::c_void, 1)
        };
        if n != 1 {
            werror!("tickle write failed: errno={}", last_errno());
        }
    }

    fn stopping(&self) -> bool {
        self.next_timeout_and_stopping().1
    }

    fn bind_thread(self: &Arc<Self>) {
        tls::set_current_reactor(Some(Arc::downgrade(self)));
    }

    /// Park in epoll until an fd fires, a timer is due, or a tickle
    /// arrives; dispatch, then yield back to the run loop.
    fn idle(&self) {
        wdebug!("reactor {}: idle loop up", self.core().name());
        let mut events = vec![libc::epoll_event { events: 0, u64: 0 }; MAX_EVENTS];

        loop {
            let (next, stop) = self.next_timeout_and_stopping();
            if stop {
                wdebug!("reactor {}: idle loop down", self.core().name());
                break;
            }
            let timeout = next.unwrap_or(MAX_TIMEOUT_MS).min(MAX_TIMEOUT_MS);

            let rc = loop {
                let rc = unsafe {
                    libc::epoll_wait(
                        self.epfd,
                        events.as_mut_ptr(),
                        MAX_EVENTS as i32,
                        timeout as i32,
                    )
                };
                if rc < 0 && last_errno() == libc::EINTR {
                    continue;
                }
                break rc;
            };
            if rc < 0 {
                werror!("epoll_wait failed: errno={}", last_errno());
            }

            let expired = self.timers.collect_expired();
            if !expired.is_empty() {
                let tasks = expired
                    .into_iter()
                    .map(|cb| Task {
                        work: Work::Call(Box::new(move || cb())),
                        thread: ANY_WORKER,
                    })
                    .collect();
                if self.sched.enqueue_all(tasks) {
                    self.tickle();
                }
            }

            for ev in &events[..rc.max(0) as usize] {
                let key = ev.u64;
                let raw = ev.events;
                if key == self.tickle_fds[0] as u64 {
                    self.drain_tickle_pipe();
                    continue;
                }
                let fd = key as RawFd;
                let Some(ctx) = self.read_contexts().get(fd as usize).map(Arc::clone) else {
                    continue;
                };
                let mut inner = ctx.inner.lock();

                // Error and hangup wake every registered direction
                let mut real = raw;
                if real & (libc::EPOLLERR as u32 | libc::EPOLLHUP as u32) != 0 {
                    real |= (libc::EPOLLIN as u32 | libc::EPOLLOUT as u32) & inner.events;
                }
                let fired = real & inner.events;
                if fired == 0 {
                    continue;
                }

                // Fired interest leaves the registration before any
                // waiter runs
                let remaining = inner.events & !fired;
                if !self.reregister(ctx.fd, &mut inner, remaining) {
                    continue;
                }
                if fired & IoEvent::Read.mask() != 0 {
                    self.trigger(&mut inner, IoEvent::Read);
                }
                if fired & IoEvent::Write.mask() != 0 {
                    self.trigger(&mut inner, IoEvent::Write);
                }
            }

            Fiber::yield_hold();
        }
    }
}

impl TimerNotify for IoManager {
    fn on_timer_inserted_at_front(&self) {
        self.tickle();
    }
}

impl Drop for IoManager {
    // Workers hold strong references; by the time this runs they have
    // all exited and nobody is polling these fds.
    fn drop(&mut self) {
        unsafe {
            libc::close(self.epfd);
            libc::close(self.tickle_fds[0]);
            libc::close(self.tickle_fds[1]);
        }
    }
}
