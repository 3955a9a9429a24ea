// src/server/poller.rs - Readiness multiplexer
//
// Thin wrapper over the kernel readiness facility:
// - Linux: epoll
// - macOS/FreeBSD: kqueue
//
// Level-triggered only: the event loop performs one bounded read or write
// per notification and relies on being woken again while a descriptor stays
// ready. EINTR is retried.

use std::io;
use std::os::unix::io::RawFd;
use std::time::Duration;

/// Event interest flags
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Interest {
    pub readable: bool,
    pub writable: bool,
}

impl Interest {
    pub const READABLE: Interest = Interest {
        readable: true,
        writable: false,
    };

    pub const WRITABLE: Interest = Interest {
        readable: false,
        writable: true,
    };
}

/// Readiness notification for one registered descriptor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Event {
    pub token: usize,
    pub readable: bool,
    pub writable: bool,
    pub error: bool,
    pub hangup: bool,
}

impl Event {
    pub fn is_readable(&self) -> bool {
        self.readable
    }

    pub fn is_writable(&self) -> bool {
        self.writable
    }

    pub fn is_error(&self) -> bool {
        self.error
    }

    pub fn is_hangup(&self) -> bool {
        self.hangup
    }
}

const MAX_EVENTS: usize = 256;

fn timeout_ms(timeout: Option<Duration>) -> i32 {
    match timeout {
        // round up so a sub-millisecond timeout does not become a busy poll
        Some(d) => d
            .as_nanos()
            .div_ceil(1_000_000)
            .min(i32::MAX as u128) as i32,
        None => -1,
    }
}

#[cfg(target_os = "linux")]
mod linux {
    use super::*;

    pub struct Poller {
        epfd: RawFd,
    }

    impl Poller {
        pub fn new() -> io::Result<Self> {
            // SAFETY: epoll_create1 takes no pointers; the result is checked below.
            let epfd = unsafe { libc::epoll_create1(libc::EPOLL_CLOEXEC) };
            if epfd < 0 {
                return Err(io::Error::last_os_error());
            }
            Ok(Poller { epfd })
        }

        pub fn register(&mut self, fd: RawFd, token: usize, interest: Interest) -> io::Result<()> {
            self.ctl(libc::EPOLL_CTL_ADD, fd, token, interest)
        }

        pub fn modify(&mut self, fd: RawFd, token: usize, interest: Interest) -> io::Result<()> {
            self.ctl(libc::EPOLL_CTL_MOD, fd, token, interest)
        }

        pub fn deregister(&mut self, fd: RawFd) -> io::Result<()> {
            // SAFETY: self.epfd is owned by self; a null event is accepted for
            // EPOLL_CTL_DEL since Linux 2.6.9.
            let ret = unsafe {
                libc::epoll_ctl(self.epfd, libc::EPOLL_CTL_DEL, fd, std::ptr::null_mut())
            };
            if ret < 0 {
                return Err(io::Error::last_os_error());
            }
            Ok(())
        }

        fn ctl(&mut self, op: i32, fd: RawFd, token: usize, interest: Interest) -> io::Result<()> {
            let mut event = libc::epoll_event {
                events: interest_to_epoll(interest),
                u64: token as u64,
            };

            // SAFETY: self.epfd is owned by self and `event` is a valid,
            // initialized epoll_event living on the stack for the call.
            let ret = unsafe { libc::epoll_ctl(self.epfd, op, fd, &mut event) };
            if ret < 0 {
                return Err(io::Error::last_os_error());
            }
            Ok(())
        }

        pub fn poll(&mut self, timeout: Option<Duration>) -> io::Result<Vec<Event>> {
            let timeout = timeout_ms(timeout);
            let mut events = [libc::epoll_event { events: 0, u64: 0 }; MAX_EVENTS];

            let ret = loop {
                // SAFETY: `events` is writable for MAX_EVENTS entries and
                // self.epfd is owned by self.
                let ret = unsafe {
                    libc::epoll_wait(self.epfd, events.as_mut_ptr(), MAX_EVENTS as i32, timeout)
                };
                if ret < 0 {
                    let err = io::Error::last_os_error();
                    if err.kind() == io::ErrorKind::Interrupted {
                        continue;
                    }
                    return Err(err);
                }
                break ret as usize;
            };

            Ok(events[..ret]
                .iter()
                .map(|ev| {
                    let bits = ev.events;
                    Event {
                        token: ev.u64 as usize,
                        readable: bits & libc::EPOLLIN as u32 != 0,
                        writable: bits & libc::EPOLLOUT as u32 != 0,
                        error: bits & libc::EPOLLERR as u32 != 0,
                        hangup: bits & libc::EPOLLHUP as u32 != 0,
                    }
                })
                .collect())
        }
    }

    impl Drop for Poller {
        fn drop(&mut self) {
            // SAFETY: epfd is owned exclusively by self and closed only here.
            unsafe { libc::close(self.epfd) };
        }
    }

    fn interest_to_epoll(interest: Interest) -> u32 {
        let mut events = 0;
        if interest.readable {
            events |= libc::EPOLLIN as u32;
        }
        if interest.writable {
            events |= libc::EPOLLOUT as u32;
        }
        events
    }
}

#[cfg(any(target_os = "macos", target_os = "freebsd"))]
mod bsd {
    use super::*;
    use std::collections::HashMap;

    pub struct Poller {
        kq: RawFd,
    }

    fn kevent(fd: RawFd, filter: i16, flags: u16, token: usize) -> libc::kevent {
        // SAFETY: kevent is plain old data; zero is a valid value for every
        // field, including the platform-specific extension slots.
        let mut ev: libc::kevent = unsafe { std::mem::zeroed() };
        ev.ident = fd as usize;
        ev.filter = filter;
        ev.flags = flags;
        ev.udata = token as *mut libc::c_void;
        ev
    }

    impl Poller {
        pub fn new() -> io::Result<Self> {
            // SAFETY: kqueue takes no arguments; the result is checked below.
            let kq = unsafe { libc::kqueue() };
            if kq < 0 {
                return Err(io::Error::last_os_error());
            }
            Ok(Poller { kq })
        }

        fn submit(&mut self, changes: &[libc::kevent]) -> io::Result<()> {
            // SAFETY: `changes` is a valid slice; no event list is requested.
            let ret = unsafe {
                libc::kevent(
                    self.kq,
                    changes.as_ptr(),
                    changes.len() as _,
                    std::ptr::null_mut(),
                    0,
                    std::ptr::null(),
                )
            };
            if ret < 0 {
                return Err(io::Error::last_os_error());
            }
            Ok(())
        }

        pub fn register(&mut self, fd: RawFd, token: usize, interest: Interest) -> io::Result<()> {
            let flags = libc::EV_ADD | libc::EV_ENABLE;
            let mut changes = Vec::with_capacity(2);
            if interest.readable {
                changes.push(kevent(fd, libc::EVFILT_READ, flags, token));
            }
            if interest.writable {
                changes.push(kevent(fd, libc::EVFILT_WRITE, flags, token));
            }
            if changes.is_empty() {
                return Ok(());
            }
            self.submit(&changes)
        }

        pub fn modify(&mut self, fd: RawFd, token: usize, interest: Interest) -> io::Result<()> {
            // Deleting a filter that was never added fails with ENOENT, so
            // removals are submitted one at a time and that error ignored.
            for (wanted, filter) in [
                (interest.readable, libc::EVFILT_READ),
                (interest.writable, libc::EVFILT_WRITE),
            ] {
                if !wanted {
                    if let Err(e) = self.submit(&[kevent(fd, filter, libc::EV_DELETE, 0)]) {
                        if e.raw_os_error() != Some(libc::ENOENT) {
                            return Err(e);
                        }
                    }
                }
            }
            self.register(fd, token, interest)
        }

        pub fn deregister(&mut self, fd: RawFd) -> io::Result<()> {
            for filter in [libc::EVFILT_READ, libc::EVFILT_WRITE] {
                if let Err(e) = self.submit(&[kevent(fd, filter, libc::EV_DELETE, 0)]) {
                    if e.raw_os_error() != Some(libc::ENOENT) {
                        return Err(e);
                    }
                }
            }
            Ok(())
        }

        pub fn poll(&mut self, timeout: Option<Duration>) -> io::Result<Vec<Event>> {
            let timespec = timeout.map(|d| libc::timespec {
                tv_sec: d.as_secs() as libc::time_t,
                tv_nsec: d.subsec_nanos() as _,
            });
            let timeout_ptr = timespec
                .as_ref()
                .map(|t| t as *const libc::timespec)
                .unwrap_or(std::ptr::null());

            // SAFETY: kevent is plain old data; the array is overwritten by the kernel.
            let mut events: [libc::kevent; MAX_EVENTS] = unsafe { std::mem::zeroed() };

            let ret = loop {
                // SAFETY: `events` is writable for MAX_EVENTS entries, the
                // timeout pointer is null or points at a live timespec.
                let ret = unsafe {
                    libc::kevent(
                        self.kq,
                        std::ptr::null(),
                        0,
                        events.as_mut_ptr(),
                        MAX_EVENTS as _,
                        timeout_ptr,
                    )
                };
                if ret < 0 {
                    let err = io::Error::last_os_error();
                    if err.kind() == io::ErrorKind::Interrupted {
                        continue;
                    }
                    return Err(err);
                }
                break ret as usize;
            };

            // kqueue reports one entry per filter; fold them per token.
            let mut folded: HashMap<usize, Event> = HashMap::new();
            for ev in &events[..ret] {
                let token = ev.udata as usize;
                let entry = folded.entry(token).or_insert(Event {
                    token,
                    readable: false,
                    writable: false,
                    error: false,
                    hangup: false,
                });
                match ev.filter {
                    libc::EVFILT_READ => entry.readable = true,
                    libc::EVFILT_WRITE => entry.writable = true,
                    _ => {}
                }
                entry.error |= ev.flags & libc::EV_ERROR != 0;
                entry.hangup |= ev.flags & libc::EV_EOF != 0;
            }
            Ok(folded.into_values().collect())
        }
    }

    impl Drop for Poller {
        fn drop(&mut self) {
            // SAFETY: kq is owned exclusively by self and closed only here.
            unsafe { libc::close(self.kq) };
        }
    }
}

#[cfg(target_os = "linux")]
pub use linux::Poller;

#[cfg(any(target_os = "macos", target_os = "freebsd"))]
pub use bsd::Poller;

#[cfg(not(any(target_os = "linux", target_os = "macos", target_os = "freebsd")))]
compile_error!("ev-server requires epoll (Linux) or kqueue (macOS/FreeBSD)");
