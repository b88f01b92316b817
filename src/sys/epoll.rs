//! Readiness multiplexer used by the multi event thread

use nix::errno::Errno;
use nix::sys::epoll::{self as nix_epoll, EpollCreateFlags, EpollEvent, EpollTimeout};
use std::io;
use std::os::fd::AsFd;
use std::time::Duration;

pub use nix::sys::epoll::EpollFlags as Interest;

/// Data can be read
pub const READABLE: Interest = Interest::EPOLLIN;
/// Registered but never reported
pub const SILENT: Interest = Interest::empty();

/// One readiness notification
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Event {
    pub token: u64,
    pub events: Interest,
}

impl Event {
    pub fn is_readable(&self) -> bool {
        self.events.contains(Interest::EPOLLIN)
    }

    /// Peer hung up or the descriptor is in error
    pub fn is_hangup(&self) -> bool {
        self.events.intersects(Interest::EPOLLHUP | Interest::EPOLLERR)
    }
}

/// Reusable storage for `Epoll::wait`
pub struct Events {
    raw: Vec<EpollEvent>,
    len: usize,
}

impl Events {
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            raw: vec![EpollEvent::empty(); capacity.max(1)],
            len: 0,
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = Event> + '_ {
        self.raw[..self.len].iter().map(|e| Event {
            token: e.data(),
            events: e.events(),
        })
    }
}

/// Owned epoll instance
pub struct Epoll {
    inner: nix_epoll::Epoll,
}

impl Epoll {
    pub fn new() -> io::Result<Self> {
        let inner = nix_epoll::Epoll::new(EpollCreateFlags::EPOLL_CLOEXEC)?;
        Ok(Self { inner })
    }

    /// Register `fd`; a `SILENT` interest set keeps it registered but quiet
    pub fn add<F: AsFd>(&self, fd: F, interest: Interest, token: u64) -> io::Result<()> {
        self.inner.add(fd, EpollEvent::new(interest, token))?;
        Ok(())
    }

    pub fn modify<F: AsFd>(&self, fd: F, interest: Interest, token: u64) -> io::Result<()> {
        self.inner.modify(fd, &mut EpollEvent::new(interest, token))?;
        Ok(())
    }

    pub fn delete<F: AsFd>(&self, fd: F) -> io::Result<()> {
        self.inner.delete(fd)?;
        Ok(())
    }

    /// Block until at least one registered descriptor is ready.
    ///
    /// `None` waits forever. Interrupted waits are restarted.
    pub fn wait(&self, events: &mut Events, timeout: Option<Duration>) -> io::Result<usize> {
        let timeout = match timeout {
            Some(t) => EpollTimeout::try_from(t).unwrap_or(EpollTimeout::MAX),
            None => EpollTimeout::NONE,
        };
        loop {
            match self.inner.wait(&mut events.raw, timeout) {
                Ok(n) => {
                    events.len = n;
                    return Ok(n);
                }
                Err(Errno::EINTR) => continue,
                Err(e) => {
                    events.len = 0;
                    return Err(e.into());
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sys::EventFd;

    #[test]
    fn test_eventfd_wakes_epoll() {
        let epoll = Epoll::new().unwrap();
        let wake = EventFd::new().unwrap();
        epoll.add(&wake, READABLE, 7).unwrap();

        let mut events = Events::with_capacity(4);
        assert_eq!(epoll.wait(&mut events, Some(Duration::ZERO)).unwrap(), 0);

        wake.write(1).unwrap();
        assert_eq!(epoll.wait(&mut events, Some(Duration::from_millis(100))).unwrap(), 1);
        let ev = events.iter().next().unwrap();
        assert_eq!(ev.token, 7);
        assert!(ev.is_readable());
        assert!(!ev.is_hangup());

        epoll.modify(&wake, SILENT, 7).unwrap();
        assert_eq!(epoll.wait(&mut events, Some(Duration::ZERO)).unwrap(), 0);

        epoll.delete(&wake).unwrap();
        assert!(epoll.delete(&wake).is_err());
    }

    #[test]
    fn test_hangup_reported_for_closed_writer() {
        let epoll = Epoll::new().unwrap();
        let (rx, tx) = crate::sys::pipe().unwrap();
        epoll.add(&rx, READABLE, 3).unwrap();
        drop(tx);

        let mut events = Events::with_capacity(4);
        assert_eq!(epoll.wait(&mut events, Some(Duration::from_millis(100))).unwrap(), 1);
        assert!(events.iter().next().unwrap().is_hangup());
    }
}
