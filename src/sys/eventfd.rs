use nix::errno::Errno;
use nix::sys::eventfd::{self as nix_eventfd, EfdFlags};
use std::io;
use std::os::fd::{AsFd, BorrowedFd};

/// Non-blocking counter descriptor for cross-thread wake-ups
pub struct EventFd {
    inner: nix_eventfd::EventFd,
}

impl EventFd {
    pub fn new() -> io::Result<Self> {
        let inner = nix_eventfd::EventFd::from_flags(EfdFlags::EFD_CLOEXEC | EfdFlags::EFD_NONBLOCK)?;
        Ok(Self { inner })
    }

    /// Add `value` to the counter
    pub fn write(&self, value: u64) -> io::Result<()> {
        match self.inner.write(value) {
            Ok(_) => Ok(()),
            // counter saturated, the reader is already due a wake-up
            Err(Errno::EAGAIN) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// Take and reset the counter, 0 when nothing was pending
    pub fn read(&self) -> io::Result<u64> {
        match self.inner.read() {
            Ok(value) => Ok(value),
            Err(Errno::EAGAIN) => Ok(0),
            Err(e) => Err(e.into()),
        }
    }
}

impl AsFd for EventFd {
    fn as_fd(&self) -> BorrowedFd<'_> {
        self.inner.as_fd()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counter_accumulates() {
        let fd = EventFd::new().unwrap();
        assert_eq!(fd.read().unwrap(), 0);
        fd.write(1).unwrap();
        fd.write(2).unwrap();
        assert_eq!(fd.read().unwrap(), 3);
        assert_eq!(fd.read().unwrap(), 0);
    }
}
