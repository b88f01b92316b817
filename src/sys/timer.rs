use nix::errno::Errno;
use nix::sys::time::TimeSpec;
use nix::sys::timerfd::{ClockId, Expiration, TimerFd, TimerFlags, TimerSetTimeFlags};
use nix::unistd;
use std::io;
use std::os::fd::{AsFd, AsRawFd, BorrowedFd};
use std::time::Duration;

/// One-shot monotonic timer descriptor
pub struct OneShotTimer {
    inner: TimerFd,
}

impl OneShotTimer {
    pub fn new() -> io::Result<Self> {
        let inner = TimerFd::new(
            ClockId::CLOCK_MONOTONIC,
            TimerFlags::TFD_NONBLOCK | TimerFlags::TFD_CLOEXEC,
        )?;
        Ok(Self { inner })
    }

    /// Fire once after `after`; a zero duration is bumped to 1ns
    pub fn arm(&self, after: Duration) -> io::Result<()> {
        let after = TimeSpec::from_duration(after.max(Duration::from_nanos(1)));
        self.inner
            .set(Expiration::OneShot(after), TimerSetTimeFlags::empty())?;
        Ok(())
    }

    pub fn disarm(&self) -> io::Result<()> {
        self.inner.unset()?;
        Ok(())
    }

    /// Consume pending expirations, returns how many occurred
    pub fn acknowledge(&self) -> io::Result<u64> {
        let mut expirations = [0u8; 8];
        match unistd::read(self.inner.as_fd().as_raw_fd(), &mut expirations) {
            Ok(_) => Ok(u64::from_ne_bytes(expirations)),
            Err(Errno::EAGAIN) => Ok(0),
            Err(e) => Err(e.into()),
        }
    }
}

impl AsFd for OneShotTimer {
    fn as_fd(&self) -> BorrowedFd<'_> {
        self.inner.as_fd()
    }
}
