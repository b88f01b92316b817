use nix::fcntl::{fcntl, splice, FcntlArg, OFlag, SpliceFFlags};
use nix::unistd;
use std::fs::OpenOptions;
use std::io;
use std::os::fd::{AsFd, AsRawFd, OwnedFd};

/// Create a close-on-exec pipe, returns `(read_end, write_end)`
pub fn pipe() -> io::Result<(OwnedFd, OwnedFd)> {
    Ok(unistd::pipe2(OFlag::O_CLOEXEC)?)
}

pub fn set_nonblocking<F: AsFd>(fd: F) -> io::Result<()> {
    let fd = fd.as_fd().as_raw_fd();
    let flags = OFlag::from_bits_truncate(fcntl(fd, FcntlArg::F_GETFL)?);
    if flags.contains(OFlag::O_NONBLOCK) {
        return Ok(());
    }
    fcntl(fd, FcntlArg::F_SETFL(flags | OFlag::O_NONBLOCK))?;
    Ok(())
}

/// Resize a pipe buffer, returns the size the kernel actually granted
pub fn set_pipe_size<F: AsFd>(fd: F, bytes: usize) -> io::Result<usize> {
    let size = i32::try_from(bytes).unwrap_or(i32::MAX);
    let granted = fcntl(fd.as_fd().as_raw_fd(), FcntlArg::F_SETPIPE_SZ(size))?;
    Ok(granted as usize)
}

/// Throw away up to `max` bytes pending on a pipe without blocking.
///
/// Best effort: returns the number of bytes discarded, 0 when nothing was
/// pending or the descriptor does not support splicing.
pub fn discard_pending<F: AsFd>(fd: F, max: usize) -> usize {
    let sink = match OpenOptions::new().write(true).open("/dev/null") {
        Ok(f) => f,
        Err(_) => return 0,
    };
    splice(fd, None, &sink, None, max, SpliceFFlags::SPLICE_F_NONBLOCK).unwrap_or(0)
}
