//! Thin wrappers over the Linux descriptors the event thread multiplexes

pub mod epoll;
pub mod eventfd;
pub mod pipe;
pub mod timer;

pub use epoll::{Epoll, Event, Events, Interest};
pub use eventfd::EventFd;
pub use pipe::{discard_pending, pipe, set_nonblocking, set_pipe_size};
pub use timer::OneShotTimer;
