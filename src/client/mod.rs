//! PCM client
//!
//! One local application attached to a shared transport PCM through a
//! half-duplex data pipe and a control socket. All clients of a multi are
//! serviced from the multi's event thread; a capture client's pipe is also
//! written from the transport thread during fan-out.
//!
//! Playback data path:
//!
//! ```text
//!  app ──pipe──► buffer[..in_offset] ──deliver()──► MixBuffer @ out_offset
//! ```

pub mod control;
pub mod state;

pub use control::Command;
pub use state::{ClientState, Transition};

use parking_lot::Mutex;
use std::fs::File;
use std::io::{self, Read, Write};
use std::os::fd::OwnedFd;
use std::os::unix::net::UnixStream;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, trace, warn};

use crate::audio::{MixBuffer, SampleFormat};
use crate::constants::{CONTROL_BUFFER_LEN, DROP_DISCARD_BYTES};
use crate::error::ClientError;
use crate::multi::registry::ClientKey;
use crate::sys::{self, epoll, Epoll, OneShotTimer};
use crate::transport::PcmDirection;
use control::{REPLY_INVALID, REPLY_OK};

/// Shared handle; the mutex is the per-client lock
pub type ClientHandle = Arc<Mutex<Client>>;

/// Which of a client's descriptors an epoll event belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    Pcm = 0,
    Control = 1,
    Drain = 2,
}

/// Epoll token: generation in the high word, slot index and kind below
pub fn event_token(kind: EventKind, key: ClientKey) -> u64 {
    (key.generation() as u64) << 32 | ((key.index() as u64) & 0xFF_FFFF) << 8 | kind as u64
}

pub fn decode_token(token: u64) -> Option<(EventKind, ClientKey)> {
    let kind = match token & 0xFF {
        0 => EventKind::Pcm,
        1 => EventKind::Control,
        2 => EventKind::Drain,
        _ => return None,
    };
    let index = ((token >> 8) & 0xFF_FFFF) as u32;
    let generation = (token >> 32) as u32;
    Some((kind, ClientKey::from_parts(index, generation)))
}

/// Result of one non-blocking pipe read
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadOutcome {
    /// Bytes appended to the input buffer
    Data(usize),
    /// Nothing pending
    WouldBlock,
    /// Input buffer has no free space
    Full,
    /// Writer closed the pipe, or a fatal error
    Closed,
}

/// What a client may touch outside itself while its owner holds the locks
pub struct ClientContext<'a> {
    pub epoll: &'a Epoll,
    /// The multi's count of contributing clients
    pub active: &'a AtomicUsize,
    /// Playback mix, `None` for capture
    pub mix: Option<&'a mut MixBuffer>,
    /// Periods a playback client buffers before it joins the mix
    pub client_threshold: usize,
    pub drain_settle: Duration,
}

pub struct Client {
    id: usize,
    key: ClientKey,
    direction: PcmDirection,
    format: SampleFormat,
    frame_bytes: usize,
    pcm: Option<File>,
    control: Option<UnixStream>,
    drain_timer: Option<OneShotTimer>,
    state: ClientState,
    initialized: bool,
    /// Playback input, sized to the client threshold
    buffer: Vec<u8>,
    /// Next free byte in `buffer`
    in_offset: usize,
    /// Write cursor into the mix, negative while relative
    out_offset: i64,
    /// Unmixed frames seen on the previous drain check
    drain_avail: usize,
    drop_requested: bool,
    watching: bool,
    /// Pipe hung up while the input buffer was full; removed from epoll
    pcm_hangup: bool,
    /// Bytes owed to complete a frame cut by an overrun
    frame_debt: usize,
}

impl Client {
    /// Register a new client's descriptors with `epoll`.
    ///
    /// The client starts in `Init`; [`Client::init`] allocates its buffers
    /// once the multi knows the transport geometry.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        id: usize,
        key: ClientKey,
        direction: PcmDirection,
        format: SampleFormat,
        channels: u8,
        pcm: OwnedFd,
        control: OwnedFd,
        epoll: &Epoll,
    ) -> Result<Self, ClientError> {
        sys::set_nonblocking(&pcm).map_err(ClientError::Register)?;
        let control = UnixStream::from(control);
        control
            .set_nonblocking(true)
            .map_err(ClientError::Register)?;
        let pcm = File::from(pcm);

        let drain_timer = match direction {
            PcmDirection::Playback => Some(OneShotTimer::new().map_err(ClientError::Timer)?),
            PcmDirection::Capture => None,
        };

        epoll
            .add(&pcm, epoll::SILENT, event_token(EventKind::Pcm, key))
            .map_err(ClientError::Register)?;
        if let Err(e) = epoll.add(
            &control,
            epoll::READABLE,
            event_token(EventKind::Control, key),
        ) {
            let _ = epoll.delete(&pcm);
            return Err(ClientError::Register(e));
        }
        if let Some(timer) = &drain_timer {
            if let Err(e) = epoll.add(
                timer,
                epoll::READABLE,
                event_token(EventKind::Drain, key),
            ) {
                let _ = epoll.delete(&pcm);
                let _ = epoll.delete(&control);
                return Err(ClientError::Register(e));
            }
        }

        Ok(Self {
            id,
            key,
            direction,
            format,
            frame_bytes: format.bytes() * channels as usize,
            pcm: Some(pcm),
            control: Some(control),
            drain_timer,
            state: ClientState::Init,
            initialized: false,
            buffer: Vec::new(),
            in_offset: 0,
            out_offset: 0,
            drain_avail: usize::MAX,
            drop_requested: false,
            watching: false,
            pcm_hangup: false,
            frame_debt: 0,
        })
    }

    pub fn id(&self) -> usize {
        self.id
    }

    pub fn key(&self) -> ClientKey {
        self.key
    }

    pub fn state(&self) -> ClientState {
        self.state
    }

    pub fn is_initialized(&self) -> bool {
        self.initialized
    }

    /// Bytes read from the pipe but not yet mixed
    pub fn buffered_bytes(&self) -> usize {
        self.in_offset
    }

    /// Current mix write cursor
    pub fn cursor(&self) -> i64 {
        self.out_offset
    }

    pub fn drop_requested(&self) -> bool {
        self.drop_requested
    }

    pub fn clear_drop_request(&mut self) {
        self.drop_requested = false;
    }

    fn is_playback(&self) -> bool {
        self.direction == PcmDirection::Playback
    }

    /// Apply a state change and its side effects.
    ///
    /// Returns false, changing nothing, when the transition is not legal.
    fn set_state(&mut self, to: ClientState, ctx: &mut ClientContext<'_>) -> bool {
        debug_assert!(
            self.state != ClientState::Finished || to == ClientState::Finished,
            "client {} cannot leave FINISHED for {}",
            self.id,
            to
        );
        let Some(t) = self.state.transition(to, self.direction) else {
            return false;
        };

        if t.realign {
            if let Some(mix) = ctx.mix.as_deref() {
                self.out_offset = match self.initial_offset(mix, ctx.client_threshold) {
                    // -0 would read back as absolute, so anchor at the read cursor
                    0 => mix.mix_offset(),
                    ahead => -(ahead as i64),
                };
            }
        }
        if t.active_delta > 0 {
            ctx.active.fetch_add(t.active_delta as usize, Ordering::SeqCst);
        } else if t.active_delta < 0 {
            ctx.active.fetch_sub(-t.active_delta as usize, Ordering::SeqCst);
        }
        if to == ClientState::Idle {
            self.drain_avail = usize::MAX;
        }
        if to == ClientState::Running {
            self.drop_requested = false;
        }

        trace!("client {} {} -> {}", self.id, t.from, t.to);
        self.state = to;
        true
    }

    /// Distance ahead of the read cursor at which a client joining the mix
    /// places its first frame, so that its buffered input lines up with the
    /// delay currently reported to applications.
    fn initial_offset(&self, mix: &MixBuffer, client_threshold: usize) -> usize {
        let buffered = self.in_offset / self.frame_bytes;
        let reported = mix.delay(mix.end()) + client_threshold * mix.period();
        reported.saturating_sub(buffered)
    }

    /// Allocate buffers and enter the first active-capable state
    pub fn init(&mut self, period_bytes: usize, ctx: &mut ClientContext<'_>) -> Result<(), ClientError> {
        if self.initialized {
            return Ok(());
        }
        match self.direction {
            PcmDirection::Playback => {
                let size = ctx.client_threshold * period_bytes;
                let mut buffer = Vec::new();
                buffer
                    .try_reserve_exact(size)
                    .map_err(|_| ClientError::Allocation(size))?;
                buffer.resize(size, 0);
                self.buffer = buffer;
                self.in_offset = 0;
                self.set_state(ClientState::Idle, ctx);
                self.watch_pcm(true, ctx.epoll);
            }
            PcmDirection::Capture => {
                self.set_state(ClientState::Running, ctx);
            }
        }
        self.initialized = true;
        Ok(())
    }

    /// Re-initialize after the multi rebuilt its mix buffer.
    ///
    /// Cursors from the old timeline are meaningless on the new one, so
    /// contributing playback clients go back to pre-buffering.
    pub fn restart(&mut self, period_bytes: usize, ctx: &mut ClientContext<'_>) -> Result<(), ClientError> {
        if !self.initialized {
            return self.init(period_bytes, ctx);
        }
        if !self.is_playback() {
            return Ok(());
        }
        match self.state {
            ClientState::Running => {
                self.set_state(ClientState::Idle, ctx);
            }
            ClientState::Draining1 | ClientState::Draining2 => self.complete_drain(ctx),
            ClientState::Paused => {
                self.out_offset = ctx.mix.as_deref().map_or(0, |mix| mix.mix_offset());
            }
            _ => {}
        }
        let size = ctx.client_threshold * period_bytes;
        if self.buffer.len() != size {
            let mut buffer = Vec::new();
            buffer
                .try_reserve_exact(size)
                .map_err(|_| ClientError::Allocation(size))?;
            buffer.resize(size, 0);
            self.buffer = buffer;
        }
        self.in_offset = 0;
        self.watch_pcm(self.state != ClientState::Paused, ctx.epoll);
        Ok(())
    }

    fn watch_pcm(&mut self, enabled: bool, epoll: &Epoll) {
        if !self.is_playback() {
            return;
        }
        let Some(pcm) = self.pcm.as_ref() else {
            return;
        };
        let token = event_token(EventKind::Pcm, self.key);

        if self.pcm_hangup {
            if enabled && epoll.add(pcm, epoll::READABLE, token).is_ok() {
                self.pcm_hangup = false;
                self.watching = true;
            }
            return;
        }
        if self.watching == enabled {
            return;
        }
        let interest = if enabled { epoll::READABLE } else { epoll::SILENT };
        if let Err(e) = epoll.modify(pcm, interest, token) {
            warn!("client {} pcm watch update failed: {}", self.id, e);
            return;
        }
        self.watching = enabled;
    }

    /// A hung-up pipe is reported on every wait regardless of interest, so
    /// while there is no room to drain it, take it out of the set
    fn suspend_hungup_pcm(&mut self, epoll: &Epoll) {
        if let Some(pcm) = self.pcm.as_ref() {
            let _ = epoll.delete(pcm);
        }
        self.pcm_hangup = true;
        self.watching = false;
    }

    fn arm_drain_timer(&self, after: Option<Duration>) {
        let Some(timer) = self.drain_timer.as_ref() else {
            return;
        };
        let result = match after {
            Some(after) => timer.arm(after),
            None => timer.disarm(),
        };
        if let Err(e) = result {
            error!("client {} drain timer update failed: {}", self.id, e);
        }
    }

    fn close_pcm(&mut self, epoll: &Epoll) {
        if let Some(pcm) = self.pcm.take() {
            if !self.pcm_hangup {
                let _ = epoll.delete(&pcm);
            }
            self.watching = false;
            self.pcm_hangup = false;
        }
    }

    fn close_control(&mut self, epoll: &Epoll) {
        if let Some(control) = self.control.take() {
            let _ = epoll.delete(&control);
        }
    }

    fn finish(&mut self, ctx: &mut ClientContext<'_>) {
        self.close_pcm(ctx.epoll);
        self.set_state(ClientState::Finished, ctx);
    }

    /// Release every descriptor; the client is about to be dropped
    pub fn release(&mut self, ctx: &mut ClientContext<'_>) {
        if let Some(timer) = self.drain_timer.take() {
            let _ = ctx.epoll.delete(&timer);
        }
        self.close_pcm(ctx.epoll);
        self.close_control(ctx.epoll);
        self.set_state(ClientState::Finished, ctx);
    }

    fn reply(&mut self, message: &[u8]) {
        let Some(control) = self.control.as_mut() else {
            return;
        };
        if let Err(e) = control.write_all(message) {
            error!("client {} control response failed: {}", self.id, e);
        }
    }

    /// Read as much as fits into the input buffer without blocking
    pub fn read_from_pipe(&mut self) -> ReadOutcome {
        if self.in_offset == self.buffer.len() {
            return ReadOutcome::Full;
        }
        let Some(pcm) = self.pcm.as_mut() else {
            return ReadOutcome::Closed;
        };
        loop {
            match pcm.read(&mut self.buffer[self.in_offset..]) {
                Ok(0) => return ReadOutcome::Closed,
                Ok(n) => {
                    self.in_offset += n;
                    return ReadOutcome::Data(n);
                }
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return ReadOutcome::WouldBlock,
                Err(e) => {
                    debug!("client {} pcm read failed: {}", self.id, e);
                    return ReadOutcome::Closed;
                }
            }
        }
    }

    /// Write without blocking, returns bytes accepted before the pipe filled
    fn push(&mut self, data: &[u8]) -> io::Result<usize> {
        let Some(pcm) = self.pcm.as_mut() else {
            return Err(io::ErrorKind::BrokenPipe.into());
        };
        let mut written = 0;
        while written < data.len() {
            match pcm.write(&data[written..]) {
                Ok(0) => return Err(io::ErrorKind::WriteZero.into()),
                Ok(n) => written += n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) => return Err(e),
            }
        }
        Ok(written)
    }

    /// Fan-out path for capture clients.
    ///
    /// Never blocks: whatever does not fit in the pipe is dropped. A write
    /// error finishes the client. Returns the number of bytes dropped.
    pub fn write_to_pipe(&mut self, data: &[u8], ctx: &mut ClientContext<'_>) -> usize {
        if self.pcm.is_none() {
            return 0;
        }

        if self.frame_debt > 0 {
            let pad = vec![self.format.silence_byte(); self.frame_debt];
            match self.push(&pad) {
                Ok(n) => self.frame_debt -= n,
                Err(e) => {
                    debug!("client {} pcm write failed: {}", self.id, e);
                    self.finish(ctx);
                    return 0;
                }
            }
            if self.frame_debt > 0 {
                warn!("Dropping PCM frames: PCM overrun");
                return data.len();
            }
        }

        match self.push(data) {
            Ok(n) if n == data.len() => 0,
            Ok(n) => {
                warn!("Dropping PCM frames: PCM overrun");
                self.frame_debt = (self.frame_bytes - n % self.frame_bytes) % self.frame_bytes;
                data.len() - n
            }
            Err(e) => {
                debug!("client {} pcm write failed: {}", self.id, e);
                self.finish(ctx);
                0
            }
        }
    }

    /// Move buffered input into the mix.
    ///
    /// While draining this also pulls the pipe directly and decides when
    /// the client's audio has left the mix.
    pub fn deliver(&mut self, ctx: &mut ClientContext<'_>) {
        if !matches!(self.state, ClientState::Running | ClientState::Draining1) {
            return;
        }

        if self.state == ClientState::Draining1 {
            let outcome = self.read_from_pipe();
            if outcome == ReadOutcome::Closed {
                self.finish(ctx);
                return;
            }
            if self.in_offset == 0 && outcome == ReadOutcome::WouldBlock {
                let Some(mix) = ctx.mix.as_deref() else {
                    return;
                };
                let avail = mix.calc_avail(mix.mix_offset(), self.out_offset);
                if avail == 0 || avail > self.drain_avail {
                    self.set_state(ClientState::Draining2, ctx);
                    self.arm_drain_timer(Some(ctx.drain_settle));
                    return;
                }
                self.drain_avail = avail;
            }
        }

        if self.in_offset > 0 {
            let Some(mix) = ctx.mix.as_deref_mut() else {
                return;
            };
            let frames = mix.add(&mut self.out_offset, &self.buffer[..self.in_offset]);
            let bytes = frames * self.frame_bytes;
            if bytes > 0 {
                self.buffer.copy_within(bytes..self.in_offset, 0);
                self.in_offset -= bytes;
                if self.state == ClientState::Running {
                    self.watch_pcm(true, ctx.epoll);
                }
            }
        }
    }

    /// Dispatch one readiness event
    pub fn handle_event(&mut self, kind: EventKind, hangup: bool, ctx: &mut ClientContext<'_>) {
        match kind {
            EventKind::Pcm => {
                if self.is_playback() {
                    self.handle_playback_pcm(hangup, ctx);
                }
            }
            EventKind::Control => self.handle_control(ctx),
            EventKind::Drain => self.handle_drain(ctx),
        }
    }

    /// Peer hung up on one of the client's descriptors
    pub fn handle_close(&mut self, kind: EventKind, ctx: &mut ClientContext<'_>) {
        match kind {
            EventKind::Pcm => self.close_pcm(ctx.epoll),
            EventKind::Control => self.close_control(ctx.epoll),
            EventKind::Drain => {}
        }
        self.set_state(ClientState::Finished, ctx);
    }

    fn handle_playback_pcm(&mut self, hangup: bool, ctx: &mut ClientContext<'_>) {
        match self.read_from_pipe() {
            ReadOutcome::Closed => {
                self.finish(ctx);
                return;
            }
            ReadOutcome::Full if hangup => self.suspend_hungup_pcm(ctx.epoll),
            ReadOutcome::Full => self.watch_pcm(false, ctx.epoll),
            _ => {}
        }

        if self.state == ClientState::Idle && self.in_offset >= self.buffer.len() {
            self.set_state(ClientState::Running, ctx);
        }
    }

    fn handle_control(&mut self, ctx: &mut ClientContext<'_>) {
        let mut command = [0u8; CONTROL_BUFFER_LEN];
        let Some(control) = self.control.as_mut() else {
            return;
        };
        let len = loop {
            match control.read(&mut command) {
                Ok(n) => break n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return,
                Err(e) => {
                    debug!("client {} control read failed: {}", self.id, e);
                    break 0;
                }
            }
        };

        if len == 0 {
            self.close_control(ctx.epoll);
            self.set_state(ClientState::Finished, ctx);
            return;
        }

        if matches!(self.state, ClientState::Draining1 | ClientState::Draining2) {
            // the application did not wait for its drain to be acknowledged
            self.complete_drain(ctx);
        }

        match Command::parse(&command[..len]) {
            Some(Command::Drain) => self.begin_drain(ctx),
            Some(Command::Drop) => {
                self.drop_input(ctx);
                self.reply(REPLY_OK);
            }
            Some(Command::Pause) => {
                self.pause(ctx);
                self.reply(REPLY_OK);
            }
            Some(Command::Resume) => {
                self.resume(ctx);
                self.reply(REPLY_OK);
            }
            None => {
                warn!(
                    "Invalid PCM control command: {}",
                    String::from_utf8_lossy(&command[..len])
                );
                self.reply(REPLY_INVALID);
            }
        }
    }

    fn begin_drain(&mut self, ctx: &mut ClientContext<'_>) {
        debug!("DRAIN: client {}", self.id);
        if self.is_playback() && self.state == ClientState::Running {
            self.set_state(ClientState::Draining1, ctx);
            self.watch_pcm(false, ctx.epoll);
        } else {
            self.reply(REPLY_OK);
        }
    }

    fn drop_input(&mut self, ctx: &mut ClientContext<'_>) {
        debug!("DROP: client {}", self.id);
        if !self.is_playback() || self.state == ClientState::Init {
            return;
        }
        self.arm_drain_timer(None);
        if let Some(pcm) = self.pcm.as_ref() {
            let discarded = sys::discard_pending(pcm, DROP_DISCARD_BYTES);
            trace!("client {} discarded {} pending bytes", self.id, discarded);
        }
        self.in_offset = 0;
        self.set_state(ClientState::Idle, ctx);
        self.watch_pcm(true, ctx.epoll);
        self.drop_requested = true;
    }

    fn pause(&mut self, ctx: &mut ClientContext<'_>) {
        debug!("PAUSE: client {}", self.id);
        if !self.set_state(ClientState::Paused, ctx) {
            return;
        }
        self.watch_pcm(false, ctx.epoll);
        if let Some(mix) = ctx.mix.as_deref() {
            // -0 would read back as an absolute cursor
            self.out_offset = -(mix.delay(self.out_offset).max(1) as i64);
        }
    }

    fn resume(&mut self, ctx: &mut ClientContext<'_>) {
        debug!("RESUME: client {}", self.id);
        match self.state {
            ClientState::Idle if self.is_playback() => {
                self.watch_pcm(true, ctx.epoll);
                self.drop_requested = false;
            }
            ClientState::Idle => {
                self.set_state(ClientState::Running, ctx);
            }
            ClientState::Paused => {
                self.set_state(ClientState::Running, ctx);
                self.watch_pcm(true, ctx.epoll);
            }
            _ => {}
        }
    }

    fn handle_drain(&mut self, ctx: &mut ClientContext<'_>) {
        if let Some(timer) = self.drain_timer.as_ref() {
            let _ = timer.acknowledge();
        }
        if self.state == ClientState::Draining2 {
            self.complete_drain(ctx);
        }
    }

    fn complete_drain(&mut self, ctx: &mut ClientContext<'_>) {
        debug!("DRAIN COMPLETE: client {}", self.id);
        self.set_state(ClientState::Idle, ctx);
        self.arm_drain_timer(None);
        self.watch_pcm(true, ctx.epoll);
        self.in_offset = 0;
        self.reply(REPLY_OK);
    }

    /// The shared mix ran dry; a running client must pre-buffer again
    pub fn underrun(&mut self, ctx: &mut ClientContext<'_>) {
        if self.state == ClientState::Running && self.set_state(ClientState::Idle, ctx) {
            debug!("client {} underrun", self.id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sys::{pipe, Events};
    use std::os::unix::net::UnixStream;

    struct Harness {
        epoll: Epoll,
        active: AtomicUsize,
        mix: Option<MixBuffer>,
        app_pcm: File,
        app_control: UnixStream,
        client: Client,
    }

    const PERIOD: usize = 4;
    const FRAME: usize = 2;

    impl Harness {
        fn new(direction: PcmDirection) -> Self {
            let epoll = Epoll::new().unwrap();
            let (rx, tx) = pipe().unwrap();
            let (client_pcm, app_pcm) = match direction {
                PcmDirection::Playback => (rx, tx),
                PcmDirection::Capture => (tx, rx),
            };
            let (ours, theirs) = UnixStream::pair().unwrap();
            let key = ClientKey::from_parts(0, 0);
            let client = Client::new(
                1,
                key,
                direction,
                SampleFormat::S16Le,
                1,
                client_pcm,
                OwnedFd::from(ours),
                &epoll,
            )
            .unwrap();
            let mix = match direction {
                PcmDirection::Playback => {
                    Some(MixBuffer::with_threshold(SampleFormat::S16Le, 1, 16 * PERIOD, PERIOD, 4).unwrap())
                }
                PcmDirection::Capture => None,
            };
            theirs.set_nonblocking(true).unwrap();
            let mut h = Self {
                epoll,
                active: AtomicUsize::new(0),
                mix,
                app_pcm: File::from(app_pcm),
                app_control: theirs,
                client,
            };
            h.with_ctx(|c, ctx| c.init(PERIOD * FRAME, ctx).unwrap());
            h
        }

        fn with_ctx<R>(&mut self, f: impl FnOnce(&mut Client, &mut ClientContext<'_>) -> R) -> R {
            let mut ctx = ClientContext {
                epoll: &self.epoll,
                active: &self.active,
                mix: self.mix.as_mut(),
                client_threshold: 2,
                drain_settle: Duration::from_millis(10),
            };
            f(&mut self.client, &mut ctx)
        }

        fn active(&self) -> usize {
            self.active.load(Ordering::SeqCst)
        }

        fn command(&mut self, cmd: &[u8]) {
            self.app_control.write_all(cmd).unwrap();
            self.with_ctx(|c, ctx| c.handle_event(EventKind::Control, false, ctx));
        }

        fn reply(&mut self) -> Vec<u8> {
            let mut buf = [0u8; 16];
            match self.app_control.read(&mut buf) {
                Ok(n) => buf[..n].to_vec(),
                Err(_) => Vec::new(),
            }
        }

        fn feed(&mut self, frames: usize) {
            let data = vec![1u8; frames * FRAME];
            self.app_pcm.write_all(&data).unwrap();
            self.with_ctx(|c, ctx| c.handle_event(EventKind::Pcm, false, ctx));
        }
    }

    #[test]
    fn test_token_round_trip_rejects_wake() {
        let key = ClientKey::from_parts(5, 9);
        for kind in [EventKind::Pcm, EventKind::Control, EventKind::Drain] {
            assert_eq!(decode_token(event_token(kind, key)), Some((kind, key)));
        }
        assert_eq!(decode_token(u64::MAX), None);
    }

    #[test]
    fn test_playback_starts_after_threshold() {
        let mut h = Harness::new(PcmDirection::Playback);
        assert_eq!(h.client.state(), ClientState::Idle);

        h.feed(PERIOD);
        assert_eq!(h.client.state(), ClientState::Idle);
        h.feed(PERIOD);
        assert_eq!(h.client.state(), ClientState::Running);
        assert_eq!(h.active(), 1);
        // its buffered input already covers the reported delay
        assert_eq!(h.client.cursor(), h.mix.as_ref().unwrap().mix_offset());

        h.with_ctx(|c, ctx| c.deliver(ctx));
        assert_eq!(h.client.buffered_bytes(), 0);
        assert_eq!(h.mix.as_ref().unwrap().available(), 2 * PERIOD);
    }

    #[test]
    fn test_late_joiner_lines_up_with_reported_delay() {
        let mut h = Harness::new(PcmDirection::Playback);
        let mut cursor = 0i64;
        h.mix.as_mut().unwrap().add(&mut cursor, &[0u8; 3 * PERIOD * FRAME]);

        h.feed(2 * PERIOD);
        assert_eq!(h.client.state(), ClientState::Running);
        assert_eq!(h.client.cursor(), -(3 * PERIOD as i64));
    }

    #[test]
    fn test_drop_request_cleared_when_playing_again() {
        let mut h = Harness::new(PcmDirection::Playback);
        h.feed(2 * PERIOD);
        h.command(b"Drop");
        assert_eq!(h.reply(), b"OK");
        assert!(h.client.drop_requested());

        h.feed(2 * PERIOD);
        assert_eq!(h.client.state(), ClientState::Running);
        assert!(!h.client.drop_requested());
    }

    #[test]
    fn test_pause_twice_is_idempotent() {
        let mut h = Harness::new(PcmDirection::Playback);
        h.feed(2 * PERIOD);
        h.command(b"Pause");
        assert_eq!(h.reply(), b"OK");
        let cursor = h.client.cursor();
        h.command(b"Pause");
        assert_eq!(h.reply(), b"OK");
        assert_eq!(h.client.state(), ClientState::Paused);
        assert_eq!(h.client.cursor(), cursor);
        assert_eq!(h.active(), 1);

        h.command(b"Resume");
        assert_eq!(h.reply(), b"OK");
        assert_eq!(h.client.state(), ClientState::Running);
        assert_eq!(h.active(), 1);
    }

    #[test]
    fn test_drop_discards_pending_input() {
        let mut h = Harness::new(PcmDirection::Playback);
        h.feed(2 * PERIOD);
        h.app_pcm.write_all(&[7u8; 64]).unwrap();
        h.command(b"Drop");
        assert_eq!(h.reply(), b"OK");
        assert_eq!(h.client.state(), ClientState::Idle);
        assert!(h.client.drop_requested());
        assert_eq!(h.client.buffered_bytes(), 0);
        assert_eq!(h.active(), 0);
        assert_eq!(h.client.read_from_pipe(), ReadOutcome::WouldBlock);
    }

    #[test]
    fn test_unknown_command_keeps_client() {
        let mut h = Harness::new(PcmDirection::Playback);
        h.command(b"Rewind");
        assert_eq!(h.reply(), b"Invalid");
        assert_eq!(h.client.state(), ClientState::Idle);
    }

    #[test]
    fn test_drain_waits_for_mix_and_settle() {
        let mut h = Harness::new(PcmDirection::Playback);
        h.feed(2 * PERIOD);
        h.with_ctx(|c, ctx| c.deliver(ctx));
        h.command(b"Drain");
        assert_eq!(h.client.state(), ClientState::Draining1);
        assert_eq!(h.reply(), b"");

        let mut out = vec![0u8; PERIOD * FRAME];
        let mut rounds = 0;
        while h.client.state() == ClientState::Draining1 {
            h.with_ctx(|c, ctx| c.deliver(ctx));
            h.mix.as_mut().unwrap().read(&mut out, PERIOD, &[1.0]);
            rounds += 1;
            assert!(rounds < 20);
        }
        assert_eq!(h.client.state(), ClientState::Draining2);
        assert_eq!(h.active(), 0);
        assert!(h.mix.as_ref().unwrap().is_empty());

        let mut events = Events::with_capacity(4);
        let timer_token = event_token(EventKind::Drain, h.client.key());
        loop {
            h.epoll.wait(&mut events, Some(Duration::from_millis(200))).unwrap();
            if events.iter().any(|e| e.token == timer_token) {
                break;
            }
        }
        h.with_ctx(|c, ctx| c.handle_event(EventKind::Drain, false, ctx));
        assert_eq!(h.client.state(), ClientState::Idle);
        assert_eq!(h.reply(), b"OK");
    }

    #[test]
    fn test_control_eof_finishes() {
        let mut h = Harness::new(PcmDirection::Playback);
        h.feed(2 * PERIOD);
        assert_eq!(h.active(), 1);
        h.app_control.shutdown(std::net::Shutdown::Both).unwrap();
        h.with_ctx(|c, ctx| c.handle_event(EventKind::Control, false, ctx));
        assert_eq!(h.client.state(), ClientState::Finished);
        assert_eq!(h.active(), 0);
    }

    #[test]
    fn test_capture_overrun_drops_chunk() {
        let mut h = Harness::new(PcmDirection::Capture);
        assert_eq!(h.client.state(), ClientState::Running);
        assert_eq!(h.active(), 1);

        let chunk = vec![3u8; 4096];
        let mut dropped = 0;
        for _ in 0..64 {
            dropped += h.with_ctx(|c, ctx| c.write_to_pipe(&chunk, ctx));
        }
        assert!(dropped > 0);
        assert_eq!(h.client.state(), ClientState::Running);

        drop(h.app_pcm);
        let epoll = Epoll::new().unwrap();
        let active = AtomicUsize::new(1);
        let mut ctx = ClientContext {
            epoll: &epoll,
            active: &active,
            mix: None,
            client_threshold: 2,
            drain_settle: Duration::ZERO,
        };
        h.client.write_to_pipe(&chunk, &mut ctx);
        assert_eq!(h.client.state(), ClientState::Finished);
        assert_eq!(active.load(Ordering::SeqCst), 0);
    }
}
