//! Multi-client orchestrator
//!
//! One `Multi` serves one transport PCM. It owns the client set, the mix
//! buffer (playback only) and an event thread:
//!
//! - playback: the mix thread ([`mix`]) moves client input into the mix
//!   buffer and hands one mixed block per period to the transport's
//!   [`Multi::read`] through a request/ready rendezvous;
//! - capture: the snoop thread ([`snoop`]) only tracks client lifecycle,
//!   the transport pushes decoded audio through [`Multi::write`].
//!
//! Lock order is `mix` → `clients` → per-client.

mod mix;
pub mod registry;
mod snoop;

pub use registry::{ClientKey, Registry};

use parking_lot::{Condvar, Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::os::fd::OwnedFd;
use std::sync::atomic::{AtomicU64, AtomicU8, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use tracing::{debug, error, info};

use crate::audio::{mix_scales, MixBuffer, PcmParams};
use crate::client::{Client, ClientContext, ClientHandle, ClientState};
use crate::config::MultiConfig;
use crate::constants::POISON;
use crate::error::{MixError, MultiError, Result};
use crate::sys::{epoll, Epoll, EventFd};
use crate::transport::{PcmDirection, TransportPcm, TransportSignal};

/// Token of the internal wake descriptor
const WAKE_TOKEN: u64 = u64::MAX;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
#[repr(u8)]
pub enum MultiState {
    /// Pre-buffering, or waiting for client activity
    Init = 0,
    /// Serving the transport
    Running = 1,
    /// Capture only: no active client, transport paused
    Paused = 2,
    /// No clients left, transport released
    Finished = 3,
}

impl MultiState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => MultiState::Init,
            1 => MultiState::Running,
            2 => MultiState::Paused,
            _ => MultiState::Finished,
        }
    }
}

/// Outcome of a transport read
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PcmRead {
    /// Mixed frames copied out
    Frames(usize),
    /// Every client has gone, the transport should stop
    Finished,
    /// Nothing to play yet, try again later
    Again,
}

/// Point-in-time view of a multi, for logging and diagnostics
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MultiStats {
    pub direction: PcmDirection,
    pub state: MultiState,
    pub clients: usize,
    pub active: usize,
    /// Mixed frames waiting for the transport
    pub buffered_frames: usize,
    pub frames_mixed: u64,
    /// Frames dropped because a capture client's pipe was full
    pub frames_dropped: u64,
    /// Frames lost by playback clients lagging more than one buffer
    pub late_frames: u64,
    pub underruns: u64,
    /// Reported delay in 1/10 ms
    pub delay: u32,
}

#[derive(Default)]
struct Counters {
    frames_mixed: AtomicU64,
    frames_dropped: AtomicU64,
    underruns: AtomicU64,
}

/// Transport geometry captured by `init`
#[derive(Debug, Clone, Copy)]
struct Geometry {
    params: PcmParams,
    period_frames: usize,
    period_bytes: usize,
}

/// State guarded by the buffer mutex
struct MixState {
    buffer: Option<MixBuffer>,
    /// A mix pass completed since the last transport read
    ready: bool,
    /// A mix pass has been requested and not yet run
    requested: bool,
}

/// State shared between the owner, the transport thread and the event thread
struct Shared {
    transport: Arc<dyn TransportPcm>,
    direction: PcmDirection,
    config: MultiConfig,
    epoll: Epoll,
    wake: EventFd,
    clients: Mutex<Registry<ClientHandle>>,
    mix: Mutex<MixState>,
    ready: Condvar,
    state: AtomicU8,
    active_count: AtomicUsize,
    geometry: RwLock<Geometry>,
    /// "Mixed data available" notification polled by the transport thread
    pcm_event: Mutex<Option<Arc<EventFd>>>,
    next_id: AtomicUsize,
    counters: Counters,
}

/// Multi-client support for one transport PCM
pub struct Multi {
    shared: Arc<Shared>,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl Multi {
    /// Policy check: does multi-client support apply to this transport PCM?
    ///
    /// Playback is mixed unless an A2DP stream uses packed 24-bit samples;
    /// capture is snooped. Each is subject to its configuration switch.
    pub fn enabled(transport: &dyn TransportPcm, config: &MultiConfig) -> bool {
        match transport.direction() {
            PcmDirection::Playback => {
                config.mix_enabled && (!transport.is_a2dp() || transport.params().format.is_mixable())
            }
            PcmDirection::Capture => config.snoop_enabled,
        }
    }

    /// Create multi-client support for `transport`.
    ///
    /// No thread is started and no buffer allocated until the first client
    /// arrives and [`Multi::init`] is called.
    pub fn create(transport: Arc<dyn TransportPcm>, config: MultiConfig) -> Result<Self> {
        config.validate()?;
        let epoll = Epoll::new().map_err(MultiError::EventLoop)?;
        let wake = EventFd::new().map_err(MultiError::EventLoop)?;
        epoll
            .add(&wake, epoll::READABLE, WAKE_TOKEN)
            .map_err(MultiError::EventLoop)?;

        let params = transport.params();
        let shared = Shared {
            direction: transport.direction(),
            transport,
            config,
            epoll,
            wake,
            clients: Mutex::new(Registry::new()),
            mix: Mutex::new(MixState {
                buffer: None,
                ready: false,
                requested: false,
            }),
            ready: Condvar::new(),
            state: AtomicU8::new(MultiState::Init as u8),
            active_count: AtomicUsize::new(0),
            geometry: RwLock::new(Geometry {
                params,
                period_frames: 0,
                period_bytes: 0,
            }),
            pcm_event: Mutex::new(None),
            next_id: AtomicUsize::new(0),
            counters: Counters::default(),
        };

        Ok(Self {
            shared: Arc::new(shared),
            thread: Mutex::new(None),
        })
    }

    /// Size the engine for the transport's current format and enable client
    /// audio. Clients attached earlier are initialized now; one that fails
    /// is removed without affecting the others.
    pub fn init(&self) -> Result<()> {
        debug!("Initializing multi client support");
        let shared = &self.shared;
        let params = shared.transport.params();
        let period_frames = params.frames_for_ms(shared.config.period_ms);
        if period_frames == 0 {
            return Err(MixError::InvalidGeometry(format!(
                "{} ms period at {} Hz",
                shared.config.period_ms, params.rate
            ))
            .into());
        }
        let period_bytes = period_frames * params.frame_bytes();

        shared.set_state(MultiState::Init);
        if shared.direction == PcmDirection::Playback {
            let buffer = MixBuffer::with_threshold(
                params.format,
                params.channels,
                shared.config.buffer_periods * period_frames,
                period_frames,
                shared.config.mix_threshold_periods,
            )?;
            let mut mix = shared.mix.lock();
            if let Some(mut old) = mix.buffer.replace(buffer) {
                old.release();
            }
            mix.ready = false;
            mix.requested = false;
        }
        *shared.geometry.write() = Geometry {
            params,
            period_frames,
            period_bytes,
        };

        shared.init_clients(period_bytes);

        if shared.direction == PcmDirection::Capture && self.client_count() > 0 {
            self.ensure_thread()?;
        }
        Ok(())
    }

    /// Stop serving the transport.
    ///
    /// Transports driven by the remote device keep their clients and
    /// thread; any other transport is fully torn down.
    pub fn reset(&self) {
        if !self.shared.transport.is_target() {
            self.cleanup();
        }
        self.shared.set_state(MultiState::Init);
    }

    fn cleanup(&self) {
        self.stop_thread();
        let shared = &self.shared;
        let mut mix = shared.mix.lock();
        {
            let mut clients = shared.clients.lock();
            for handle in clients.drain() {
                let mut client = handle.lock();
                let mut ctx = shared.context(mix.buffer.as_mut());
                client.release(&mut ctx);
            }
        }
        if let Some(mut buffer) = mix.buffer.take() {
            buffer.release();
        }
        mix.ready = false;
        mix.requested = false;
        drop(mix);

        let mut geometry = shared.geometry.write();
        geometry.period_frames = 0;
        geometry.period_bytes = 0;
    }

    fn stop_thread(&self) {
        let Some(handle) = self.thread.lock().take() else {
            return;
        };
        if let Err(e) = self.shared.wake.write(POISON) {
            error!("Unable to stop multi thread: {}", e);
            return;
        }
        if handle.join().is_err() {
            error!("Multi thread panicked");
        }
    }

    fn ensure_thread(&self) -> Result<()> {
        let mut thread = self.thread.lock();
        if let Some(handle) = thread.as_ref() {
            if !handle.is_finished() {
                return Ok(());
            }
        }
        if let Some(handle) = thread.take() {
            let _ = handle.join();
        }
        // a stop request the previous thread never read
        let pending = self.shared.wake.read()? % POISON;
        if pending > 0 {
            self.shared.wake.write(pending)?;
        }

        let shared = Arc::clone(&self.shared);
        let builder = std::thread::Builder::new();
        let spawned = match shared.direction {
            PcmDirection::Playback => builder
                .name("bluemix-mix".into())
                .spawn(move || mix::run(shared)),
            PcmDirection::Capture => builder
                .name("bluemix-snoop".into())
                .spawn(move || snoop::run(shared)),
        };
        *thread = Some(spawned.map_err(MultiError::ThreadSpawn)?);
        Ok(())
    }

    /// Attach an application's PCM pipe and control socket.
    ///
    /// Rejected once `max_clients` are attached. The first client starts
    /// the event thread and the transport is told the PCM was opened.
    pub fn add_client(&self, pcm: OwnedFd, control: OwnedFd) -> Result<ClientKey> {
        let shared = &self.shared;
        let id = shared.next_id.fetch_add(1, Ordering::Relaxed) + 1;

        let (key, count) = {
            let mut mix = shared.mix.lock();
            let mut clients = shared.clients.lock();
            let geometry = *shared.geometry.read();
            let max = shared.config.max_clients;
            if clients.len() >= max {
                return Err(MultiError::TooManyClients(max).into());
            }

            let created_event = shared.ensure_pcm_event()?;
            let inserted = clients.insert_with(|key| {
                Client::new(
                    id,
                    key,
                    shared.direction,
                    geometry.params.format,
                    geometry.params.channels,
                    pcm,
                    control,
                    &shared.epoll,
                )
                .map(|client| Arc::new(Mutex::new(client)))
            });
            let key = match inserted {
                Ok(key) => key,
                Err(e) => {
                    if created_event {
                        shared.pcm_event.lock().take();
                    }
                    return Err(e.into());
                }
            };

            if geometry.period_bytes > 0 {
                let initialized = match clients.get(key) {
                    Some(handle) => {
                        let mut ctx = shared.context(mix.buffer.as_mut());
                        handle.lock().init(geometry.period_bytes, &mut ctx)
                    }
                    None => Ok(()),
                };
                if let Err(e) = initialized {
                    shared.remove_client(&mut clients, key, mix.buffer.as_mut());
                    if created_event {
                        shared.pcm_event.lock().take();
                    }
                    return Err(e.into());
                }
            }

            // every earlier client left, start over
            shared.transition(MultiState::Finished, MultiState::Init);
            if shared.direction == PcmDirection::Capture
                && !shared.transition(MultiState::Init, MultiState::Running)
            {
                shared.resume_capture();
            }
            (key, clients.len())
        };

        if let Err(e) = self.ensure_thread() {
            let mut mix = shared.mix.lock();
            let mut clients = shared.clients.lock();
            shared.remove_client(&mut clients, key, mix.buffer.as_mut());
            return Err(e);
        }

        if count == 1 {
            shared.transport.signal(TransportSignal::Open);
        }
        info!("new client id {}, total clients now {}", id, count);
        Ok(key)
    }

    /// Pull up to `frames` mixed frames into `out`.
    ///
    /// Called by the transport's encoder thread. Requests a mix pass from
    /// the event thread and waits for it while the multi is running.
    pub fn read(&self, out: &mut [u8], frames: usize) -> Result<PcmRead> {
        let shared = &self.shared;
        {
            let pcm_event = shared.pcm_event.lock();
            let Some(event) = pcm_event.as_ref() else {
                return Err(MultiError::BadDescriptor.into());
            };
            event.read()?;
        }

        let mut mix = shared.mix.lock();
        if mix.buffer.is_none() {
            return Err(MultiError::NotInitialized.into());
        }
        mix.ready = false;
        if !mix.requested {
            mix.requested = true;
            shared.wake.write(1)?;
        }
        while shared.state() == MultiState::Running && !mix.ready {
            shared.ready.wait(&mut mix);
        }

        match shared.state() {
            MultiState::Running => {
                let scales = shared.scales();
                let n = mix
                    .buffer
                    .as_mut()
                    .map_or(0, |buffer| buffer.read(out, frames, &scales));
                drop(mix);
                if n == 0 {
                    shared.underrun();
                    return Ok(PcmRead::Again);
                }
                shared
                    .counters
                    .frames_mixed
                    .fetch_add(n as u64, Ordering::Relaxed);
                Ok(PcmRead::Frames(n))
            }
            MultiState::Finished => Ok(PcmRead::Finished),
            _ => Ok(PcmRead::Again),
        }
    }

    /// Fan decoded audio out to every running capture client.
    ///
    /// Called by the transport's decoder thread; never blocks on a client.
    /// Returns the frames consumed, 0 once the multi has finished.
    pub fn write(&self, data: &[u8]) -> usize {
        let shared = &self.shared;
        let frame_bytes = shared.geometry.read().params.frame_bytes();
        let frames = data.len() / frame_bytes;
        let data = &data[..frames * frame_bytes];

        let mut clients = shared.clients.lock();
        if shared.state() == MultiState::Finished {
            return 0;
        }

        let mut dropped = 0;
        let mut finished = Vec::new();
        for (key, handle) in clients.iter() {
            let mut client = handle.lock();
            if client.state() == ClientState::Running {
                let mut ctx = shared.context(None);
                dropped += client.write_to_pipe(data, &mut ctx);
            }
            if client.state() == ClientState::Finished {
                finished.push(key);
            }
        }
        for key in finished {
            shared.remove_client(&mut clients, key, None);
        }
        if dropped > 0 {
            shared
                .counters
                .frames_dropped
                .fetch_add((dropped / frame_bytes) as u64, Ordering::Relaxed);
        }

        if clients.is_empty() {
            drop(clients);
            shared.enter_finished();
        } else if shared.active_count.load(Ordering::SeqCst) == 0
            && shared.transition(MultiState::Running, MultiState::Paused)
        {
            debug!("no active capture clients, pausing transport");
            shared.transport.signal(TransportSignal::Pause);
        }
        frames
    }

    /// Estimated delay added by the engine, in 1/10 ms.
    ///
    /// Unread mixed frames plus the typical amount a client holds before
    /// joining the mix. Always 0 for capture.
    pub fn delay_get(&self) -> u32 {
        self.shared.delay()
    }

    /// Descriptor the transport may poll for "mixed data available"
    pub fn pcm_event(&self) -> Option<Arc<EventFd>> {
        self.shared.pcm_event.lock().clone()
    }

    pub fn state(&self) -> MultiState {
        self.shared.state()
    }

    pub fn direction(&self) -> PcmDirection {
        self.shared.direction
    }

    pub fn client_count(&self) -> usize {
        self.shared.clients.lock().len()
    }

    pub fn client_state(&self, key: ClientKey) -> Option<ClientState> {
        let clients = self.shared.clients.lock();
        let state = clients.get(key).map(|handle| handle.lock().state());
        state
    }

    pub fn active_count(&self) -> usize {
        self.shared.active_count.load(Ordering::SeqCst)
    }

    pub fn stats(&self) -> MultiStats {
        let shared = &self.shared;
        let (buffered_frames, late_frames) = shared
            .mix
            .lock()
            .buffer
            .as_ref()
            .map_or((0, 0), |buffer| (buffer.available(), buffer.late_frames()));
        MultiStats {
            direction: shared.direction,
            state: shared.state(),
            clients: self.client_count(),
            active: self.active_count(),
            buffered_frames,
            frames_mixed: shared.counters.frames_mixed.load(Ordering::Relaxed),
            frames_dropped: shared.counters.frames_dropped.load(Ordering::Relaxed),
            late_frames,
            underruns: shared.counters.underruns.load(Ordering::Relaxed),
            delay: shared.delay(),
        }
    }
}

impl Drop for Multi {
    fn drop(&mut self) {
        self.cleanup();
        debug!("multi freed");
    }
}

impl Shared {
    fn state(&self) -> MultiState {
        MultiState::from_u8(self.state.load(Ordering::SeqCst))
    }

    fn set_state(&self, state: MultiState) {
        self.state.store(state as u8, Ordering::SeqCst);
    }

    /// Move from `from` to `to`, false if the multi was not in `from`
    fn transition(&self, from: MultiState, to: MultiState) -> bool {
        self.state
            .compare_exchange(from as u8, to as u8, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
    }

    fn context<'a>(&'a self, mix: Option<&'a mut MixBuffer>) -> ClientContext<'a> {
        ClientContext {
            epoll: &self.epoll,
            active: &self.active_count,
            mix,
            client_threshold: self.config.client_threshold_periods,
            drain_settle: self.config.drain_settle(),
        }
    }

    fn ensure_pcm_event(&self) -> Result<bool> {
        let mut pcm_event = self.pcm_event.lock();
        if pcm_event.is_some() {
            return Ok(false);
        }
        *pcm_event = Some(Arc::new(EventFd::new()?));
        Ok(true)
    }

    /// Tell the transport thread that mixed audio is waiting
    fn wake_transport(&self) {
        if let Some(event) = self.pcm_event.lock().as_ref() {
            let _ = event.write(1);
        }
    }

    /// Per-channel read scales from the transport's current volume
    fn scales(&self) -> [f64; crate::constants::MAX_CHANNELS] {
        let channels = self.geometry.read().params.channels as usize;
        let volumes: Vec<_> = (0..channels).map(|c| self.transport.volume(c)).collect();
        mix_scales(
            &volumes,
            self.transport.soft_volume(),
            self.config.native_volume,
        )
    }

    fn delay(&self) -> u32 {
        let geometry = *self.geometry.read();
        if self.direction != PcmDirection::Playback || geometry.period_frames == 0 {
            return 0;
        }
        let unread = self
            .mix
            .lock()
            .buffer
            .as_ref()
            .map_or(0, |buffer| buffer.delay(buffer.end()));
        let frames = unread + self.config.client_threshold_periods * geometry.period_frames;
        (frames as u64 * 10_000 / geometry.params.rate as u64) as u32
    }

    fn init_clients(&self, period_bytes: usize) {
        let mut mix = self.mix.lock();
        let mut clients = self.clients.lock();
        let mut failed = Vec::new();
        for (key, handle) in clients.iter() {
            let mut client = handle.lock();
            let mut ctx = self.context(mix.buffer.as_mut());
            if let Err(e) = client.restart(period_bytes, &mut ctx) {
                error!("Unable to initialize client {}: {}", client.id(), e);
                failed.push(key);
            }
        }
        for key in failed {
            self.remove_client(&mut clients, key, mix.buffer.as_mut());
        }
    }

    /// Caller holds the mix and client locks
    fn remove_client(
        &self,
        clients: &mut Registry<ClientHandle>,
        key: ClientKey,
        mix: Option<&mut MixBuffer>,
    ) {
        let Some(handle) = clients.remove(key) else {
            return;
        };
        let mut client = handle.lock();
        let mut ctx = self.context(mix);
        client.release(&mut ctx);
        info!(
            "removed client id {}, total clients now {}",
            client.id(),
            clients.len()
        );
    }

    /// Every running playback client failed to keep the mix fed
    fn underrun(&self) {
        if !self.transition(MultiState::Running, MultiState::Init) {
            return;
        }
        self.counters.underruns.fetch_add(1, Ordering::Relaxed);
        let clients = self.clients.lock();
        for (_, handle) in clients.iter() {
            let mut ctx = self.context(None);
            handle.lock().underrun(&mut ctx);
        }
    }

    /// The last client has gone: clear the mix and release the transport.
    ///
    /// Runs its side effects only on the transition into `Finished`.
    fn enter_finished(&self) {
        let mut mix = self.mix.lock();
        if !self.clients.lock().is_empty() {
            // a client attached since the set was seen empty
            return;
        }
        let previous = MultiState::from_u8(self.state.swap(MultiState::Finished as u8, Ordering::SeqCst));
        self.ready.notify_all();
        if previous == MultiState::Finished {
            return;
        }
        if let Some(buffer) = mix.buffer.as_mut() {
            buffer.clear();
        }
        self.pcm_event.lock().take();
        self.transport.release();
        self.transport.signal(TransportSignal::Close);
        drop(mix);
        info!("last client closed, transport PCM released");
    }

    /// Capture: an active client came back while the transport was paused
    fn resume_capture(&self) {
        if self.active_count.load(Ordering::SeqCst) > 0
            && self.transition(MultiState::Paused, MultiState::Running)
        {
            debug!("capture client active, resuming transport");
            self.transport.signal(TransportSignal::Resume);
        }
    }

    /// Read the wake counter, true if it carries the stop request
    fn take_wake(&self) -> bool {
        match self.wake.read() {
            Ok(value) => value >= POISON,
            Err(e) => {
                error!("wake read failed: {}", e);
                true
            }
        }
    }

    /// Event thread exit path, also releases a transport blocked in `read`
    fn terminate(&self) {
        let mix = self.mix.lock();
        self.set_state(MultiState::Finished);
        self.ready.notify_all();
        drop(mix);
        self.wake_transport();
    }
}
