//! Playback event thread
//!
//! Waits on every client descriptor plus the wake counter. Client input is
//! moved into the mix buffer on request from the transport's `read`, and
//! after every batch of events the multi state is re-evaluated.

use std::sync::atomic::Ordering;
use std::sync::Arc;
use tracing::{debug, error, trace};

use super::{MultiState, Shared, WAKE_TOKEN};
use crate::client::{decode_token, ClientState};
use crate::sys::Events;
use crate::transport::TransportSignal;

const EVENT_CAPACITY: usize = 32;

pub(super) fn run(shared: Arc<Shared>) {
    debug!("Starting mix thread");
    let mut events = Events::with_capacity(EVENT_CAPACITY);

    loop {
        if let Err(e) = shared.epoll.wait(&mut events, None) {
            error!("Mix thread poll failed: {}", e);
            break;
        }

        let mut stop = false;
        let mut mix_requested = false;
        {
            let mut mix = shared.mix.lock();
            let mut clients = shared.clients.lock();
            for event in events.iter() {
                if event.token == WAKE_TOKEN {
                    if shared.take_wake() {
                        stop = true;
                        break;
                    }
                    mix_requested = true;
                    continue;
                }

                let Some((kind, key)) = decode_token(event.token) else {
                    continue;
                };
                // removed earlier in this batch
                let Some(handle) = clients.get(key).cloned() else {
                    trace!("stale event for client {}", key);
                    continue;
                };
                let finished = {
                    let mut client = handle.lock();
                    let mut ctx = shared.context(mix.buffer.as_mut());
                    client.handle_event(kind, event.is_hangup(), &mut ctx);
                    client.state() == ClientState::Finished
                };
                if finished {
                    shared.remove_client(&mut clients, key, mix.buffer.as_mut());
                }
            }
        }
        if stop {
            break;
        }

        if mix_requested {
            mix_pass(&shared);
        }
        after_events(&shared);
    }

    shared.terminate();
    debug!("Mix thread stopped");
}

/// Deliver every client's input into the mix and release a waiting reader
fn mix_pass(shared: &Shared) {
    let mut mix = shared.mix.lock();
    update_mix(shared, &mut mix);
    mix.ready = true;
    mix.requested = false;
    shared.ready.notify_all();
}

/// Returns true while some client is draining its last input
fn update_mix(shared: &Shared, mix: &mut super::MixState) -> bool {
    let mut clients = shared.clients.lock();
    let mut finished = Vec::new();
    let mut draining = false;
    for (key, handle) in clients.iter() {
        let mut client = handle.lock();
        let mut ctx = shared.context(mix.buffer.as_mut());
        client.deliver(&mut ctx);
        match client.state() {
            ClientState::Finished => finished.push(key),
            ClientState::Draining1 => draining = true,
            _ => {}
        }
    }
    for key in finished {
        shared.remove_client(&mut clients, key, mix.buffer.as_mut());
    }
    draining
}

fn after_events(shared: &Shared) {
    let mut mix = shared.mix.lock();

    let count = {
        let clients = shared.clients.lock();
        if clients.len() == 1 {
            if let Some((_, handle)) = clients.iter().next() {
                let mut client = handle.lock();
                if client.drop_requested() {
                    // the only client dropped: discard everything already mixed
                    if let Some(buffer) = mix.buffer.as_mut() {
                        buffer.clear();
                    }
                    if let Some(event) = shared.pcm_event.lock().as_ref() {
                        let _ = event.read();
                    }
                    shared.transport.signal(TransportSignal::Drop);
                    client.clear_drop_request();
                    shared.set_state(MultiState::Init);
                }
            }
        }
        clients.len()
    };

    if count == 0 {
        drop(mix);
        shared.enter_finished();
        return;
    }

    match shared.state() {
        MultiState::Init if shared.active_count.load(Ordering::SeqCst) > 0 => {
            let draining = update_mix(shared, &mut mix);
            // a drained stream shorter than the threshold still has to play
            let start = mix
                .buffer
                .as_ref()
                .is_some_and(|b| b.at_threshold() || (draining && !b.is_empty()));
            if start && shared.transition(MultiState::Init, MultiState::Running) {
                debug!("mix threshold reached, starting transport");
                shared.transport.signal(TransportSignal::Resume);
                shared.wake_transport();
            }
        }
        MultiState::Running => {
            if mix.buffer.as_ref().map_or(true, |b| b.is_empty()) {
                debug!("mix ran dry");
                shared.underrun();
            } else {
                shared.wake_transport();
            }
        }
        _ => {}
    }
}
