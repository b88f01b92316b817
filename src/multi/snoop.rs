//! Capture event thread
//!
//! Audio never passes through here; the transport pushes it with
//! `Multi::write`. This loop only services control commands and notices
//! clients going away.

use std::sync::Arc;
use tracing::{debug, error};

use super::{Shared, WAKE_TOKEN};
use crate::client::{decode_token, ClientState};
use crate::sys::Events;

const EVENT_CAPACITY: usize = 16;

pub(super) fn run(shared: Arc<Shared>) {
    debug!("Starting snoop thread");
    let mut events = Events::with_capacity(EVENT_CAPACITY);

    'outer: loop {
        if let Err(e) = shared.epoll.wait(&mut events, None) {
            error!("Snoop thread poll failed: {}", e);
            break;
        }

        let empty = {
            let mut clients = shared.clients.lock();
            for event in events.iter() {
                if event.token == WAKE_TOKEN {
                    if shared.take_wake() {
                        break 'outer;
                    }
                    continue;
                }

                let Some((kind, key)) = decode_token(event.token) else {
                    continue;
                };
                let Some(handle) = clients.get(key).cloned() else {
                    continue;
                };
                let finished = {
                    let mut client = handle.lock();
                    let mut ctx = shared.context(None);
                    if event.is_hangup() {
                        client.handle_close(kind, &mut ctx);
                    } else {
                        client.handle_event(kind, false, &mut ctx);
                    }
                    client.state() == ClientState::Finished
                };
                if finished {
                    shared.remove_client(&mut clients, key, None);
                }
            }

            if !clients.is_empty() {
                shared.resume_capture();
            }
            clients.is_empty()
        };

        if empty {
            shared.enter_finished();
        }
    }

    shared.terminate();
    debug!("Snoop thread stopped");
}
