/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Accept and dial loops shared by the TCP and WebSocket meshes.

use std::{
    io::ErrorKind,
    net::{TcpListener, TcpStream},
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    thread::{self, JoinHandle},
    time::{Duration, Instant},
};

const ACCEPT_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Accept connections on `listener` until `closed` is set, handing every stream to `on_stream` on a
/// thread of its own so that a slow handshake does not hold up the next accept.
pub(crate) fn spawn_listener<F>(
    listener: TcpListener,
    closed: Arc<AtomicBool>,
    on_stream: F,
) -> std::io::Result<JoinHandle<()>>
where
    F: Fn(TcpStream) + Clone + Send + 'static,
{
    listener.set_nonblocking(true)?;
    Ok(thread::spawn(move || {
        while !closed.load(Ordering::Acquire) {
            match listener.accept() {
                Ok((stream, _)) => {
                    if stream.set_nonblocking(false).is_err() {
                        continue;
                    }
                    let on_stream = on_stream.clone();
                    thread::spawn(move || on_stream(stream));
                }
                Err(err) if err.kind() == ErrorKind::WouldBlock => {
                    thread::sleep(ACCEPT_POLL_INTERVAL)
                }
                Err(err) => {
                    log::warn!("Accept, {}", err);
                    thread::sleep(ACCEPT_POLL_INTERVAL)
                }
            }
        }
    }))
}

/// Run `tick` every `interval` until `closed` is set. The first tick runs immediately.
pub(crate) fn spawn_ticker<F>(interval: Duration, closed: Arc<AtomicBool>, mut tick: F) -> JoinHandle<()>
where
    F: FnMut() + Send + 'static,
{
    thread::spawn(move || {
        let mut last_tick: Option<Instant> = None;
        while !closed.load(Ordering::Acquire) {
            if last_tick.map_or(true, |last_tick| last_tick.elapsed() >= interval) {
                tick();
                last_tick = Some(Instant::now());
            }
            thread::sleep(ACCEPT_POLL_INTERVAL);
        }
    })
}
