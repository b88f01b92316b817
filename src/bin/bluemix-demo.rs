//! Loopback demo
//!
//! Attaches a few synthetic tone clients to a playback multi and drives it
//! with a paced stand-in for a codec encoder thread. The mix is optionally
//! written to a raw PCM file.
//!
//! Usage: `bluemix-demo [config.toml]`

use anyhow::{bail, Context, Result};
use std::fs::File;
use std::io::{Read, Write};
use std::os::fd::OwnedFd;
use std::os::unix::net::UnixStream;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use bluemix::{
    audio::PcmParams,
    config::BridgeConfig,
    multi::{Multi, PcmRead},
    sys::{pipe, set_pipe_size},
    transport::{ChannelTransport, PcmDirection},
};

/// Application side of one tone client
struct ToneApp {
    id: usize,
    control: UnixStream,
    /// Hands the pipe back so it stays open while draining
    writer: Option<JoinHandle<File>>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let config = match std::env::args().nth(1).map(PathBuf::from) {
        Some(path) => BridgeConfig::load(&path)
            .with_context(|| format!("loading {}", path.display()))?,
        None => BridgeConfig::load_default().context("loading default config")?,
    };

    // Initialize logging
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| config.logging.level.clone()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("Starting bluemix loopback demo");

    let demo = config.demo.clone();
    let params = PcmParams::new(demo.format, demo.channels, demo.rate);
    let (transport, signals) = ChannelTransport::new(PcmDirection::Playback, params);
    let transport = Arc::new(transport);
    if !Multi::enabled(transport.as_ref(), &config.multi) {
        bail!("multi-client mixing is disabled for {:?}", params.format);
    }

    let multi = Arc::new(Multi::create(transport.clone(), config.multi.clone())?);
    multi.init()?;

    thread::Builder::new()
        .name("signals".into())
        .spawn(move || {
            for signal in signals.iter() {
                tracing::info!("transport signal: {:?}", signal);
            }
        })?;

    let running = Arc::new(AtomicBool::new(true));
    let period_frames = params.frames_for_ms(config.multi.period_ms);

    let mut apps = Vec::with_capacity(demo.clients);
    for id in 0..demo.clients {
        let frequency = 220.0 * (id + 1) as f64;
        apps.push(spawn_tone(&multi, params, period_frames, frequency, id, running.clone())?);
    }

    let encoder_running = Arc::new(AtomicBool::new(true));
    let encoder = spawn_encoder(
        multi.clone(),
        params,
        period_frames,
        Duration::from_millis(config.multi.period_ms as u64),
        demo.output.clone(),
        encoder_running.clone(),
    )?;

    tracing::info!(
        "{} clients attached, running for {} s - press Ctrl+C to stop",
        demo.clients,
        demo.duration_secs
    );
    tokio::select! {
        _ = tokio::signal::ctrl_c() => tracing::info!("Interrupted"),
        _ = tokio::time::sleep(Duration::from_secs(demo.duration_secs)) => {}
    }

    running.store(false, Ordering::SeqCst);
    let mut pipes = Vec::with_capacity(apps.len());
    for app in &mut apps {
        if let Some(writer) = app.writer.take() {
            match writer.join() {
                Ok(pcm) => pipes.push(pcm),
                Err(_) => tracing::warn!("tone {} writer panicked", app.id),
            }
        }
    }
    for app in &mut apps {
        if let Err(e) = drain(app) {
            tracing::warn!("client {} drain failed: {}", app.id, e);
        }
    }
    drop(pipes);

    encoder_running.store(false, Ordering::SeqCst);
    let _ = encoder.join();

    let stats = multi.stats();
    println!("{}", serde_json::to_string_pretty(&stats)?);
    Ok(())
}

fn drain(app: &mut ToneApp) -> Result<()> {
    app.control
        .set_read_timeout(Some(Duration::from_secs(5)))?;
    app.control.write_all(b"Drain")?;
    let mut reply = [0u8; 16];
    let n = app.control.read(&mut reply)?;
    tracing::info!(
        "client {} drain: {}",
        app.id,
        String::from_utf8_lossy(&reply[..n])
    );
    Ok(())
}

/// Attach one client and feed it a sine until `running` clears
fn spawn_tone(
    multi: &Multi,
    params: PcmParams,
    period_frames: usize,
    frequency: f64,
    id: usize,
    running: Arc<AtomicBool>,
) -> Result<ToneApp> {
    let (rx, tx) = pipe()?;
    // keep app-side latency near the client threshold
    if let Err(e) = set_pipe_size(&tx, 4 * period_frames * params.frame_bytes()) {
        tracing::debug!("pipe resize failed: {}", e);
    }
    let (ours, theirs) = UnixStream::pair()?;
    let key = multi.add_client(rx, OwnedFd::from(ours))?;
    tracing::info!("client {} attached as {} ({} Hz)", id, key, frequency);

    let mut pcm = File::from(tx);
    let writer = thread::Builder::new()
        .name(format!("tone-{}", id))
        .spawn(move || {
            let mut phase = 0.0f64;
            let step = 2.0 * std::f64::consts::PI * frequency / params.rate as f64;
            let amplitude = params.format.max_value() as f64 / 8.0;
            let sample_bytes = params.format.bytes();
            let mut period = vec![0u8; period_frames * params.frame_bytes()];

            while running.load(Ordering::SeqCst) {
                for frame in period.chunks_exact_mut(params.frame_bytes()) {
                    let value = (amplitude * phase.sin()) as i64;
                    for sample in frame.chunks_exact_mut(sample_bytes) {
                        params.format.encode(value, sample);
                    }
                    phase = (phase + step) % (2.0 * std::f64::consts::PI);
                }
                if let Err(e) = pcm.write_all(&period) {
                    tracing::warn!("tone {} write failed: {}", id, e);
                    break;
                }
            }
            pcm
        })?;

    Ok(ToneApp {
        id,
        control: theirs,
        writer: Some(writer),
    })
}

/// Stand-in for the codec encoder: pulls one period per period time
fn spawn_encoder(
    multi: Arc<Multi>,
    params: PcmParams,
    period_frames: usize,
    interval: Duration,
    output: Option<PathBuf>,
    running: Arc<AtomicBool>,
) -> Result<JoinHandle<()>> {
    let mut sink = match output {
        Some(path) => Some(File::create(&path).with_context(|| format!("creating {}", path.display()))?),
        None => None,
    };

    let handle = thread::Builder::new()
        .name("encoder".into())
        .spawn(move || {
            let mut buffer = vec![0u8; period_frames * params.frame_bytes()];
            let mut next = Instant::now();
            while running.load(Ordering::SeqCst) {
                match multi.read(&mut buffer, period_frames) {
                    Ok(PcmRead::Frames(n)) => {
                        if let Some(file) = sink.as_mut() {
                            if let Err(e) = file.write_all(&buffer[..n * params.frame_bytes()]) {
                                tracing::error!("output write failed: {}", e);
                                sink = None;
                            }
                        }
                    }
                    Ok(PcmRead::Again) => {}
                    Ok(PcmRead::Finished) => break,
                    Err(e) => {
                        tracing::error!("mix read failed: {}", e);
                        break;
                    }
                }
                next += interval;
                let now = Instant::now();
                if next > now {
                    thread::sleep(next - now);
                } else {
                    next = now;
                }
            }
            tracing::debug!("encoder stopped, delay {} x0.1 ms", multi.delay_get());
        })?;
    Ok(handle)
}
