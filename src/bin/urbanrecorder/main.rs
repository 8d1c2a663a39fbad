//! Runs one or both sides of a spatial voice conversation against simulated
//! sensors, with real or simulated audio devices.

use clap::Parser;
use urbanrecorder::{
    args::{
        BroadcastCommand,
        CommandTask::{Broadcast, InitConfig, Loopback, Subscribe},
        LoopbackCommand, RecorderArgs, SubscribeCommand,
    },
    capture::{CaptureError, Microphone},
    component::run_component,
    config::SessionConfig,
    cpal_device::{CpalMicrophone, CpalSpeaker},
    dummy_microphone::{AutoPermission, ToneMicrophone},
    dummy_sensors::{DummySensors, Walk},
    hound_writer::HoundWriter,
    render_clock::RenderClock,
    sensor_fusion::Publication,
    session::Session,
    wav_microphone::WavMicrophone,
};

use log::{debug, info, warn};
use std::{
    error::Error,
    path::Path,
    sync::mpsc::{channel, Receiver},
    thread,
    time::{Duration, Instant},
};

const POLL: Duration = Duration::from_millis(20);

// Example:
// cargo run --bin urbanrecorder -- subscribe --id bob --from alice --out bob.wav
// cargo run --bin urbanrecorder -- subscribe --id bob --speaker
// cargo run --bin urbanrecorder -- broadcast --id alice --to bob --port 7000
// cargo run --bin urbanrecorder -- broadcast --id alice --to bob --mic
// cargo run --bin urbanrecorder -- loopback --out loop.wav --bearing 270 -t 10

fn main() -> Result<(), Box<dyn Error>> {
    env_logger::init();
    let args = RecorderArgs::parse();
    let seconds = args.seconds;

    match args.command {
        InitConfig(cmd) => {
            SessionConfig::default().to_path(&cmd.path)?;
            println!("wrote default configuration to {}", cmd.path.display());
            Ok(())
        }
        Broadcast(cmd) => broadcast(load_config(args.config.as_deref())?, cmd, seconds),
        Subscribe(cmd) => subscribe(load_config(args.config.as_deref())?, cmd, seconds),
        Loopback(cmd) => loopback(load_config(args.config.as_deref())?, cmd, seconds),
    }
}

fn load_config(path: Option<&Path>) -> Result<SessionConfig, Box<dyn Error>> {
    match path {
        Some(path) => {
            info!("main : loading configuration from {}", path.display());
            Ok(SessionConfig::from_path(path)?)
        }
        None => Ok(SessionConfig::default()),
    }
}

/// A WAV file if one was given, a bursting tone otherwise.
fn microphone(
    sample_rate: u32,
    wav: Option<&Path>,
    looping: bool,
) -> Result<Box<dyn Microphone>, CaptureError> {
    Ok(match wav {
        Some(path) => Box::new(WavMicrophone::open(path)?.looping(looping)),
        None => Box::new(
            ToneMicrophone::new(sample_rate)
                .bursts(Duration::from_millis(1500), Duration::from_millis(1000)),
        ),
    })
}

fn broadcast(
    mut config: SessionConfig,
    cmd: BroadcastCommand,
    seconds: Option<u64>,
) -> Result<(), Box<dyn Error>> {
    if let Some(host) = cmd.host {
        config.network.destination_host = host;
    }
    if let Some(port) = cmd.port {
        config.network.destination_port = port;
    }
    let microphone: Box<dyn Microphone> = if cmd.mic {
        Box::new(CpalMicrophone::default_input()?)
    } else {
        microphone(config.audio.sample_rate, cmd.wav.as_deref(), cmd.looping)?
    };
    // the wire carries no rate, so the microphone decides it
    config.audio.sample_rate = microphone.sample_rate();

    let (mut session, publications) = Session::new(config)?;
    let _sensors = DummySensors::start(session.feeds(), cmd.walk.walk());
    session.start_broadcast(
        &cmd.local_id,
        &cmd.remote_id,
        microphone,
        &AutoPermission::grant(),
    )?;

    report(&[("broadcast", &publications)], seconds);
    session.stop_broadcast();
    Ok(())
}

/// Renders everything the session hears into `outfile` until `seconds` run
/// out, then finishes the file.
fn render_to_wav(
    session: &mut Session,
    outfile: &Path,
    during: impl FnOnce(&mut Session) -> Result<(), Box<dyn Error>>,
) -> Result<(), Box<dyn Error>> {
    let audio = session.config().audio.clone();
    let unit = session
        .take_render_unit()
        .ok_or("render unit is already in use")?;

    let writer = HoundWriter::create(outfile, audio.sample_rate)?;
    let (block_tx, block_rx) = channel();
    let (written_tx, written_rx) = channel();
    let writer_handle = run_component(Box::new(writer), block_rx, written_tx);
    let clock = RenderClock::start(unit, &audio, block_tx)?;

    let outcome = during(session);

    // stopping the clock closes the writer's input, which finalizes the file
    clock.stop();
    writer_handle
        .join()
        .map_err(|_| "wav writer thread panicked")?;

    let mut frames = 0;
    for written in written_rx.try_iter() {
        match written {
            Ok(count) => frames += count,
            Err(error) => warn!("main : {error}"),
        }
    }
    println!(
        "wrote {:.1}s of audio to {}",
        frames as f64 / audio.sample_rate as f64,
        outfile.display()
    );
    outcome
}

fn subscribe(
    mut config: SessionConfig,
    cmd: SubscribeCommand,
    seconds: Option<u64>,
) -> Result<(), Box<dyn Error>> {
    if let Some(port) = cmd.port {
        config.network.listen_port = port;
    }
    let (mut session, publications) = Session::new(config)?;
    let _sensors = DummySensors::start(session.feeds(), cmd.walk.walk());

    let listen = |session: &mut Session| -> Result<(), Box<dyn Error>> {
        session.start_subscribe(&cmd.local_id, &cmd.remote_id)?;
        if let Some(addr) = session.subscribe_addr() {
            println!("listening on {addr}");
        }
        report(&[("subscribe", &publications)], seconds);
        session.stop_subscribe();
        Ok(())
    };

    match &cmd.outfile {
        Some(outfile) => render_to_wav(&mut session, outfile, listen),
        None => render_to_speaker(&mut session, listen),
    }
}

/// Plays everything the session hears through the default output device.
fn render_to_speaker(
    session: &mut Session,
    during: impl FnOnce(&mut Session) -> Result<(), Box<dyn Error>>,
) -> Result<(), Box<dyn Error>> {
    let audio = session.config().audio.clone();
    let unit = session
        .take_render_unit()
        .ok_or("render unit is already in use")?;
    let speaker = CpalSpeaker::start(unit, &audio)?;

    let outcome = during(session);
    speaker.stop();
    outcome
}

fn loopback(
    mut config: SessionConfig,
    cmd: LoopbackCommand,
    seconds: Option<u64>,
) -> Result<(), Box<dyn Error>> {
    let microphone = microphone(config.audio.sample_rate, cmd.wav.as_deref(), true)?;
    config.audio.sample_rate = microphone.sample_rate();
    config.network.bind_host = "127.0.0.1".to_owned();
    config.network.listen_port = 0;
    config.network.broadcast_port = 0;
    config.network.allow_broadcast = false;

    let listener_walk = cmd.walk.walk();
    let speaker_walk = Walk {
        origin: listener_walk.origin.offset(cmd.bearing, cmd.distance),
        turn_rate: 0.0,
        speed: 0.0,
        noise: 0.0,
        ..Walk::default()
    };

    let (mut listener, listener_publications) = Session::new(config.clone())?;
    let _listener_sensors = DummySensors::start(listener.feeds(), listener_walk);

    render_to_wav(&mut listener, &cmd.outfile, |listener| {
        listener.start_subscribe("listener", "speaker")?;
        let addr = listener
            .subscribe_addr()
            .ok_or("listener did not bind a port")?;
        debug!("main : listener bound to {addr}");

        config.network.destination_host = "127.0.0.1".to_owned();
        config.network.destination_port = addr.port();
        let (mut speaker, speaker_publications) = Session::new(config)?;
        let _speaker_sensors = DummySensors::start(speaker.feeds(), speaker_walk);
        speaker.start_broadcast("speaker", "listener", microphone, &AutoPermission::grant())?;

        report(
            &[
                ("listener", &listener_publications),
                ("speaker", &speaker_publications),
            ],
            seconds,
        );
        speaker.stop_broadcast();
        listener.stop_subscribe();
        Ok(())
    })
}

/// Prints publications until `seconds` have passed, or forever.
fn report(sources: &[(&str, &Receiver<Publication>)], seconds: Option<u64>) {
    let deadline = seconds.map(|s| Instant::now() + Duration::from_secs(s));
    while deadline.map_or(true, |deadline| Instant::now() < deadline) {
        let mut idle = true;
        for (label, publications) in sources {
            for publication in publications.try_iter() {
                idle = false;
                match publication {
                    // these arrive several times a second
                    Publication::Location(_)
                    | Publication::Heading(_)
                    | Publication::Orientation(_) => debug!("{label} : {publication}"),
                    _ => println!("[{label}] {publication}"),
                }
            }
        }
        if idle {
            thread::sleep(POLL);
        }
    }
}
