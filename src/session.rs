//! The top-level owner of a voice session.
//!
//! A [Session] owns the sensor fusion thread, at most one broadcast channel
//! (microphone → wire) and at most one subscribe channel (wire → render).
//! Everything it learns is reported on the [Publication] receiver handed out
//! by [Session::new]; setup failures are reported there too and never stop
//! the rest of the session.

use crate::capture::{AudioCaptureStream, CaptureError, Microphone, PermissionGate};
use crate::component::run_component;
use crate::config::{ConfigError, SessionConfig};
use crate::geo::GeoPosition3D;
use crate::handoff::{FrameHandoff, RenderWriter};
use crate::render::{RenderFrame, RenderUnit};
use crate::render_slot::triple_buffer;
use crate::sensor_fusion::{FailureNotice, Publication, SensorEvent, SensorFeeds, SensorFusion};
use crate::spatial::{SpatialEffectApplier, SpatialParams};
use crate::speech::SpeechDetector;
use crate::transport::{
    ChannelBinding, ChannelRole, SendError, TransportError, UdpTransport,
};
use crate::wire::{AudioFrame, Packet};

use crossbeam::atomic::AtomicCell;
use log::{debug, info, warn};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{channel, Receiver, Sender};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};
use thiserror::Error;

/// How often the speaking indicator is checked for expiry.
const SPEECH_CHECK_INTERVAL: Duration = Duration::from_millis(50);

/// Errors that stop a session operation outright. Transport setup failures
/// are not among them; those are published as [FailureNotice]s.
#[derive(Debug, Error)]
pub enum SessionError {
    /// The configuration did not validate.
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// Stop the running channel of this role first.
    #[error("{0} channel is already active")]
    AlreadyActive(ChannelRole),

    /// The microphone could not be started.
    #[error(transparent)]
    Capture(#[from] CaptureError),

    /// A worker thread could not be spawned.
    #[error("cannot start thread: {0}")]
    Thread(#[from] std::io::Error),
}

/// Runs a closure at a fixed interval on its own thread until stopped.
struct Ticker {
    running: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl Ticker {
    fn spawn<F>(name: &str, interval: Duration, mut tick: F) -> std::io::Result<Self>
    where
        F: FnMut() + Send + 'static,
    {
        let running = Arc::new(AtomicBool::new(true));
        let th_running = running.clone();
        let handle = thread::Builder::new().name(name.to_owned()).spawn(move || {
            while th_running.load(Ordering::Acquire) {
                tick();
                // sleep in short steps so stop() returns quickly
                let wake = Instant::now() + interval;
                while th_running.load(Ordering::Acquire) {
                    let now = Instant::now();
                    if now >= wake {
                        break;
                    }
                    thread::sleep((wake - now).min(SPEECH_CHECK_INTERVAL));
                }
            }
        })?;
        Ok(Self {
            running,
            handle: Some(handle),
        })
    }

    fn stop(&mut self) {
        self.running.store(false, Ordering::Release);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for Ticker {
    fn drop(&mut self) {
        self.stop();
    }
}

struct BroadcastChannel {
    binding: ChannelBinding,
    transport: Arc<UdpTransport>,
    capture: AudioCaptureStream,
    latency_ping: Ticker,
}

struct SubscribeChannel {
    binding: ChannelBinding,
    transport: UdpTransport,
    speech_expiry: Ticker,
}

/// Owns one capture/render pair and one transport per channel role.
pub struct Session {
    config: SessionConfig,
    events: Sender<SensorEvent>,
    publications: Sender<Publication>,
    own_position: Arc<AtomicCell<Option<GeoPosition3D>>>,
    render_writer: Arc<RenderWriter>,
    render_unit: Option<RenderUnit>,
    ready: Arc<AtomicBool>,
    speech: Arc<Mutex<SpeechDetector>>,
    broadcast: Option<BroadcastChannel>,
    subscribe: Option<SubscribeChannel>,
}

impl Session {
    /// Validates `config`, starts sensor fusion and returns the session with
    /// the receiving end of its publications.
    pub fn new(config: SessionConfig) -> Result<(Self, Receiver<Publication>), SessionError> {
        config.validate()?;

        let (event_tx, event_rx) = channel();
        let (pub_tx, pub_rx) = channel();
        let own_position = Arc::new(AtomicCell::new(None));

        let (spatial_writer, spatial_reader) = triple_buffer(SpatialParams::default());
        let fusion = SensorFusion::new(spatial_writer, own_position.clone());
        run_component(Box::new(fusion), event_rx, pub_tx.clone());

        let (audio_writer, audio_reader) = triple_buffer(RenderFrame::default());
        let ready = Arc::new(AtomicBool::new(false));
        let render_unit = RenderUnit::new(
            audio_reader,
            spatial_reader,
            ready.clone(),
            SpatialEffectApplier::new(&config.spatial),
        );

        let speech = Arc::new(Mutex::new(SpeechDetector::new(&config.speech)));
        info!("Session : started");

        Ok((
            Self {
                config,
                events: event_tx,
                publications: pub_tx,
                own_position,
                render_writer: Arc::new(RenderWriter::new(audio_writer)),
                render_unit: Some(render_unit),
                ready,
                speech,
                broadcast: None,
                subscribe: None,
            },
            pub_rx,
        ))
    }

    /// The configuration the session runs with.
    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    /// Handles for the heading, motion and location services.
    pub fn feeds(&self) -> SensorFeeds {
        SensorFeeds::new(&self.events)
    }

    /// Makes the next motion sample the new true-north anchor.
    pub fn reset_anchor(&self) {
        let _ = self.events.send(SensorEvent::ResetAnchor);
    }

    /// The render unit, for whoever drives the audio output. Only available
    /// once.
    pub fn take_render_unit(&mut self) -> Option<RenderUnit> {
        self.render_unit.take()
    }

    /// Starts sending `local_id`'s microphone to the configured destination
    /// on behalf of the conversation with `remote_id`. Permission is asked
    /// through `gate`; the answer comes later.
    pub fn start_broadcast(
        &mut self,
        local_id: &str,
        remote_id: &str,
        microphone: Box<dyn Microphone>,
        gate: &dyn PermissionGate,
    ) -> Result<(), SessionError> {
        if self.broadcast.is_some() {
            return Err(SessionError::AlreadyActive(ChannelRole::Broadcast));
        }
        let binding = ChannelBinding::broadcast(local_id, remote_id);
        let network = &self.config.network;
        let transport = Arc::new(UdpTransport::new(
            ChannelRole::Broadcast,
            network.bind_host.as_str(),
        ));

        self.setup_step(&transport, "bind", transport.bind(network.broadcast_port));
        if network.allow_broadcast {
            self.setup_step(&transport, "enable_broadcast", transport.enable_broadcast(true));
        }
        self.setup_step(
            &transport,
            "connect",
            transport.connect(&network.destination_host, network.destination_port),
        );
        // pongs come back on this socket
        self.setup_step(&transport, "begin_receiving", transport.begin_receiving());

        let latency_ping = {
            let transport = transport.clone();
            let publications = self.publications.clone();
            let mut last = None;
            Ticker::spawn("latency-ping", network.latency_ping_interval(), move || {
                let latency = transport.measure_latency();
                if latency.is_some() && latency != last {
                    last = latency;
                    if let Some(ms) = latency {
                        let _ = publications.send(Publication::Latency(ms));
                    }
                }
            })?
        };

        let capture = AudioCaptureStream::new(
            microphone,
            self.config.audio.frame_size,
            self.config.audio.sample_rate,
        );
        let on_frame = frame_sender(
            &binding,
            transport.clone(),
            self.own_position.clone(),
            network.send_timeout(),
        );
        let publications = self.publications.clone();
        let on_error = Box::new(move |error: CaptureError| {
            let notice = match error {
                CaptureError::PermissionDenied => FailureNotice::PermissionDenied,
                other => FailureNotice::Capture(other.to_string()),
            };
            let _ = publications.send(Publication::Failure(notice));
        });
        capture.start(gate, on_frame, on_error)?;

        info!(
            "Session : broadcasting {} to {}",
            binding.local_id, binding.remote_id
        );
        self.broadcast = Some(BroadcastChannel {
            binding,
            transport,
            capture,
            latency_ping,
        });
        Ok(())
    }

    /// Stops the microphone and tears the broadcast channel down.
    pub fn stop_broadcast(&mut self) {
        if let Some(mut channel) = self.broadcast.take() {
            channel.capture.stop();
            channel.latency_ping.stop();
            channel.transport.close();
            info!("Session : stopped broadcasting {}", channel.binding.local_id);
        }
    }

    /// Starts listening for `remote_id` on the configured port and feeding
    /// what arrives to the render unit.
    pub fn start_subscribe(&mut self, local_id: &str, remote_id: &str) -> Result<(), SessionError> {
        if self.subscribe.is_some() {
            return Err(SessionError::AlreadyActive(ChannelRole::Subscribe));
        }
        let binding = ChannelBinding::subscribe(local_id, remote_id);
        let transport = UdpTransport::new(
            ChannelRole::Subscribe,
            self.config.network.bind_host.as_str(),
        );

        let mut handoff = FrameHandoff::new(
            binding.clone(),
            self.config.audio.frame_size,
            self.render_writer.clone(),
            self.speech.clone(),
            self.events.clone(),
            self.publications.clone(),
        );
        transport.on_receive(move |datagram, from| handoff.on_datagram(datagram, from));

        self.setup_step(&transport, "bind", transport.bind(self.config.network.listen_port));
        self.setup_step(&transport, "begin_receiving", transport.begin_receiving());

        let speech_expiry = {
            let speech = self.speech.clone();
            let publications = self.publications.clone();
            Ticker::spawn("speech-expiry", SPEECH_CHECK_INTERVAL, move || {
                let edge = speech
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .expire(Instant::now());
                if let Some(speaking) = edge {
                    let _ = publications.send(Publication::Speaking(speaking));
                }
            })?
        };

        self.ready.store(true, Ordering::Release);
        info!(
            "Session : {} listening for {}",
            binding.local_id, binding.remote_id
        );
        self.subscribe = Some(SubscribeChannel {
            binding,
            transport,
            speech_expiry,
        });
        Ok(())
    }

    /// Tears the subscribe channel down. Render goes silent immediately.
    pub fn stop_subscribe(&mut self) {
        if let Some(mut channel) = self.subscribe.take() {
            self.ready.store(false, Ordering::Release);
            channel.transport.close();
            channel.speech_expiry.stop();
            self.render_writer.clear();

            let edge = self
                .speech
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .reset();
            if let Some(speaking) = edge {
                let _ = self.publications.send(Publication::Speaking(speaking));
            }
            info!("Session : stopped listening for {}", channel.binding.remote_id);
        }
    }

    /// The last measured round trip to the broadcast destination.
    pub fn latency_ms(&self) -> Option<u64> {
        self.broadcast
            .as_ref()
            .and_then(|channel| channel.transport.latency_gauge().millis())
    }

    /// The local address of the subscribe channel, if it is bound.
    pub fn subscribe_addr(&self) -> Option<SocketAddr> {
        self.subscribe
            .as_ref()
            .and_then(|channel| channel.transport.local_addr())
    }

    /// True between a successful [start_broadcast](Self::start_broadcast)
    /// and the matching stop.
    pub fn is_broadcasting(&self) -> bool {
        self.broadcast.is_some()
    }

    /// True between a successful [start_subscribe](Self::start_subscribe)
    /// and the matching stop.
    pub fn is_subscribed(&self) -> bool {
        self.subscribe.is_some()
    }

    fn setup_step<T>(
        &self,
        transport: &UdpTransport,
        step: &'static str,
        result: Result<T, TransportError>,
    ) {
        if let Err(error) = result {
            let _ = self
                .publications
                .send(Publication::Failure(FailureNotice::TransportSetup {
                    role: transport.role(),
                    step,
                    reason: error.to_string(),
                }));
        }
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.stop_broadcast();
        self.stop_subscribe();
    }
}

/// Builds the capture callback: stamps each frame and sends it, dropping it
/// on any failure.
fn frame_sender(
    binding: &ChannelBinding,
    transport: Arc<UdpTransport>,
    own_position: Arc<AtomicCell<Option<GeoPosition3D>>>,
    timeout: Duration,
) -> Box<dyn FnMut(Vec<f32>) + Send> {
    let sender_id = binding.local_id.clone();
    let channel_id = binding.remote_id.clone();
    let mut sequence: u32 = 0;

    Box::new(move |samples| {
        let frame = AudioFrame {
            sender_id: sender_id.clone(),
            channel_id: channel_id.clone(),
            sequence,
            timestamp_ms: unix_millis(),
            origin: own_position.load(),
            samples,
        };
        sequence = sequence.wrapping_add(1);

        let datagram = match Packet::Audio(frame).encode() {
            Ok(datagram) => datagram,
            Err(e) => {
                warn!("Session : cannot encode frame: {e}");
                return;
            }
        };
        match transport.send(&datagram, timeout) {
            Ok(_) => {}
            Err(SendError::Timeout) => debug!("Session : frame timed out, dropped"),
            Err(e) => debug!("Session : frame dropped: {e}"),
        }
    })
}

fn unix_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|since| since.as_millis() as u64)
        .unwrap_or(0)
}
