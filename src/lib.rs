//! UrbanRecorder is the core of a spatial walkie-talkie. One side captures a
//! microphone and streams it over UDP, stamped with where the speaker
//! stands. The other side receives the stream, works out where the speaker
//! is relative to the listener's head, and renders the voice so that it
//! seems to come from that direction.
//!
//! The pieces, from the sensors to the ear:
//!
//! - [orientation] turns compass headings and headphone motion into a
//!   true-north head orientation.
//! - [geo] computes the bearing and distance between two positions.
//! - [sensor_fusion] applies every sensor event in one order and keeps the
//!   spatial parameters up to date.
//! - [capture] asks for microphone permission and cuts the device's buffers
//!   into fixed-size frames.
//! - [wire] and [transport] carry those frames over UDP.
//! - [handoff] hands received frames to the render side through a
//!   [render_slot], which never blocks the render tick.
//! - [render] and [spatial] produce the directional stereo output.
//! - [session] owns all of the above.
//!
//! [cpal_device] connects the pipeline to the system's microphone and
//! speakers. Headless runs use stand-ins instead: [dummy_microphone],
//! [wav_microphone], [dummy_sensors], [render_clock] and [hound_writer]
//! let the whole pipeline run without audio hardware.

#![warn(missing_docs)]
pub mod args;
pub mod capture;
pub mod component;
pub mod config;
pub mod cpal_device;
pub mod dummy_microphone;
pub mod dummy_sensors;
pub mod geo;
pub mod handoff;
pub mod hound_writer;
pub mod orientation;
pub mod render;
pub mod render_clock;
pub mod render_slot;
pub mod sensor_fusion;
pub mod session;
pub mod spatial;
pub mod speech;
pub mod transport;
pub mod wav_microphone;
pub mod wire;
