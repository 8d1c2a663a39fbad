//! The datagram format.
//!
//! Every UDP datagram carries exactly one packet; nothing is ever split or
//! reassembled. All integers and floats are big-endian.
//!
//! ```text
//! "UR" | version: u8 | kind: u8 | body
//!
//! kind 0, audio:  sequence: u32 | timestamp_ms: u64 | flags: u8
//!                 [latitude: f64 | longitude: f64 | altitude: f64]   (flags & 1)
//!                 sender_len: u8 | sender: utf8
//!                 channel_len: u8 | channel: utf8
//!                 sample_count: u16 | samples: f32 * sample_count
//! kind 1, ping:   sequence: u32 | sent_at_us: u64
//! kind 2, pong:   the ping's body, echoed
//! ```

use crate::config::MAX_FRAME_SAMPLES;
use crate::geo::GeoPosition3D;

use nom::{
    bytes::complete::tag,
    combinator::{all_consuming, cond, map, map_res, verify},
    error::{Error, ErrorKind},
    multi::{count, length_data},
    number::complete::{be_f32, be_f64, be_u16, be_u32, be_u64, be_u8},
    sequence::tuple,
    Finish, IResult,
};
use thiserror::Error;

const MAGIC: &[u8] = b"UR";
const VERSION: u8 = 1;
const HEADER_LEN: usize = 4;
const ORIGIN_FLAG: u8 = 0b0000_0001;

/// Why a datagram could not be turned into a packet, or a packet into a
/// datagram.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum FrameError {
    /// The bytes do not parse.
    #[error("malformed packet ({0:?})")]
    Malformed(ErrorKind),

    /// An identifier is too long to encode.
    #[error("identifier is {0} bytes long, at most 255 fit")]
    IdentifierTooLong(usize),

    /// A frame is too long to encode.
    #[error("frame carries {0} samples, at most {MAX_FRAME_SAMPLES} fit")]
    TooManySamples(usize),

    /// The frame parsed but has the wrong length for this session.
    #[error("expected {expected} samples per frame, got {actual}")]
    UnexpectedSize {
        /// The session's frame size.
        expected: usize,
        /// The frame's length.
        actual: usize,
    },
}

/// The kind byte of a packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PacketKind {
    /// An [AudioFrame].
    Audio = 0,
    /// A latency request.
    Ping = 1,
    /// The answer to a ping.
    Pong = 2,
}

impl PacketKind {
    fn from_byte(byte: u8) -> Option<Self> {
        match byte {
            0 => Some(PacketKind::Audio),
            1 => Some(PacketKind::Ping),
            2 => Some(PacketKind::Pong),
            _ => None,
        }
    }
}

/// A fixed-size block of mono PCM plus who sent it and from where.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct AudioFrame {
    /// The broadcaster's identity.
    pub sender_id: String,
    /// The identity the broadcaster is talking to.
    pub channel_id: String,
    /// Increments by one per frame and wraps.
    pub sequence: u32,
    /// Sender wall clock, milliseconds since the UNIX epoch.
    pub timestamp_ms: u64,
    /// The sender's latest location fix, if it had one.
    pub origin: Option<GeoPosition3D>,
    /// Mono PCM in `[-1, 1]`.
    pub samples: Vec<f32>,
}

impl AudioFrame {
    /// Largest absolute sample value, used for the speaking indicator.
    pub fn peak(&self) -> f32 {
        self.samples.iter().fold(0.0, |peak, s| peak.max(s.abs()))
    }

    /// Checks the frame carries exactly `expected` samples.
    pub fn expect_len(&self, expected: usize) -> Result<(), FrameError> {
        if self.samples.len() == expected {
            Ok(())
        } else {
            Err(FrameError::UnexpectedSize {
                expected,
                actual: self.samples.len(),
            })
        }
    }
}

/// The body of a latency ping. The pong echoes it so the sender can compute the
/// round trip from its own clock alone.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LatencyStamp {
    /// Counts pings per transport.
    pub sequence: u32,
    /// Microseconds on the sender's monotonic clock.
    pub sent_at_us: u64,
}

/// Anything that can travel in one datagram.
#[derive(Debug, Clone, PartialEq)]
pub enum Packet {
    Audio(AudioFrame),
    Ping(LatencyStamp),
    Pong(LatencyStamp),
}

impl Packet {
    /// Serializes the packet into one datagram.
    pub fn encode(&self) -> Result<Vec<u8>, FrameError> {
        match self {
            Packet::Audio(frame) => encode_audio(frame),
            Packet::Ping(stamp) => Ok(encode_stamp(PacketKind::Ping, stamp)),
            Packet::Pong(stamp) => Ok(encode_stamp(PacketKind::Pong, stamp)),
        }
    }
}

/// Parses one datagram. The whole datagram must be consumed.
pub fn decode(datagram: &[u8]) -> Result<Packet, FrameError> {
    all_consuming(parse_packet)(datagram)
        .finish()
        .map(|(_, packet)| packet)
        .map_err(|Error { code, .. }| FrameError::Malformed(code))
}

/// Looks at the header only. Returns `None` for anything that is not one of
/// our packets.
pub fn peek_kind(datagram: &[u8]) -> Option<PacketKind> {
    if datagram.len() < HEADER_LEN || &datagram[..2] != MAGIC || datagram[2] != VERSION {
        return None;
    }
    PacketKind::from_byte(datagram[3])
}

fn encode_audio(frame: &AudioFrame) -> Result<Vec<u8>, FrameError> {
    if frame.samples.len() > MAX_FRAME_SAMPLES {
        return Err(FrameError::TooManySamples(frame.samples.len()));
    }
    for id in [&frame.sender_id, &frame.channel_id] {
        if id.len() > u8::MAX as usize {
            return Err(FrameError::IdentifierTooLong(id.len()));
        }
    }

    let mut buf = Vec::with_capacity(
        HEADER_LEN + 13 + 24 + 2 + frame.sender_id.len() + frame.channel_id.len() + 2
            + frame.samples.len() * 4,
    );
    push_header(&mut buf, PacketKind::Audio);
    buf.extend_from_slice(&frame.sequence.to_be_bytes());
    buf.extend_from_slice(&frame.timestamp_ms.to_be_bytes());
    match frame.origin {
        Some(origin) => {
            buf.push(ORIGIN_FLAG);
            buf.extend_from_slice(&origin.latitude.to_be_bytes());
            buf.extend_from_slice(&origin.longitude.to_be_bytes());
            buf.extend_from_slice(&origin.altitude.to_be_bytes());
        }
        None => buf.push(0),
    }
    for id in [&frame.sender_id, &frame.channel_id] {
        buf.push(id.len() as u8);
        buf.extend_from_slice(id.as_bytes());
    }
    buf.extend_from_slice(&(frame.samples.len() as u16).to_be_bytes());
    buf.extend(frame.samples.iter().flat_map(|s| s.to_be_bytes()));

    Ok(buf)
}

fn encode_stamp(kind: PacketKind, stamp: &LatencyStamp) -> Vec<u8> {
    let mut buf = Vec::with_capacity(HEADER_LEN + 12);
    push_header(&mut buf, kind);
    buf.extend_from_slice(&stamp.sequence.to_be_bytes());
    buf.extend_from_slice(&stamp.sent_at_us.to_be_bytes());
    buf
}

fn push_header(buf: &mut Vec<u8>, kind: PacketKind) {
    buf.extend_from_slice(MAGIC);
    buf.push(VERSION);
    buf.push(kind as u8);
}

fn parse_kind(input: &[u8]) -> IResult<&[u8], PacketKind> {
    let (input, _) = tag(MAGIC)(input)?;
    let (input, _) = verify(be_u8, |v: &u8| *v == VERSION)(input)?;
    map_res(be_u8, |b| PacketKind::from_byte(b).ok_or(ErrorKind::Switch))(input)
}

fn parse_identifier(input: &[u8]) -> IResult<&[u8], String> {
    map_res(length_data(be_u8), |bytes: &[u8]| {
        std::str::from_utf8(bytes).map(str::to_owned)
    })(input)
}

fn parse_origin(input: &[u8]) -> IResult<&[u8], GeoPosition3D> {
    map(tuple((be_f64, be_f64, be_f64)), |(latitude, longitude, altitude)| {
        GeoPosition3D::new(latitude, longitude, altitude)
    })(input)
}

fn parse_audio(input: &[u8]) -> IResult<&[u8], AudioFrame> {
    let (input, (sequence, timestamp_ms, flags)) = tuple((be_u32, be_u64, be_u8))(input)?;
    let (input, origin) = cond(flags & ORIGIN_FLAG != 0, parse_origin)(input)?;
    let (input, sender_id) = parse_identifier(input)?;
    let (input, channel_id) = parse_identifier(input)?;
    let (input, n_samples) = verify(be_u16, |n: &u16| *n as usize <= MAX_FRAME_SAMPLES)(input)?;
    let (input, samples) = count(be_f32, n_samples as usize)(input)?;

    Ok((
        input,
        AudioFrame {
            sender_id,
            channel_id,
            sequence,
            timestamp_ms,
            origin,
            samples,
        },
    ))
}

fn parse_stamp(input: &[u8]) -> IResult<&[u8], LatencyStamp> {
    map(tuple((be_u32, be_u64)), |(sequence, sent_at_us)| LatencyStamp {
        sequence,
        sent_at_us,
    })(input)
}

fn parse_packet(input: &[u8]) -> IResult<&[u8], Packet> {
    let (input, kind) = parse_kind(input)?;
    match kind {
        PacketKind::Audio => map(parse_audio, Packet::Audio)(input),
        PacketKind::Ping => map(parse_stamp, Packet::Ping)(input),
        PacketKind::Pong => map(parse_stamp, Packet::Pong)(input),
    }
}
