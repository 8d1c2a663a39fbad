//! Simulated heading, motion and location services.
//!
//! A walker starts at an origin, turns at a steady rate and walks along its
//! heading, with a little noise on every reading. Each stream is delivered
//! through its own feed, just like real sensors would.

use crate::geo::{normalize_degrees, GeoPosition3D, EARTH_RADIUS_M};
use crate::orientation::MotionAttitude;
use crate::sensor_fusion::SensorFeeds;

use log::info;
use rand::prelude::*;
use std::sync::mpsc;
use std::thread;
use std::time::Duration;

enum Signal {
    TurnRate(f64),
    Speed(f64),
    Noise(f64),
    Stop,
}

/// Where the walker starts and how it moves.
#[derive(Debug, Clone, PartialEq)]
pub struct Walk {
    /// Where the walk starts.
    pub origin: GeoPosition3D,
    /// Initial compass heading in degrees.
    pub heading: f64,
    /// Degrees per second, clockwise.
    pub turn_rate: f64,
    /// Meters per second.
    pub speed: f64,
    /// Spread of the reading noise in degrees.
    pub noise: f64,
    /// Time between readings.
    pub period: Duration,
    /// Report the compass as unavailable instead of sending headings.
    pub without_compass: bool,
    /// Report motion as unavailable instead of sending attitudes.
    pub without_motion: bool,
}

impl Default for Walk {
    fn default() -> Self {
        Self {
            origin: GeoPosition3D::new(40.7580, -73.9855, 10.0),
            heading: 0.0,
            turn_rate: 10.0,
            speed: 1.4,
            noise: 0.5,
            period: Duration::from_millis(100),
            without_compass: false,
            without_motion: false,
        }
    }
}

/// The walker's state, advanced one reading at a time.
#[derive(Debug, Clone, PartialEq)]
struct Walker {
    position: GeoPosition3D,
    heading: f64,
    turned: f64,
}

impl Walker {
    fn new(walk: &Walk) -> Self {
        Self {
            position: walk.origin,
            heading: normalize_degrees(walk.heading),
            turned: 0.0,
        }
    }

    fn advance(&mut self, dt: f64, turn_rate: f64, speed: f64) {
        let turn = turn_rate * dt;
        self.heading = normalize_degrees(self.heading + turn);
        self.turned += turn;

        let step = speed * dt / EARTH_RADIUS_M;
        let heading = self.heading.to_radians();
        let latitude = self.position.latitude.to_radians();
        self.position.latitude += (step * heading.cos()).to_degrees();
        self.position.longitude += (step * heading.sin() / latitude.cos().max(1e-9)).to_degrees();
    }

    /// Device attitude grows counter-clockwise, opposite to the compass.
    fn attitude(&self) -> MotionAttitude {
        MotionAttitude::new(-self.turned.to_radians(), 0.0, 0.0)
    }
}

/// A running simulation. Stops when dropped or on [stop](Self::stop).
pub struct DummySensors {
    handle: Option<thread::JoinHandle<()>>,
    tx: mpsc::Sender<Signal>,
}

impl DummySensors {
    /// Starts walking, reporting through `feeds`.
    pub fn start(feeds: SensorFeeds, walk: Walk) -> Self {
        let (tx, rx) = mpsc::channel::<Signal>();

        let handle = thread::spawn(move || {
            let mut rng = thread_rng();
            let mut walker = Walker::new(&walk);
            let mut turn_rate = walk.turn_rate;
            let mut speed = walk.speed;
            let mut noise = walk.noise.abs();
            let dt = walk.period.as_secs_f64();

            if walk.without_compass {
                feeds.heading.unavailable();
            }
            if walk.without_motion {
                feeds.motion.unavailable();
            }
            info!("DummySensors : walking from {}", walk.origin);

            loop {
                match rx.try_recv() {
                    Ok(Signal::TurnRate(rate)) => turn_rate = rate,
                    Ok(Signal::Speed(new_speed)) => speed = new_speed,
                    Ok(Signal::Noise(new_noise)) => noise = new_noise.abs(),
                    Ok(Signal::Stop) | Err(mpsc::TryRecvError::Disconnected) => break,
                    Err(mpsc::TryRecvError::Empty) => {}
                }

                let jitter = |rng: &mut ThreadRng| {
                    if noise > 0.0 {
                        rng.gen_range(-noise..noise)
                    } else {
                        0.0
                    }
                };

                if !walk.without_compass {
                    feeds.heading.heading(walker.heading + jitter(&mut rng));
                }
                if !walk.without_motion {
                    let mut attitude = walker.attitude();
                    attitude.pitch = jitter(&mut rng).to_radians();
                    attitude.roll = jitter(&mut rng).to_radians();
                    feeds.motion.attitude(attitude);
                }
                feeds.location.location(walker.position);

                thread::sleep(walk.period);
                walker.advance(dt, turn_rate, speed);
            }
            info!("DummySensors : stopped");
        });

        Self {
            handle: Some(handle),
            tx,
        }
    }

    /// Changes how fast the walker turns from the next reading on.
    pub fn set_turn_rate(&self, degrees_per_second: f64) {
        let _ = self.tx.send(Signal::TurnRate(degrees_per_second));
    }

    /// Changes the walking speed.
    pub fn set_speed(&self, meters_per_second: f64) {
        let _ = self.tx.send(Signal::Speed(meters_per_second));
    }

    /// Changes the spread of the heading noise.
    pub fn set_noise(&self, degrees: f64) {
        let _ = self.tx.send(Signal::Noise(degrees));
    }

    /// Ends the walk and joins its thread.
    pub fn stop(&mut self) {
        let _ = self.tx.send(Signal::Stop);
        if let Some(thread) = self.handle.take() {
            let _ = thread.join();
        }
    }
}

impl Drop for DummySensors {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geo::bearing_and_distance;
    use crate::sensor_fusion::SensorEvent;

    #[test]
    fn walking_north_moves_north() {
        let walk = Walk {
            origin: GeoPosition3D::new(10.0, 20.0, 0.0),
            turn_rate: 0.0,
            speed: 2.0,
            ..Walk::default()
        };
        let mut walker = Walker::new(&walk);
        for _ in 0..100 {
            walker.advance(0.5, 0.0, walk.speed);
        }
        let moved = bearing_and_distance(&walk.origin, &walker.position);
        assert!((moved.distance_meters - 100.0).abs() < 0.1, "{moved}");
        assert!(moved.bearing_degrees < 0.01 || moved.bearing_degrees > 359.99);
    }

    #[test]
    fn turning_keeps_compass_and_attitude_opposite() {
        let mut walker = Walker::new(&Walk {
            heading: 350.0,
            ..Walk::default()
        });
        walker.advance(2.0, 10.0, 0.0);
        assert!((walker.heading - 10.0).abs() < 1e-9);
        assert!((walker.attitude().yaw + 20.0_f64.to_radians()).abs() < 1e-12);
    }

    #[test]
    fn feeds_receive_every_stream() {
        let (tx, rx) = mpsc::channel();
        let mut sensors = DummySensors::start(
            SensorFeeds::new(&tx),
            Walk {
                period: Duration::from_millis(5),
                without_compass: true,
                ..Walk::default()
            },
        );

        let wait = Duration::from_secs(2);
        let mut seen = Vec::new();
        while seen.len() < 6 {
            seen.push(rx.recv_timeout(wait).unwrap());
        }
        sensors.stop();

        assert!(seen
            .iter()
            .any(|e| matches!(e, SensorEvent::Unavailable(crate::sensor_fusion::SensorKind::Heading))));
        assert!(seen.iter().any(|e| matches!(e, SensorEvent::Motion(_))));
        assert!(seen.iter().any(|e| matches!(e, SensorEvent::Location(_))));
        assert!(!seen.iter().any(|e| matches!(e, SensorEvent::Heading(_))));
    }
}
