//! Geographic positions and the bearing/distance between two of them.
//!
//! Distances use the haversine great-circle formula on a spherical Earth of
//! mean radius, combined with the altitude difference by a Pythagorean
//! correction. Bearings are initial great-circle bearings, clockwise from
//! true north.

use serde::{Deserialize, Serialize};
use std::fmt::Display;

/// Mean Earth radius (IUGG), in meters.
pub const EARTH_RADIUS_M: f64 = 6_371_008.8;

/// Bearing reported when the two points coincide and no direction exists.
pub const COINCIDENT_BEARING: f64 = 0.0;

/// A snapshot of a location fix: degrees, degrees, meters.
#[derive(Debug, Clone, Copy, PartialEq, Default, Deserialize, Serialize)]
pub struct GeoPosition3D {
    /// Degrees north of the equator.
    pub latitude: f64,
    /// Degrees east of Greenwich.
    pub longitude: f64,
    /// Meters above sea level.
    pub altitude: f64,
}

impl GeoPosition3D {
    /// Build a position from latitude and longitude in degrees and altitude
    /// in meters.
    pub fn new(latitude: f64, longitude: f64, altitude: f64) -> Self {
        Self {
            latitude,
            longitude,
            altitude,
        }
    }

    /// Shorthand for [bearing_and_distance] from `self` to `other`.
    pub fn bearing_and_distance_to(&self, other: &GeoPosition3D) -> BearingDistance {
        bearing_and_distance(self, other)
    }

    /// The point `distance_meters` away along the great circle leaving at
    /// `bearing_degrees`, at the same altitude.
    pub fn offset(&self, bearing_degrees: f64, distance_meters: f64) -> GeoPosition3D {
        let delta = distance_meters / EARTH_RADIUS_M;
        let theta = bearing_degrees.to_radians();
        let lat1 = self.latitude.to_radians();
        let lon1 = self.longitude.to_radians();

        let lat2 = (lat1.sin() * delta.cos() + lat1.cos() * delta.sin() * theta.cos()).asin();
        let lon2 = lon1
            + (theta.sin() * delta.sin() * lat1.cos()).atan2(delta.cos() - lat1.sin() * lat2.sin());

        GeoPosition3D::new(
            lat2.to_degrees(),
            signed_degrees(lon2.to_degrees()),
            self.altitude,
        )
    }

    fn is_finite(&self) -> bool {
        self.latitude.is_finite() && self.longitude.is_finite() && self.altitude.is_finite()
    }
}

impl Display for GeoPosition3D {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "({:.6}, {:.6}, {:.1}m)",
            self.latitude, self.longitude, self.altitude
        )
    }
}

/// Direction and range from one position to another.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct BearingDistance {
    /// Degrees clockwise from true north, in `[0, 360)`.
    pub bearing_degrees: f64,
    /// Meters, never negative.
    pub distance_meters: f64,
}

impl Display for BearingDistance {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{:.1}° at {:.1}m",
            self.bearing_degrees, self.distance_meters
        )
    }
}

/// Computes the initial bearing and the distance from `from` to `to`.
///
/// Coincident points (and non-finite inputs) give a distance of 0 and a
/// bearing of [COINCIDENT_BEARING] rather than NaN.
pub fn bearing_and_distance(from: &GeoPosition3D, to: &GeoPosition3D) -> BearingDistance {
    if !from.is_finite() || !to.is_finite() {
        return BearingDistance {
            bearing_degrees: COINCIDENT_BEARING,
            distance_meters: 0.0,
        };
    }

    let surface = surface_distance(from, to);
    let climb = (to.altitude - from.altitude).abs();
    let distance_meters = surface.hypot(climb);

    let bearing_degrees = if surface == 0.0 {
        COINCIDENT_BEARING
    } else {
        initial_bearing(from, to)
    };

    BearingDistance {
        bearing_degrees,
        distance_meters,
    }
}

/// Haversine distance along the surface, ignoring altitude.
///
/// The latitude and longitude differences are taken as absolute values so
/// that swapping the endpoints produces a bit-identical result.
fn surface_distance(from: &GeoPosition3D, to: &GeoPosition3D) -> f64 {
    let phi_1 = from.latitude.to_radians();
    let phi_2 = to.latitude.to_radians();
    let d_phi = (to.latitude - from.latitude).abs().to_radians();
    let d_lambda = (to.longitude - from.longitude).abs().to_radians();

    let a = (d_phi / 2.0).sin().powi(2) + phi_1.cos() * phi_2.cos() * (d_lambda / 2.0).sin().powi(2);
    let c = 2.0 * a.sqrt().min(1.0).asin();

    EARTH_RADIUS_M * c
}

fn initial_bearing(from: &GeoPosition3D, to: &GeoPosition3D) -> f64 {
    let phi_1 = from.latitude.to_radians();
    let phi_2 = to.latitude.to_radians();
    let d_lambda = (to.longitude - from.longitude).to_radians();

    let y = d_lambda.sin() * phi_2.cos();
    let x = phi_1.cos() * phi_2.sin() - phi_1.sin() * phi_2.cos() * d_lambda.cos();

    normalize_degrees(y.atan2(x).to_degrees())
}

/// Wraps any finite angle into `[0, 360)`.
pub fn normalize_degrees(degrees: f64) -> f64 {
    let wrapped = degrees.rem_euclid(360.0);
    // rem_euclid can round up to exactly 360.0 for tiny negative inputs
    if wrapped >= 360.0 {
        0.0
    } else {
        wrapped
    }
}

/// Wraps any finite angle into `(-180, 180]`.
pub fn signed_degrees(degrees: f64) -> f64 {
    let wrapped = normalize_degrees(degrees);
    if wrapped > 180.0 {
        wrapped - 360.0
    } else {
        wrapped
    }
}
