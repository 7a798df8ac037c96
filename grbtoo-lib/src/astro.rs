//! Coordinates and the ephemeris and dust-map collaborators used to decide whether an event is
//! observable.
//!
//! The built-in [Site] ephemeris uses the IAU 1982 GMST expression and a low-precision lunar
//! theory (Astronomical Almanac, good to a few tenths of a degree), which is sufficient for
//! altitude limits and a moon-distance advisory. Precise astrometry belongs to the observatory
//! control system.
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{Error, Result};

/// Equatorial (J2000) coordinates in degrees.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Equatorial {
    pub ra: f64,
    pub dec: f64,
}

/// Horizontal coordinates in degrees. Azimuth is measured from north through east.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Horizontal {
    pub alt: f64,
    pub az: f64,
}

/// Galactic coordinates in degrees.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Galactic {
    pub l: f64,
    pub b: f64,
}

impl Equatorial {
    #[must_use]
    pub fn separation(&self, other: &Equatorial) -> f64 {
        angular_separation(self.ra, self.dec, other.ra, other.dec)
    }
}

impl Horizontal {
    #[must_use]
    pub fn separation(&self, other: &Horizontal) -> f64 {
        angular_separation(self.az, self.alt, other.az, other.alt)
    }
}

/// Great-circle distance in degrees between two points given as (longitude, latitude) in
/// degrees, using the Vincenty formula which is stable at all separations.
#[must_use]
pub fn angular_separation(lon1: f64, lat1: f64, lon2: f64, lat2: f64) -> f64 {
    let (lon1, lat1, lon2, lat2) = (
        lon1.to_radians(),
        lat1.to_radians(),
        lon2.to_radians(),
        lat2.to_radians(),
    );
    let dlon = lon2 - lon1;
    let num1 = lat2.cos() * dlon.sin();
    let num2 = lat1.cos() * lat2.sin() - lat1.sin() * lat2.cos() * dlon.cos();
    let denom = lat1.sin() * lat2.sin() + lat1.cos() * lat2.cos() * dlon.cos();
    num1.hypot(num2).atan2(denom).to_degrees()
}

// J2000 equatorial to galactic rotation.
const GALACTIC_MATRIX: [[f64; 3]; 3] = [
    [-0.054_875_560_416_215_4, -0.873_437_090_234_885, -0.483_835_015_548_713_2],
    [0.494_109_427_875_583_7, -0.444_829_629_960_011_2, 0.746_982_244_497_218_9],
    [-0.867_666_149_019_004_7, -0.198_076_373_431_201_5, 0.455_983_776_175_066_9],
];

/// Convert J2000 equatorial coordinates to galactic coordinates.
#[must_use]
pub fn to_galactic(eq: Equatorial) -> Galactic {
    let (ra, dec) = (eq.ra.to_radians(), eq.dec.to_radians());
    let v = [dec.cos() * ra.cos(), dec.cos() * ra.sin(), dec.sin()];
    let g: Vec<f64> = GALACTIC_MATRIX
        .iter()
        .map(|row| row[0] * v[0] + row[1] * v[1] + row[2] * v[2])
        .collect();
    Galactic {
        l: normalize_degrees(g[1].atan2(g[0]).to_degrees()),
        b: g[2].clamp(-1.0, 1.0).asin().to_degrees(),
    }
}

fn normalize_degrees(deg: f64) -> f64 {
    deg.rem_euclid(360.0)
}

fn julian_date(time: DateTime<Utc>) -> f64 {
    let secs = time.timestamp() as f64 + f64::from(time.timestamp_subsec_nanos()) * 1e-9;
    secs / 86400.0 + 2_440_587.5
}

/// Greenwich mean sidereal time in degrees.
#[must_use]
pub fn gmst(time: DateTime<Utc>) -> f64 {
    let d = julian_date(time) - 2_451_545.0;
    let t = d / 36525.0;
    normalize_degrees(
        280.460_618_37 + 360.985_647_366_29 * d + 0.000_387_933 * t * t - t * t * t / 38_710_000.0,
    )
}

/// Geocentric equatorial position of the Moon.
#[must_use]
pub fn moon_equatorial(time: DateTime<Utc>) -> Equatorial {
    let t = (julian_date(time) - 2_451_545.0) / 36525.0;
    let sind = |deg: f64| deg.to_radians().sin();

    let lambda = 218.32 + 481_267.881 * t + 6.29 * sind(135.0 + 477_198.87 * t)
        - 1.27 * sind(259.3 - 413_335.36 * t)
        + 0.66 * sind(235.7 + 890_534.22 * t)
        + 0.21 * sind(269.9 + 954_397.74 * t)
        - 0.19 * sind(357.5 + 35_999.05 * t)
        - 0.11 * sind(186.5 + 966_404.03 * t);
    let beta = 5.13 * sind(93.3 + 483_202.02 * t) + 0.28 * sind(228.2 + 960_400.89 * t)
        - 0.28 * sind(318.3 + 6_003.15 * t)
        - 0.17 * sind(217.6 - 407_332.21 * t);
    let eps = (23.439_3 - 0.013 * t).to_radians();

    let (lambda, beta) = (lambda.to_radians(), beta.to_radians());
    let ra = (lambda.sin() * eps.cos() - beta.tan() * eps.sin()).atan2(lambda.cos());
    let dec = (beta.sin() * eps.cos() + beta.cos() * eps.sin() * lambda.sin()).asin();
    Equatorial {
        ra: normalize_degrees(ra.to_degrees()),
        dec: dec.to_degrees(),
    }
}

/// Parse a right ascension given either in decimal degrees or sexagesimal hours
/// (`HH:MM:SS.S`).
///
/// # Errors
/// [Error::InvalidPosition] if the value cannot be parsed or is not finite.
pub fn parse_ra(s: &str) -> Result<f64> {
    let s = s.trim();
    let deg = if s.contains(':') {
        parse_sexagesimal(s)? * 15.0
    } else {
        parse_finite(s)?
    };
    Ok(normalize_degrees(deg))
}

/// Parse a declination given either in decimal degrees or sexagesimal degrees
/// (`±DD:MM:SS.S`).
///
/// # Errors
/// [Error::InvalidPosition] if the value cannot be parsed or is outside ±90.
pub fn parse_dec(s: &str) -> Result<f64> {
    let s = s.trim();
    let deg = if s.contains(':') {
        parse_sexagesimal(s)?
    } else {
        parse_finite(s)?
    };
    if !(-90.0..=90.0).contains(&deg) {
        return Err(Error::InvalidPosition(format!("declination {s} out of range")));
    }
    Ok(deg)
}

fn parse_finite(s: &str) -> Result<f64> {
    match s.parse::<f64>() {
        Ok(v) if v.is_finite() => Ok(v),
        _ => Err(Error::InvalidPosition(format!("{s:?} is not a number"))),
    }
}

fn parse_sexagesimal(s: &str) -> Result<f64> {
    let negative = s.starts_with('-');
    let parts: Vec<&str> = s.trim_start_matches(['-', '+']).split(':').collect();
    if parts.is_empty() || parts.len() > 3 {
        return Err(Error::InvalidPosition(format!("{s:?} is not sexagesimal")));
    }
    let mut value = 0.0;
    for (i, part) in parts.iter().enumerate() {
        let v = parse_finite(part)?;
        if v < 0.0 || (i > 0 && v >= 60.0) {
            return Err(Error::InvalidPosition(format!("{s:?} is not sexagesimal")));
        }
        value += v / 60f64.powi(i32::try_from(i).unwrap_or(0));
    }
    Ok(if negative { -value } else { value })
}

/// Source of time and sky positions for an observing site.
pub trait Ephemeris: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
    fn alt_az(&self, target: Equatorial, time: DateTime<Utc>) -> Result<Horizontal>;
    fn moon_position(&self, time: DateTime<Utc>) -> Result<Horizontal>;
}

/// Geographic location of the observatory.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Site {
    /// Geodetic latitude in degrees, north positive.
    pub latitude: f64,
    /// Longitude in degrees, east positive.
    pub longitude: f64,
    /// Elevation in metres.
    #[serde(default)]
    pub elevation: f64,
}

impl Default for Site {
    // Observatorio Astronomico do Pico dos Dias, Brazil
    fn default() -> Self {
        Site {
            latitude: -22.5344,
            longitude: -45.5825,
            elevation: 1864.0,
        }
    }
}

impl Site {
    /// Local sidereal time in degrees.
    #[must_use]
    pub fn lst(&self, time: DateTime<Utc>) -> f64 {
        normalize_degrees(gmst(time) + self.longitude)
    }

    #[must_use]
    pub fn horizontal(&self, target: Equatorial, time: DateTime<Utc>) -> Horizontal {
        let h = (self.lst(time) - target.ra).to_radians();
        let (dec, lat) = (target.dec.to_radians(), self.latitude.to_radians());

        let sin_alt = lat.sin() * dec.sin() + lat.cos() * dec.cos() * h.cos();
        let alt = sin_alt.clamp(-1.0, 1.0).asin();
        let az = (-dec.cos() * h.sin()).atan2(dec.sin() * lat.cos() - dec.cos() * h.cos() * lat.sin());
        Horizontal {
            alt: alt.to_degrees(),
            az: normalize_degrees(az.to_degrees()),
        }
    }
}

impl Ephemeris for Site {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }

    fn alt_az(&self, target: Equatorial, time: DateTime<Utc>) -> Result<Horizontal> {
        Ok(self.horizontal(target, time))
    }

    fn moon_position(&self, time: DateTime<Utc>) -> Result<Horizontal> {
        Ok(self.horizontal(moon_equatorial(time), time))
    }
}

/// Line-of-sight dust extinction lookup.
pub trait DustMap: Send + Sync {
    /// E(B-V) in magnitudes toward `position`.
    fn ebv(&self, position: Galactic) -> Result<f64>;
}

/// Dust map returning the same extinction everywhere. Used when no survey map is available.
#[derive(Debug, Clone, Copy, Default)]
pub struct UniformDust(pub f64);

impl DustMap for UniformDust {
    fn ebv(&self, _position: Galactic) -> Result<f64> {
        Ok(self.0)
    }
}
