use std::fmt::Display;
use std::str::FromStr;
use std::time::Instant;

use regex::Regex;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use tracing::{debug, info, warn};

use crate::{
    astro::{to_galactic, DustMap, Ephemeris, Equatorial},
    voevent::{AlertDocument, PacketType},
    Error, Result,
};

/// Allow-list of packet types as a set of inclusive ranges.
///
/// Parses from and serializes to a list whose entries are either a single packet type or a
/// `"start-end"` range string, e.g., `[60, 61, "110-130"]`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PacketFilter(Vec<(PacketType, PacketType)>);

impl Default for PacketFilter {
    fn default() -> Self {
        PacketFilter(vec![(0, 999)])
    }
}

impl PacketFilter {
    pub fn new(ranges: Vec<(PacketType, PacketType)>) -> Self {
        PacketFilter(ranges)
    }

    #[must_use]
    pub fn contains(&self, packet_type: PacketType) -> bool {
        self.0
            .iter()
            .any(|(start, end)| (*start..=*end).contains(&packet_type))
    }
}

impl FromIterator<PacketType> for PacketFilter {
    fn from_iter<T: IntoIterator<Item = PacketType>>(iter: T) -> Self {
        PacketFilter(iter.into_iter().map(|t| (t, t)).collect())
    }
}

impl FromStr for PacketFilter {
    type Err = Error;

    /// Parse a CSV of packet types and `start-end` ranges.
    fn from_str(s: &str) -> Result<Self> {
        let rx = Regex::new(r"^(?:(\d+)|(\d+)-(\d+))$").expect("regex to compile");
        let mut ranges = Vec::default();
        for (i, part) in s.split(',').map(str::trim).enumerate() {
            let invalid =
                || Error::Config(format!("invalid packet type or range at {i}: {part:?}"));
            let Some(cap) = rx.captures(part) else {
                return Err(invalid());
            };
            let parse = |m: usize| cap[m].parse::<PacketType>().map_err(|_| invalid());
            let range = if cap.get(1).is_some() {
                let v = parse(1)?;
                (v, v)
            } else {
                let (start, end) = (parse(2)?, parse(3)?);
                if start > end {
                    return Err(invalid());
                }
                (start, end)
            };
            ranges.push(range);
        }
        Ok(PacketFilter(ranges))
    }
}

impl Display for PacketFilter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let parts: Vec<String> = self
            .0
            .iter()
            .map(|(start, end)| {
                if start == end {
                    start.to_string()
                } else {
                    format!("{start}-{end}")
                }
            })
            .collect();
        write!(f, "{}", parts.join(","))
    }
}

#[derive(Serialize, Deserialize)]
#[serde(untagged)]
enum PacketEntry {
    Single(PacketType),
    Range(String),
}

impl Serialize for PacketFilter {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        let entries: Vec<PacketEntry> = self
            .0
            .iter()
            .map(|(start, end)| {
                if start == end {
                    PacketEntry::Single(*start)
                } else {
                    PacketEntry::Range(format!("{start}-{end}"))
                }
            })
            .collect();
        entries.serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for PacketFilter {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let entries = Vec::<PacketEntry>::deserialize(deserializer)?;
        let mut ranges = Vec::with_capacity(entries.len());
        for entry in entries {
            match entry {
                PacketEntry::Single(v) => ranges.push((v, v)),
                PacketEntry::Range(s) => {
                    let parsed: PacketFilter = s.parse().map_err(serde::de::Error::custom)?;
                    ranges.extend(parsed.0);
                }
            }
        }
        Ok(PacketFilter(ranges))
    }
}

/// Admission thresholds. Altitude and moon distance are in degrees.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Criteria {
    pub packets: PacketFilter,
    pub min_alt: f64,
    pub ebv_max: f64,
    pub min_moondist: f64,
}

impl Default for Criteria {
    fn default() -> Self {
        Criteria {
            packets: PacketFilter::default(),
            min_alt: -999.0,
            ebv_max: 999.0,
            min_moondist: 10.0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Rejection {
    InvalidPosition(String),
    PacketType,
    Altitude,
    Extinction,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "snake_case", tag = "verdict", content = "reason")]
pub enum Verdict {
    Accepted,
    Rejected(Rejection),
}

/// Outcome of the admission filters for one alert along with the values measured on the way.
/// Values for filters that were not reached are `None`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AdmissionDecision {
    pub ivorn: String,
    pub packet_type: Option<PacketType>,
    #[serde(flatten)]
    pub verdict: Verdict,
    pub position: Option<Equatorial>,
    pub altitude: Option<f64>,
    pub ebv: Option<f64>,
    pub moon_distance: Option<f64>,
}

impl AdmissionDecision {
    fn new(alert: &AlertDocument) -> Self {
        AdmissionDecision {
            ivorn: alert.ivorn.clone(),
            packet_type: alert.packet_type,
            verdict: Verdict::Accepted,
            position: None,
            altitude: None,
            ebv: None,
            moon_distance: None,
        }
    }

    fn reject(mut self, rejection: Rejection) -> Self {
        self.verdict = Verdict::Rejected(rejection);
        self
    }

    #[must_use]
    pub fn is_accepted(&self) -> bool {
        self.verdict == Verdict::Accepted
    }
}

/// Applies the admission filters to alerts.
///
/// Filters run in order: position validity, packet type, altitude, extinction, and finally
/// the moon distance, which is advisory and never rejects.
pub struct DecisionEngine {
    criteria: Criteria,
    ephemeris: Box<dyn Ephemeris>,
    dust: Box<dyn DustMap>,
}

impl DecisionEngine {
    pub fn new(criteria: Criteria, ephemeris: Box<dyn Ephemeris>, dust: Box<dyn DustMap>) -> Self {
        DecisionEngine {
            criteria,
            ephemeris,
            dust,
        }
    }

    #[must_use]
    pub fn criteria(&self) -> &Criteria {
        &self.criteria
    }

    #[must_use]
    pub fn ephemeris(&self) -> &dyn Ephemeris {
        self.ephemeris.as_ref()
    }

    /// Evaluate `alert` at the ephemeris' current time.
    ///
    /// # Errors
    /// If the ephemeris or dust map fail. Rejections are not errors.
    pub fn evaluate(&self, alert: &AlertDocument) -> Result<AdmissionDecision> {
        let t0 = Instant::now();
        let decision = self.do_evaluate(alert)?;
        debug!(
            ivorn = %alert.ivorn,
            elapsed = ?t0.elapsed(),
            "total analysis time"
        );
        Ok(decision)
    }

    fn do_evaluate(&self, alert: &AlertDocument) -> Result<AdmissionDecision> {
        let mut decision = AdmissionDecision::new(alert);

        let position = match alert.position() {
            Ok(p) => p,
            Err(err) => {
                warn!(ivorn = %alert.ivorn, %err, "rejecting alert with invalid position");
                return Ok(decision.reject(Rejection::InvalidPosition(err.to_string())));
            }
        };
        decision.position = Some(position);

        if !alert
            .packet_type
            .is_some_and(|t| self.criteria.packets.contains(t))
        {
            debug!(
                ivorn = %alert.ivorn,
                packet_type = alert.packet_type,
                packets = %self.criteria.packets,
                "reject alert type"
            );
            return Ok(decision.reject(Rejection::PacketType));
        }

        let now = self.ephemeris.now();
        let target = self.ephemeris.alt_az(position, now)?;
        decision.altitude = Some(target.alt);
        if target.alt < self.criteria.min_alt {
            debug!(
                ivorn = %alert.ivorn,
                packet_type = alert.packet_type,
                alt = target.alt,
                ra = position.ra,
                dec = position.dec,
                min_alt = self.criteria.min_alt,
                "reject alert below minimum altitude"
            );
            return Ok(decision.reject(Rejection::Altitude));
        }

        let ebv = self.dust.ebv(to_galactic(position))?;
        decision.ebv = Some(ebv);
        if ebv > self.criteria.ebv_max {
            debug!(
                ivorn = %alert.ivorn,
                ebv,
                ebv_max = self.criteria.ebv_max,
                "reject alert above maximum extinction"
            );
            return Ok(decision.reject(Rejection::Extinction));
        }

        let moon = self.ephemeris.moon_position(now)?;
        let moon_distance = target.separation(&moon);
        decision.moon_distance = Some(moon_distance);
        if moon_distance < self.criteria.min_moondist {
            warn!(
                ivorn = %alert.ivorn,
                moon_distance,
                min_moondist = self.criteria.min_moondist,
                "moon is NOT OK, observing anyway"
            );
        } else {
            debug!(ivorn = %alert.ivorn, moon_distance, "moon is OK");
        }

        info!(
            ivorn = %alert.ivorn,
            alt = target.alt,
            ebv,
            moon_distance,
            "alert accepted"
        );
        Ok(decision)
    }
}
