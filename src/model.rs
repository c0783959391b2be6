// Core domain types shared by the scanner, selector and booking layers.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

/// Category of service offered by a slot (e.g. a vaccine brand).
/// Names are normalized to lowercase so filters match regardless of the
/// spelling used by individual sites.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ResourceKind(String);

impl ResourceKind {
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into().trim().to_lowercase())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Which visit number of a multi-visit sequence a slot satisfies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SequenceStage {
    First,
    Second,
    Third,
}

impl fmt::Display for SequenceStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SequenceStage::First => "first",
            SequenceStage::Second => "second",
            SequenceStage::Third => "third",
        };
        f.write_str(name)
    }
}

impl FromStr for SequenceStage {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "first" | "1" => Ok(SequenceStage::First),
            "second" | "2" => Ok(SequenceStage::Second),
            "third" | "3" => Ok(SequenceStage::Third),
            other => Err(format!("unknown sequence stage '{other}'")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GeoPoint {
    pub latitude: f64,
    pub longitude: f64,
}

impl GeoPoint {
    /// Equirectangular approximation, good enough for ranking sites
    /// within one metropolitan area.
    pub fn distance_km(&self, other: &GeoPoint) -> f64 {
        const EARTH_RADIUS_KM: f64 = 6371.0;
        let lat1 = self.latitude.to_radians();
        let lat2 = other.latitude.to_radians();
        let x = (other.longitude - self.longitude).to_radians() * ((lat1 + lat2) / 2.0).cos();
        let y = lat2 - lat1;
        (x * x + y * y).sqrt() * EARTH_RADIUS_KM
    }
}

/// A bookable physical or virtual location offering appointments.
/// Immutable for the lifetime of one run once resolved.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Site {
    pub id: String,
    pub name: String,
    pub postal_code: String,
    pub location: Option<GeoPoint>,
    /// Opaque token the transport layer needs to reach this site.
    pub booking_handle: String,
}

/// One concrete bookable opportunity at a site. Slots are ephemeral:
/// validity is asserted only at scan time and a slot may vanish between
/// scan and booking attempt.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Slot {
    pub site_id: String,
    pub start: DateTime<Utc>,
    pub kind: ResourceKind,
    pub stage: SequenceStage,
    /// Later-stage slots the service reports as linked to this one.
    /// Informational only; the engine never books them.
    #[serde(default)]
    pub follow_ups: Vec<DateTime<Utc>>,
    /// Minimum recipient age required by this slot's resource kind, if any.
    #[serde(default)]
    pub min_age: Option<u32>,
    /// Site-scoped opaque booking reference.
    pub booking_ref: String,
}

/// The person an appointment is booked for.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Recipient {
    pub id: String,
    pub display_name: String,
    #[serde(default)]
    pub birth_date: Option<NaiveDate>,
    /// How many sequence stages this recipient has already completed.
    #[serde(default)]
    pub doses_received: u8,
}

impl Recipient {
    /// Stage that is due next according to the stored history.
    pub fn due_stage(&self) -> SequenceStage {
        match self.doses_received {
            0 => SequenceStage::First,
            1 => SequenceStage::Second,
            _ => SequenceStage::Third,
        }
    }

    pub fn age_on(&self, date: NaiveDate) -> Option<u32> {
        date.years_since(self.birth_date?)
    }
}

/// Result of a successful booking transaction.
#[derive(Debug, Clone)]
pub struct ConfirmedBooking {
    pub slot: Slot,
    pub recipient_id: String,
    pub confirmation_code: Option<String>,
}

/// Terminal state of one booking transaction attempt. Created once per
/// attempt, never mutated.
#[derive(Debug, Clone)]
pub enum BookingOutcome {
    Booked(ConfirmedBooking),
    /// Another actor booked the slot first. Non-fatal.
    SlotGone,
    /// The service refused the booking. Fatal for this attempt only.
    Rejected(String),
    /// Network or server failure; retried on the next pass.
    TransientError(String),
}
