// Resolved search parameters for one acquisition run.

use chrono::{NaiveDate, Weekday};
use regex::Regex;
use thiserror::Error;

use crate::model::{GeoPoint, ResourceKind, SequenceStage};

#[derive(Error, Debug)]
pub enum ConstraintError {
    #[error("invalid date window: start {start} is after end {end}")]
    InvalidWindow { start: NaiveDate, end: NaiveDate },

    #[error("no location query given")]
    NoLocations,

    #[error("unknown weekday '{0}'")]
    UnknownWeekday(String),
}

/// One location the user wants to search, before resolution into sites.
#[derive(Debug, Clone)]
pub struct LocationQuery {
    pub name: String,
    pub postal_hint: Option<String>,
    pub include_neighbors: bool,
}

impl LocationQuery {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            postal_hint: None,
            include_neighbors: false,
        }
    }

    pub fn with_neighbors(mut self, include: bool) -> Self {
        self.include_neighbors = include;
        self
    }
}

/// Inclusive date range in which the first qualifying slot must start.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DateWindow {
    start: NaiveDate,
    end: NaiveDate,
}

impl DateWindow {
    pub fn new(start: NaiveDate, end: NaiveDate) -> Result<Self, ConstraintError> {
        if start > end {
            return Err(ConstraintError::InvalidWindow { start, end });
        }
        Ok(Self { start, end })
    }

    pub fn start(&self) -> NaiveDate {
        self.start
    }

    pub fn end(&self) -> NaiveDate {
        self.end
    }

    pub fn contains(&self, date: NaiveDate) -> bool {
        date >= self.start && date <= self.end
    }
}

/// Everything the engine needs to know about what the user wants.
/// Owned by the acquisition loop for the lifetime of one run.
#[derive(Debug, Clone)]
pub struct ConstraintSet {
    pub locations: Vec<LocationQuery>,
    /// Acceptable resource kinds. Empty means no restriction.
    pub resource_filter: Vec<ResourceKind>,
    /// Requested sequence stage; when unset the recipient's history decides.
    pub sequence_stage: Option<SequenceStage>,
    pub window: DateWindow,
    pub weekday_exclusions: Vec<Weekday>,
    pub site_include: Vec<String>,
    pub site_exclude: Vec<String>,
    pub site_include_regex: Option<Regex>,
    pub site_exclude_regex: Option<Regex>,
    pub postal_filter: Option<String>,
    /// Starting point used to break ties between equally early slots.
    pub origin: Option<GeoPoint>,
    /// Never submit a real booking; qualifying slots count as booked.
    pub dry_run: bool,
    /// Ask the confirmation collaborator before submitting.
    pub require_confirmation: bool,
}

impl ConstraintSet {
    pub fn new(locations: Vec<LocationQuery>, window: DateWindow) -> Result<Self, ConstraintError> {
        if locations.is_empty() {
            return Err(ConstraintError::NoLocations);
        }
        Ok(Self {
            locations,
            resource_filter: Vec::new(),
            sequence_stage: None,
            window,
            weekday_exclusions: Vec::new(),
            site_include: Vec::new(),
            site_exclude: Vec::new(),
            site_include_regex: None,
            site_exclude_regex: None,
            postal_filter: None,
            origin: None,
            dry_run: false,
            require_confirmation: false,
        })
    }

    pub fn accepts_kind(&self, kind: &ResourceKind) -> bool {
        self.resource_filter.is_empty() || self.resource_filter.contains(kind)
    }

    pub fn excludes_weekday(&self, weekday: Weekday) -> bool {
        self.weekday_exclusions.contains(&weekday)
    }
}

/// Parses user-supplied weekday names ("monday", "Tue", "FRIDAY").
pub fn parse_weekdays(names: &[String]) -> Result<Vec<Weekday>, ConstraintError> {
    let mut out = Vec::new();
    for name in names {
        let day = name
            .parse::<Weekday>()
            .map_err(|_| ConstraintError::UnknownWeekday(name.clone()))?;
        if !out.contains(&day) {
            out.push(day);
        }
    }
    Ok(out)
}
