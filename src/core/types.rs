// src/core/types.rs - Core domain types

use chrono::{DateTime, NaiveDateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use std::collections::BTreeMap;

/// A study session as recorded by the server.
///
/// `hours == None` means the session is still in progress.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StudySession {
    pub id: i64,
    #[serde(deserialize_with = "deserialize_instant")]
    pub start_time: DateTime<Utc>,
    #[serde(default)]
    pub hours: Option<f64>,
    #[serde(default)]
    pub location: Option<i64>,
    #[serde(default)]
    pub period_instance: Option<i64>,
}

impl StudySession {
    pub fn is_open(&self) -> bool {
        self.hours.is_none()
    }
}

/// An organization location with its geofence parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Location {
    pub id: i64,
    #[serde(default)]
    pub name: String,
    pub gps_lat: f64,
    pub gps_long: f64,
    /// Radius in meters
    pub gps_radius: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PeriodInstance {
    pub id: i64,
    #[serde(default)]
    pub start: Option<String>,
    #[serde(default)]
    pub end: Option<String>,
}

/// Response body of `GET /api/dashboard/`.
///
/// Fields this crate does not interpret are kept in `extra` so the cached
/// snapshot round-trips the full payload.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DashboardSnapshot {
    #[serde(default)]
    pub user_sessions: Vec<StudySession>,
    #[serde(default)]
    pub org_locations: Vec<Location>,
    #[serde(default)]
    pub org_period_instances: Vec<PeriodInstance>,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

impl DashboardSnapshot {
    pub fn location(&self, id: i64) -> Option<&Location> {
        self.org_locations.iter().find(|l| l.id == id)
    }

    /// Geofence regions to watch while studying at `location_id`.
    pub fn regions_for_location(&self, location_id: i64) -> Vec<GeofenceRegion> {
        self.location(location_id)
            .map(GeofenceRegion::from_location)
            .into_iter()
            .collect()
    }

    /// Hours across all closed sessions.
    pub fn total_hours(&self) -> f64 {
        self.user_sessions.iter().filter_map(|s| s.hours).sum()
    }

    /// Closed-session hours bucketed by period instance (`None` = unassigned).
    pub fn hours_by_period(&self) -> BTreeMap<Option<i64>, f64> {
        let mut buckets = BTreeMap::new();
        for session in &self.user_sessions {
            if let Some(hours) = session.hours {
                *buckets.entry(session.period_instance).or_insert(0.0) += hours;
            }
        }
        buckets
    }
}

/// A circular region watched for entry/exit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GeofenceRegion {
    pub identifier: String,
    pub latitude: f64,
    pub longitude: f64,
    pub radius_m: f64,
}

impl GeofenceRegion {
    pub fn from_location(location: &Location) -> Self {
        Self {
            identifier: region_id_for_location(location.id),
            latitude: location.gps_lat,
            longitude: location.gps_long,
            radius_m: location.gps_radius,
        }
    }
}

pub fn region_id_for_location(location_id: i64) -> String {
    format!("location-{location_id}")
}

/// The server session the user is currently clocked into.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ActiveSession {
    pub session_id: i64,
    pub started_at: DateTime<Utc>,
    pub location_id: Option<i64>,
}

impl ActiveSession {
    pub fn from_session(session: &StudySession) -> Self {
        Self {
            session_id: session.id,
            started_at: session.start_time,
            location_id: session.location,
        }
    }

    /// Region that must stay occupied for this session, if it has a location.
    pub fn region_id(&self) -> Option<String> {
        self.location_id.map(region_id_for_location)
    }
}

/// Derived, never persisted. Rebuilt from server data on every start/refresh.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum SessionState {
    Idle,
    Studying(ActiveSession),
    GraceWaitingForReentry {
        session: ActiveSession,
        region_id: String,
        exit_at: DateTime<Utc>,
        deadline: DateTime<Utc>,
    },
}

impl SessionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Studying(_) => "studying",
            Self::GraceWaitingForReentry { .. } => "grace_waiting_for_reentry",
        }
    }

    /// True while the server holds an open session for the user.
    pub fn is_open(&self) -> bool {
        !matches!(self, Self::Idle)
    }

    pub fn active_session(&self) -> Option<&ActiveSession> {
        match self {
            Self::Idle => None,
            Self::Studying(session) => Some(session),
            Self::GraceWaitingForReentry { session, .. } => Some(session),
        }
    }
}

impl std::fmt::Display for SessionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Accepts RFC 3339 timestamps and naive ISO timestamps (taken as UTC).
fn deserialize_instant<'de, D>(deserializer: D) -> Result<DateTime<Utc>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw = String::deserialize(deserializer)?;
    parse_instant(&raw).ok_or_else(|| serde::de::Error::custom(format!("invalid instant '{raw}'")))
}

pub fn parse_instant(raw: &str) -> Option<DateTime<Utc>> {
    let raw = raw.trim();
    if let Ok(dt) = DateTime::parse_from_rfc3339(raw) {
        return Some(dt.with_timezone(&Utc));
    }
    NaiveDateTime::parse_from_str(raw, "%Y-%m-%dT%H:%M:%S%.f")
        .or_else(|_| NaiveDateTime::parse_from_str(raw, "%Y-%m-%d %H:%M:%S%.f"))
        .ok()
        .map(|naive| naive.and_utc())
}
