use std::io;

use async_trait::async_trait;
use dashmap::DashMap;
use serde::Deserialize;

use crate::limits::{MAX_SLOT_LEN_MIN, MIN_SLOT_LEN_MIN};
use crate::model::{parse_hhmm, GarageId, MinuteOfDay};

#[derive(Debug)]
pub enum DirectoryError {
    GarageNotFound(GarageId),
    Unavailable(String),
}

impl std::fmt::Display for DirectoryError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DirectoryError::GarageNotFound(id) => write!(f, "garage not found: {id}"),
            DirectoryError::Unavailable(e) => write!(f, "directory unavailable: {e}"),
        }
    }
}

impl std::error::Error for DirectoryError {}

/// A garage's operating shape. Read once per day materialization; a garage
/// that later changes hours or staffing does not retroactively reshape
/// already-materialized days.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GarageProfile {
    pub open_min: MinuteOfDay,
    pub close_min: MinuteOfDay,
    pub slot_len_min: u16,
    /// Fixed UTC offset defining the garage's civil day.
    pub utc_offset_min: i32,
}

/// Read-only capacity inputs owned by the out-of-scope garage/mechanic CRUD.
#[async_trait]
pub trait GarageDirectory: Send + Sync {
    async fn profile(&self, garage_id: GarageId) -> Result<GarageProfile, DirectoryError>;
    async fn active_mechanic_count(&self, garage_id: GarageId) -> Result<u32, DirectoryError>;
    async fn service_bay_count(&self, garage_id: GarageId) -> Result<u32, DirectoryError>;
}

#[derive(Debug, Clone)]
pub struct GarageRecord {
    pub profile: GarageProfile,
    pub mechanics: u32,
    pub bays: u32,
}

/// Fixed garage roster loaded at startup.
pub struct StaticDirectory {
    garages: DashMap<GarageId, GarageRecord>,
}

impl Default for StaticDirectory {
    fn default() -> Self {
        Self::new()
    }
}

impl StaticDirectory {
    pub fn new() -> Self {
        Self {
            garages: DashMap::new(),
        }
    }

    pub fn insert(&self, id: GarageId, record: GarageRecord) {
        self.garages.insert(id, record);
    }

    pub fn garage_count(&self) -> usize {
        self.garages.len()
    }

    /// Load a roster from the JSON config format:
    /// `{"garages": [{"id", "open", "close", "slot_minutes",
    ///   "utc_offset_minutes", "mechanics", "bays"}]}`
    pub fn from_json(text: &str) -> io::Result<Self> {
        let config: GarageConfig = serde_json::from_str(text)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
        let dir = Self::new();
        for entry in config.garages {
            let open_min = parse_hhmm(&entry.open).ok_or_else(|| {
                io::Error::new(
                    io::ErrorKind::InvalidData,
                    format!("garage {}: bad open time {:?}", entry.id, entry.open),
                )
            })?;
            let close_min = parse_hhmm(&entry.close).ok_or_else(|| {
                io::Error::new(
                    io::ErrorKind::InvalidData,
                    format!("garage {}: bad close time {:?}", entry.id, entry.close),
                )
            })?;
            if open_min > close_min {
                return Err(io::Error::new(
                    io::ErrorKind::InvalidData,
                    format!("garage {}: opens after it closes", entry.id),
                ));
            }
            if !(MIN_SLOT_LEN_MIN..=MAX_SLOT_LEN_MIN).contains(&entry.slot_minutes) {
                return Err(io::Error::new(
                    io::ErrorKind::InvalidData,
                    format!("garage {}: slot_minutes out of range", entry.id),
                ));
            }
            dir.insert(
                entry.id,
                GarageRecord {
                    profile: GarageProfile {
                        open_min,
                        close_min,
                        slot_len_min: entry.slot_minutes,
                        utc_offset_min: entry.utc_offset_minutes,
                    },
                    mechanics: entry.mechanics,
                    bays: entry.bays,
                },
            );
        }
        Ok(dir)
    }

    fn record(&self, garage_id: GarageId) -> Result<GarageRecord, DirectoryError> {
        self.garages
            .get(&garage_id)
            .map(|e| e.value().clone())
            .ok_or(DirectoryError::GarageNotFound(garage_id))
    }
}

#[async_trait]
impl GarageDirectory for StaticDirectory {
    async fn profile(&self, garage_id: GarageId) -> Result<GarageProfile, DirectoryError> {
        Ok(self.record(garage_id)?.profile)
    }

    async fn active_mechanic_count(&self, garage_id: GarageId) -> Result<u32, DirectoryError> {
        Ok(self.record(garage_id)?.mechanics)
    }

    async fn service_bay_count(&self, garage_id: GarageId) -> Result<u32, DirectoryError> {
        Ok(self.record(garage_id)?.bays)
    }
}

#[derive(Deserialize)]
struct GarageConfigEntry {
    id: GarageId,
    open: String,
    close: String,
    slot_minutes: u16,
    #[serde(default)]
    utc_offset_minutes: i32,
    mechanics: u32,
    bays: u32,
}

#[derive(Deserialize)]
struct GarageConfig {
    garages: Vec<GarageConfigEntry>,
}
