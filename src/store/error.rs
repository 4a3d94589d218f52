use chrono::NaiveDate;

use crate::directory::DirectoryError;
use crate::model::{AppointmentId, GarageId, SlotId};

#[derive(Debug)]
pub enum StoreError {
    GarageNotFound(GarageId),
    DayNotFound { garage_id: GarageId, date: NaiveDate },
    AppointmentNotFound(AppointmentId),
    /// An increment/decrement referenced a slot the day does not contain.
    /// Programming error, never user-driven.
    SlotNotFound(SlotId),
    CapacityExhausted(SlotId),
    SlotNotBookable(SlotId),
    LimitExceeded(&'static str),
    /// Collaborator temporarily unreachable — retryable at the caller.
    Unavailable(String),
    WalError(String),
}

impl StoreError {
    /// Whether a retry at the coordinator boundary can plausibly help.
    pub fn is_transient(&self) -> bool {
        matches!(self, StoreError::Unavailable(_) | StoreError::WalError(_))
    }
}

impl std::fmt::Display for StoreError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StoreError::GarageNotFound(id) => write!(f, "garage not found: {id}"),
            StoreError::DayNotFound { garage_id, date } => {
                write!(f, "no slot set for garage {garage_id} on {date}")
            }
            StoreError::AppointmentNotFound(id) => write!(f, "appointment not found: {id}"),
            StoreError::SlotNotFound(id) => write!(f, "slot not found: {id}"),
            StoreError::CapacityExhausted(id) => write!(f, "slot at capacity: {id}"),
            StoreError::SlotNotBookable(id) => write!(f, "slot not open for booking: {id}"),
            StoreError::LimitExceeded(msg) => write!(f, "limit exceeded: {msg}"),
            StoreError::Unavailable(e) => write!(f, "store unavailable: {e}"),
            StoreError::WalError(e) => write!(f, "WAL error: {e}"),
        }
    }
}

impl std::error::Error for StoreError {}

impl From<DirectoryError> for StoreError {
    fn from(e: DirectoryError) -> Self {
        match e {
            DirectoryError::GarageNotFound(id) => StoreError::GarageNotFound(id),
            DirectoryError::Unavailable(msg) => StoreError::Unavailable(msg),
        }
    }
}
