mod location;
pub mod scooter;
pub mod trip;

pub use location::Location;
pub use scooter::{Scooter, ScooterRecord, ScooterStatus};
pub use trip::{NewTrip, Trip, TripCompletion, TripRecord, TripStatus};

/// 存储记录无法转换为领域模型
#[derive(Debug, thiserror::Error)]
pub enum ModelError {
    #[error("unknown scooter status: {0}")]
    UnknownScooterStatus(String),
    #[error("unknown trip status: {0}")]
    UnknownTripStatus(String),
    #[error("completed trip {0} has no end location")]
    MissingEndLocation(String),
}
