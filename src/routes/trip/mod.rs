mod handler;
mod model;

pub use handler::{end_trip, get_trip, start_trip};
pub use model::{EndTripRequest, EndTripResponse, StartTripRequest, StartTripResponse};
