mod handler;
mod model;

pub use handler::search_scooters;
pub use model::SearchQuery;
