mod handler;
mod model;

pub use handler::{rank, top_riders};
pub use model::{RankQuery, RiderRank, RiderScore, TopRidersQuery};
