pub mod episode;
pub mod equipment;
pub mod incident;
