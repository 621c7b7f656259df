pub mod driver;
pub mod offer;
pub mod outcome;
pub mod ride;
