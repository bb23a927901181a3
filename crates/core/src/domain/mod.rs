pub mod approval;
pub mod group;
pub mod line;
pub mod rule;
