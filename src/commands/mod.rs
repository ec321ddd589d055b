pub mod merge;
pub mod predict;
pub mod train;
