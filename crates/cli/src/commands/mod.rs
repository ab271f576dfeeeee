pub mod containers;
pub mod cycle;
pub mod status;
