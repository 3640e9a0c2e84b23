pub mod manager;
pub mod surface;
