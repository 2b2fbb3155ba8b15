pub mod obs;
pub mod params;
