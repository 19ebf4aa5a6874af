pub mod images;
pub mod zip;
