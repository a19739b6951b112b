pub mod index;
pub mod local;
