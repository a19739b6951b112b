pub mod backbone;
pub mod client;
