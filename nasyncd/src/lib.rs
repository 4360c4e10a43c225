pub mod daemon;
pub mod service;
pub mod sync;
