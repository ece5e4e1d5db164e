pub mod caches;
pub mod clock;
pub mod event;
pub mod models;
pub mod session_detect;
pub mod signature;
pub mod vehicle;
