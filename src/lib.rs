// Public API - probe pipeline, daemons, and shared data types
pub mod api;
pub mod client;
pub mod collector;
pub mod config;
pub mod points;
pub mod probe;
pub mod reflector;
pub mod scraper;
pub mod socket;
pub mod tags;
pub mod wire;
