pub mod api;
pub mod config;
pub mod model;
pub mod protocol;
pub mod relay;
pub mod server;
pub mod store;
