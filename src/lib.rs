pub mod agent;
pub mod appid;
pub mod config;
pub mod heartbeat;
pub mod logger;
pub mod proxy;
pub mod rules;
pub mod server;
pub mod sni;
pub mod tracker;

pub use config::Config;
pub use server::Supervisor;
