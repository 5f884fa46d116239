pub mod backup;
pub mod config;
pub mod events;
pub mod host;
pub mod identity;
pub mod process_monitor;
pub mod protocol; // ping, query, LAN
pub mod registry;
pub mod server;
pub mod supervisor;
pub mod tail;
pub mod utils;
