pub mod config;
pub mod control_server;
pub mod controller;
pub mod error;
pub mod gateway;
pub mod packet;
pub mod port;
pub mod protocol;
pub mod resolver;
pub mod southbound;
pub mod types;

pub use controller::{Controller, LinkEnd, PortDesc, TopologyEvent};
pub use error::{Result, RouterError};
