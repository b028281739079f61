//! FRP-style reverse tunnel server: control protocol, service registry,
//! reverse proxy engine, and the server lifecycle tying them together.

pub mod codec;
pub mod control;
pub mod errors;
pub mod pool;
pub mod protocol;
pub mod registry;
pub mod repository;
pub mod reverse_proxy;
pub mod server;
pub mod session;

pub use control::ControlServer;
pub use errors::TunnelError;
pub use server::{TunnelServer, TunnelServerConfig};
