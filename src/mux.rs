pub mod client;
pub mod frame;
pub mod server;
pub mod session;

pub use client::{Client, ClientManager, MultiplexingConfig};
pub use frame::{is_mux_destination, mux_destination};
pub use server::Server;
