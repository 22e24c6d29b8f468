pub mod registry;
pub mod router;
pub mod server;
