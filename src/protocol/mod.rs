pub mod line;
pub mod server;
