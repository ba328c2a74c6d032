pub mod http;
pub mod server;
pub mod subsystems;
pub mod tls;
