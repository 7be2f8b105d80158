mod server;

pub use server::{JobConfig, PRESIGN_SECRET_FILE, ServerConfig};
