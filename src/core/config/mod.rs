pub mod data;
pub mod io;

pub use data::AppConfig;
pub use io::ConfigError;
