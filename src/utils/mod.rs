pub mod constants;
pub mod logger;
