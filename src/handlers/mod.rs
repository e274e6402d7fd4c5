pub mod http;
pub mod message;
pub mod ws;
