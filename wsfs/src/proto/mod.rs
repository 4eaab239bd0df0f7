pub mod codec;
pub mod errors;
pub mod handler;
pub mod procedures;
pub mod protocol;
pub mod responses;
pub mod server;
