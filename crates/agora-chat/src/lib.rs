pub mod error;
pub mod ports;
pub mod service;

#[cfg(test)]
mod tests;

pub use error::ChatError;
pub use service::ChatService;
