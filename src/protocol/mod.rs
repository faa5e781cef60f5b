//! The wire protocol: message types (§3) and their frame codec (§4.1).

pub mod codec;
pub mod message;

pub use message::{Discriminant, Message};
