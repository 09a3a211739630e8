pub mod message;
pub mod peer;
mod schema;

pub use message::{
    decode, encode, peek_type, Body, DecodeError, EncodeError, Message, MessageType, Values,
};
pub use peer::{PortType, Role};
