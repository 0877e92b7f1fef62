//! Types shared by the codec and the transport.

mod contact;
mod id;
pub mod messages;

pub use contact::*;
pub use id::*;
pub use messages::*;
