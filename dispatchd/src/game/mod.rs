//! The slice of the Minecraft Java Edition protocol the dispatcher speaks:
//! packet framing, the handshake, the status exchange and the login disconnect.

pub mod codec;
pub mod probe;
pub mod status;
