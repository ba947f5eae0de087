pub mod link;
pub mod nodedb;
pub mod port;
pub mod proto;

pub use link::{DeviceLink, LinkError, LinkOptions, SerialLink, TextPacket};
pub use nodedb::{NodeSnapshot, Peer};
