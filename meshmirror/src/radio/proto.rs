//! Radio wire protocol
//!
//! The radio speaks protobuf over its serial link. Each message travels in a
//! frame made of two start bytes, a big-endian 16 bit payload length, and the
//! encoded payload. Only the subset of the message schema needed to mirror a
//! node and exchange text is modeled here; unknown fields are skipped by the
//! decoder.

use num_enum::{FromPrimitive, IntoPrimitive};
use prost::Message;
use thiserror::Error;

/// First byte of a frame header.
pub const START1: u8 = 0x94;
/// Second byte of a frame header. Also used as the wake burst byte.
pub const START2: u8 = 0xC3;
/// Size of the frame header: start bytes plus length.
pub const HEADER_LEN: usize = 4;
/// Largest payload the radio will accept or emit in a single frame.
pub const MAX_PAYLOAD_LEN: usize = 512;
/// Largest text payload that fits in a single mesh packet.
pub const MAX_TEXT_LEN: usize = 233;
/// Destination address for packets sent to every node.
pub const BROADCAST_NUM: u32 = 0xFFFF_FFFF;

#[derive(Error, Debug)]
pub enum Error {
    /// A line of the radio's debug console, received outside of a frame.
    #[error("console text: {0}")]
    Text(String),
    /// Frame header declared a length beyond `MAX_PAYLOAD_LEN`.
    #[error("frame length {0} exceeds the protocol limit")]
    FrameTooBig(usize),
    /// Frame payload did not decode as a `FromRadio` message.
    #[error("malformed frame: {0}")]
    Decode(#[from] prost::DecodeError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i32)]
#[derive(FromPrimitive, IntoPrimitive)]
pub enum PortNum {
    UnknownApp = 0,
    TextMessageApp = 1,
    RemoteHardwareApp = 2,
    PositionApp = 3,
    NodeinfoApp = 4,
    RoutingApp = 5,
    AdminApp = 6,
    TelemetryApp = 67,
    #[num_enum(catch_all)]
    Other(i32),
}

/// Role a node plays in the mesh, as configured on the device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i32)]
#[derive(FromPrimitive, IntoPrimitive)]
pub enum Role {
    Client = 0,
    ClientMute = 1,
    Router = 2,
    RouterClient = 3,
    Repeater = 4,
    Tracker = 5,
    Sensor = 6,
    Tak = 7,
    ClientHidden = 8,
    LostAndFound = 9,
    TakTracker = 10,
    RouterLate = 11,
    #[num_enum(catch_all)]
    Unknown(i32),
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Role::Client => "CLIENT",
            Role::ClientMute => "CLIENT_MUTE",
            Role::Router => "ROUTER",
            Role::RouterClient => "ROUTER_CLIENT",
            Role::Repeater => "REPEATER",
            Role::Tracker => "TRACKER",
            Role::Sensor => "SENSOR",
            Role::Tak => "TAK",
            Role::ClientHidden => "CLIENT_HIDDEN",
            Role::LostAndFound => "LOST_AND_FOUND",
            Role::TakTracker => "TAK_TRACKER",
            Role::RouterLate => "ROUTER_LATE",
            Role::Unknown(n) => return write!(f, "ROLE_{}", n),
        };
        f.write_str(name)
    }
}

#[derive(Clone, PartialEq, Message)]
pub struct Data {
    /// A `PortNum`, kept as its wire value.
    #[prost(int32, tag = "1")]
    pub portnum: i32,
    #[prost(bytes = "vec", tag = "2")]
    pub payload: Vec<u8>,
    #[prost(bool, tag = "3")]
    pub want_response: bool,
}

impl Data {
    pub fn port(&self) -> PortNum {
        PortNum::from(self.portnum)
    }
}

#[derive(Clone, PartialEq, Message)]
pub struct MeshPacket {
    #[prost(fixed32, tag = "1")]
    pub from: u32,
    #[prost(fixed32, tag = "2")]
    pub to: u32,
    #[prost(uint32, tag = "3")]
    pub channel: u32,
    #[prost(oneof = "mesh_packet::PayloadVariant", tags = "4, 5")]
    pub payload_variant: Option<mesh_packet::PayloadVariant>,
    #[prost(fixed32, tag = "6")]
    pub id: u32,
    #[prost(fixed32, tag = "7")]
    pub rx_time: u32,
    #[prost(float, tag = "8")]
    pub rx_snr: f32,
    #[prost(uint32, tag = "9")]
    pub hop_limit: u32,
    #[prost(bool, tag = "10")]
    pub want_ack: bool,
    #[prost(int32, tag = "12")]
    pub rx_rssi: i32,
}

impl MeshPacket {
    /// Returns the decoded payload, if the radio was able to decrypt it.
    pub fn decoded(&self) -> Option<&Data> {
        match &self.payload_variant {
            Some(mesh_packet::PayloadVariant::Decoded(data)) => Some(data),
            _ => None,
        }
    }
}

pub mod mesh_packet {
    #[derive(Clone, PartialEq, prost::Oneof)]
    pub enum PayloadVariant {
        #[prost(message, tag = "4")]
        Decoded(super::Data),
        #[prost(bytes = "vec", tag = "5")]
        Encrypted(Vec<u8>),
    }
}

#[derive(Clone, PartialEq, Message)]
pub struct User {
    #[prost(string, tag = "1")]
    pub id: String,
    #[prost(string, tag = "2")]
    pub long_name: String,
    #[prost(string, tag = "3")]
    pub short_name: String,
    /// A `Role`, kept as its wire value.
    #[prost(int32, tag = "7")]
    pub role: i32,
}

#[derive(Clone, PartialEq, Message)]
pub struct Position {
    /// Latitude in units of 1e-7 degrees.
    #[prost(sfixed32, optional, tag = "1")]
    pub latitude_i: Option<i32>,
    /// Longitude in units of 1e-7 degrees.
    #[prost(sfixed32, optional, tag = "2")]
    pub longitude_i: Option<i32>,
    #[prost(int32, optional, tag = "3")]
    pub altitude: Option<i32>,
    #[prost(fixed32, tag = "4")]
    pub time: u32,
}

#[derive(Clone, PartialEq, Message)]
pub struct NodeInfo {
    #[prost(uint32, tag = "1")]
    pub num: u32,
    #[prost(message, optional, tag = "2")]
    pub user: Option<User>,
    #[prost(message, optional, tag = "3")]
    pub position: Option<Position>,
    #[prost(float, tag = "4")]
    pub snr: f32,
    #[prost(fixed32, tag = "5")]
    pub last_heard: u32,
}

#[derive(Clone, PartialEq, Message)]
pub struct MyNodeInfo {
    #[prost(uint32, tag = "1")]
    pub my_node_num: u32,
}

#[derive(Clone, PartialEq, Message)]
pub struct Heartbeat {
    #[prost(uint32, tag = "1")]
    pub nonce: u32,
}

#[derive(Clone, PartialEq, Message)]
pub struct ToRadio {
    #[prost(oneof = "to_radio::PayloadVariant", tags = "1, 3, 4, 7")]
    pub payload_variant: Option<to_radio::PayloadVariant>,
}

pub mod to_radio {
    #[derive(Clone, PartialEq, prost::Oneof)]
    pub enum PayloadVariant {
        #[prost(message, tag = "1")]
        Packet(super::MeshPacket),
        #[prost(uint32, tag = "3")]
        WantConfigId(u32),
        #[prost(bool, tag = "4")]
        Disconnect(bool),
        #[prost(message, tag = "7")]
        Heartbeat(super::Heartbeat),
    }
}

#[derive(Clone, PartialEq, Message)]
pub struct FromRadio {
    #[prost(uint32, tag = "1")]
    pub id: u32,
    #[prost(oneof = "from_radio::PayloadVariant", tags = "2, 3, 4, 7, 8")]
    pub payload_variant: Option<from_radio::PayloadVariant>,
}

pub mod from_radio {
    #[derive(Clone, PartialEq, prost::Oneof)]
    pub enum PayloadVariant {
        #[prost(message, tag = "2")]
        Packet(super::MeshPacket),
        #[prost(message, tag = "3")]
        MyInfo(super::MyNodeInfo),
        #[prost(message, tag = "4")]
        NodeInfo(super::NodeInfo),
        #[prost(uint32, tag = "7")]
        ConfigCompleteId(u32),
        #[prost(bool, tag = "8")]
        Rebooted(bool),
    }
}

impl ToRadio {
    pub fn want_config(id: u32) -> ToRadio {
        ToRadio {
            payload_variant: Some(to_radio::PayloadVariant::WantConfigId(id)),
        }
    }

    pub fn heartbeat(nonce: u32) -> ToRadio {
        ToRadio {
            payload_variant: Some(to_radio::PayloadVariant::Heartbeat(Heartbeat { nonce })),
        }
    }

    /// Tells the radio the client is going away.
    pub fn disconnect() -> ToRadio {
        ToRadio {
            payload_variant: Some(to_radio::PayloadVariant::Disconnect(true)),
        }
    }

    pub fn packet(pkt: MeshPacket) -> ToRadio {
        ToRadio {
            payload_variant: Some(to_radio::PayloadVariant::Packet(pkt)),
        }
    }

    /// Encodes this message into a complete frame, header included.
    pub fn to_frame(&self) -> Result<Vec<u8>, Error> {
        let payload = self.encode_to_vec();
        if payload.len() > MAX_PAYLOAD_LEN {
            return Err(Error::FrameTooBig(payload.len()));
        }
        let mut frame = Vec::with_capacity(HEADER_LEN + payload.len());
        frame.push(START1);
        frame.push(START2);
        frame.extend_from_slice(&(payload.len() as u16).to_be_bytes());
        frame.extend_from_slice(&payload);
        Ok(frame)
    }
}

/// Formats a node number the way nodes without a user id are addressed.
pub fn node_num_to_id(num: u32) -> String {
    format!("!{:08x}", num)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frame_header_carries_big_endian_length() {
        let frame = ToRadio::want_config(0x1234_5678).to_frame().unwrap();
        assert_eq!(frame[0], START1);
        assert_eq!(frame[1], START2);
        let len = u16::from_be_bytes([frame[2], frame[3]]) as usize;
        assert_eq!(len, frame.len() - HEADER_LEN);
        let decoded = ToRadio::decode(&frame[HEADER_LEN..]).unwrap();
        assert_eq!(
            decoded.payload_variant,
            Some(to_radio::PayloadVariant::WantConfigId(0x1234_5678))
        );
    }

    #[test]
    fn disconnect_is_field_four() {
        let frame = ToRadio::disconnect().to_frame().unwrap();
        assert_eq!(frame, [START1, START2, 0x00, 0x02, 0x20, 0x01]);
    }

    #[test]
    fn unknown_enum_values_are_preserved() {
        assert_eq!(PortNum::from(1), PortNum::TextMessageApp);
        assert_eq!(PortNum::from(4242), PortNum::Other(4242));
        assert_eq!(Role::from(2).to_string(), "ROUTER");
        assert_eq!(Role::from(99).to_string(), "ROLE_99");
    }

    #[test]
    fn node_ids_are_zero_padded_hex() {
        assert_eq!(node_num_to_id(0xabcd), "!0000abcd");
    }
}
