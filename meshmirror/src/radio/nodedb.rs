//! Node database
//!
//! Everything the radio tells us about itself and the nodes it has heard,
//! kept up to date from the inbound `FromRadio` stream.

use super::proto::{self, from_radio, NodeInfo, PortNum, Position, User};
use prost::Message;
use std::collections::BTreeMap;

/// Read-only view of the local node, derived from the database.
#[derive(Debug, Clone, PartialEq)]
pub struct NodeSnapshot {
    pub id: String,
    pub display_name: String,
    pub role: proto::Role,
    /// Latitude and longitude in degrees.
    pub position: Option<(f64, f64)>,
    pub snr: Option<f32>,
}

/// Another node known to the radio.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Peer {
    pub id: String,
    pub display_name: String,
}

/// What a `FromRadio` message meant for the caller, beyond updating the
/// database.
#[derive(Debug, Clone, PartialEq)]
pub enum Update {
    Nothing,
    /// A text message arrived.
    Text {
        from_id: String,
        text: String,
        channel: u32,
    },
    ConfigComplete(u32),
    /// The radio restarted and dropped its API session.
    Rebooted,
}

#[derive(Default)]
pub struct NodeDb {
    my_node_num: Option<u32>,
    nodes: BTreeMap<u32, NodeInfo>,
}

impl NodeDb {
    pub fn new() -> NodeDb {
        NodeDb::default()
    }

    pub fn my_node_num(&self) -> Option<u32> {
        self.my_node_num
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn clear(&mut self) {
        self.my_node_num = None;
        self.nodes.clear();
    }

    /// Id of a node: its user id when known, otherwise its number in hex.
    pub fn node_id(&self, num: u32) -> String {
        match self.nodes.get(&num).and_then(|n| n.user.as_ref()) {
            Some(user) if !user.id.is_empty() => user.id.clone(),
            _ => proto::node_num_to_id(num),
        }
    }

    fn entry(&mut self, num: u32) -> &mut NodeInfo {
        self.nodes.entry(num).or_insert_with(|| NodeInfo {
            num,
            ..Default::default()
        })
    }

    /// Folds one message from the radio into the database.
    pub fn apply(&mut self, msg: proto::FromRadio) -> Update {
        match msg.payload_variant {
            Some(from_radio::PayloadVariant::MyInfo(info)) => {
                self.my_node_num = Some(info.my_node_num);
                Update::Nothing
            }
            Some(from_radio::PayloadVariant::NodeInfo(info)) => {
                self.nodes.insert(info.num, info);
                Update::Nothing
            }
            Some(from_radio::PayloadVariant::ConfigCompleteId(id)) => Update::ConfigComplete(id),
            Some(from_radio::PayloadVariant::Rebooted(_)) => {
                self.clear();
                Update::Rebooted
            }
            Some(from_radio::PayloadVariant::Packet(pkt)) => self.apply_packet(pkt),
            None => Update::Nothing,
        }
    }

    fn apply_packet(&mut self, pkt: proto::MeshPacket) -> Update {
        let node = self.entry(pkt.from);
        if pkt.rx_time != 0 {
            node.last_heard = pkt.rx_time;
        }
        if pkt.rx_snr != 0.0 {
            node.snr = pkt.rx_snr;
        }
        let data = match pkt.decoded() {
            Some(data) => data,
            None => return Update::Nothing,
        };
        match data.port() {
            PortNum::TextMessageApp => Update::Text {
                from_id: self.node_id(pkt.from),
                text: String::from_utf8_lossy(&data.payload).into_owned(),
                channel: pkt.channel,
            },
            PortNum::NodeinfoApp => {
                match User::decode(data.payload.as_slice()) {
                    Ok(user) => node.user = Some(user),
                    Err(e) => tracing::debug!("bad user payload from {:08x}: {e}", pkt.from),
                }
                Update::Nothing
            }
            PortNum::PositionApp => {
                match Position::decode(data.payload.as_slice()) {
                    Ok(pos) => node.position = Some(pos),
                    Err(e) => tracing::debug!("bad position payload from {:08x}: {e}", pkt.from),
                }
                Update::Nothing
            }
            _ => Update::Nothing,
        }
    }

    /// Snapshot of the local node, once the radio has described it.
    pub fn own_node(&self) -> Option<NodeSnapshot> {
        let num = self.my_node_num?;
        let node = self.nodes.get(&num)?;
        let user = node.user.clone().unwrap_or_default();
        let position = node.position.as_ref().and_then(|p| {
            match (p.latitude_i, p.longitude_i) {
                (Some(lat), Some(lon)) => Some((lat as f64 * 1e-7, lon as f64 * 1e-7)),
                _ => None,
            }
        });
        Some(NodeSnapshot {
            id: self.node_id(num),
            display_name: if user.long_name.is_empty() {
                self.node_id(num)
            } else {
                user.long_name
            },
            role: proto::Role::from(user.role),
            position,
            snr: if node.snr != 0.0 { Some(node.snr) } else { None },
        })
    }

    /// Every node in the database, in node number order.
    pub fn peers(&self) -> Vec<Peer> {
        self.nodes
            .keys()
            .map(|&num| {
                let id = self.node_id(num);
                let display_name = match self.nodes[&num].user.as_ref() {
                    Some(user) if !user.long_name.is_empty() => user.long_name.clone(),
                    _ => id.clone(),
                };
                Peer { id, display_name }
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::radio::proto::{mesh_packet, Data, FromRadio, MeshPacket, MyNodeInfo};

    fn node_info(num: u32, id: &str, name: &str) -> FromRadio {
        FromRadio {
            id: 0,
            payload_variant: Some(from_radio::PayloadVariant::NodeInfo(NodeInfo {
                num,
                user: Some(User {
                    id: id.into(),
                    long_name: name.into(),
                    short_name: String::new(),
                    role: 2,
                }),
                position: Some(Position {
                    latitude_i: Some(473_977_000),
                    longitude_i: Some(-1_223_456_000),
                    altitude: None,
                    time: 0,
                }),
                snr: 0.0,
                last_heard: 0,
            })),
        }
    }

    fn packet(from: u32, port: PortNum, payload: Vec<u8>, snr: f32) -> FromRadio {
        FromRadio {
            id: 0,
            payload_variant: Some(from_radio::PayloadVariant::Packet(MeshPacket {
                from,
                to: proto::BROADCAST_NUM,
                channel: 2,
                payload_variant: Some(mesh_packet::PayloadVariant::Decoded(Data {
                    portnum: port.into(),
                    payload,
                    want_response: false,
                })),
                rx_snr: snr,
                ..Default::default()
            })),
        }
    }

    fn my_info(num: u32) -> FromRadio {
        FromRadio {
            id: 0,
            payload_variant: Some(from_radio::PayloadVariant::MyInfo(MyNodeInfo {
                my_node_num: num,
            })),
        }
    }

    #[test]
    fn own_node_needs_my_info_and_entry() {
        let mut db = NodeDb::new();
        db.apply(node_info(10, "!0000000a", "Base"));
        assert_eq!(db.own_node(), None);
        db.apply(my_info(10));
        let own = db.own_node().unwrap();
        assert_eq!(own.id, "!0000000a");
        assert_eq!(own.display_name, "Base");
        assert_eq!(own.role, proto::Role::Router);
        let (lat, lon) = own.position.unwrap();
        assert!((lat - 47.3977).abs() < 1e-9);
        assert!((lon + 122.3456).abs() < 1e-9);
        assert_eq!(own.snr, None);
    }

    #[test]
    fn text_packets_resolve_sender_ids() {
        let mut db = NodeDb::new();
        db.apply(node_info(0xabcd, "!abcd", "Hilltop"));
        let update = db.apply(packet(0xabcd, PortNum::TextMessageApp, b"hi".to_vec(), 6.5));
        assert_eq!(
            update,
            Update::Text {
                from_id: "!abcd".into(),
                text: "hi".into(),
                channel: 2
            }
        );
        let update = db.apply(packet(0x42, PortNum::TextMessageApp, b"yo".to_vec(), 0.0));
        assert!(matches!(update, Update::Text { ref from_id, .. } if from_id == "!00000042"));
        assert_eq!(db.len(), 2);
    }

    #[test]
    fn packets_refresh_snr_user_and_position() {
        let mut db = NodeDb::new();
        db.apply(my_info(5));
        db.apply(packet(5, PortNum::TelemetryApp, vec![], 4.25));
        let user = User {
            id: "!00000005".into(),
            long_name: "Rover".into(),
            short_name: "RV".into(),
            role: 0,
        };
        db.apply(packet(5, PortNum::NodeinfoApp, user.encode_to_vec(), 0.0));
        let own = db.own_node().unwrap();
        assert_eq!(own.display_name, "Rover");
        assert_eq!(own.snr, Some(4.25));
        assert_eq!(own.position, None);
    }

    #[test]
    fn peers_fall_back_to_hex_ids() {
        let mut db = NodeDb::new();
        db.apply(packet(0x20, PortNum::PositionApp, vec![], 0.0));
        db.apply(node_info(0x10, "!x", "Alpha"));
        let peers = db.peers();
        assert_eq!(
            peers,
            vec![
                Peer {
                    id: "!x".into(),
                    display_name: "Alpha".into()
                },
                Peer {
                    id: "!00000020".into(),
                    display_name: "!00000020".into()
                },
            ]
        );
    }

    #[test]
    fn reboot_clears_everything() {
        let mut db = NodeDb::new();
        db.apply(my_info(1));
        db.apply(node_info(1, "!1", "One"));
        let update = db.apply(FromRadio {
            id: 0,
            payload_variant: Some(from_radio::PayloadVariant::Rebooted(true)),
        });
        assert_eq!(update, Update::Rebooted);
        assert!(db.is_empty());
        assert_eq!(db.my_node_num(), None);
    }
}
