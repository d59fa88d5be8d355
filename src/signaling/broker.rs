//! WebRTC signaling broker
//!
//! Routes SDP offers/answers and ICE candidates between the room broadcaster
//! and its viewers, maintains room membership, and emits `client-joined` /
//! `client-left` presence messages. The broadcaster (the appliance) watches
//! its own presence feed to learn when viewers appear.
//!
//! Clients and rooms are flat maps keyed by connection id and room id; each
//! side stores the other's ids, never references. One mutex guards both
//! tables. Outbound messages go through each connection's unbounded channel,
//! drained by that connection's single writer task, so per-connection order
//! is the order the broker accepted the messages in.

use std::collections::{HashMap, HashSet};

use parking_lot::Mutex;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use super::types::{ClientSummary, Role, RoomOverview, SignalMessage};

/// Per-connection outbound channel; the receiving half lives in the
/// connection's writer task
pub type SignalSender = mpsc::UnboundedSender<SignalMessage>;

struct ClientRecord {
    user_id: String,
    sender: SignalSender,
    rooms: HashSet<String>,
    roles: HashMap<String, Role>,
}

#[derive(Default)]
struct RoomRecord {
    clients: HashSet<String>,
    broadcasters: HashSet<String>,
    viewers: HashSet<String>,
}

#[derive(Default)]
struct Tables {
    clients: HashMap<String, ClientRecord>,
    rooms: HashMap<String, RoomRecord>,
}

/// The broker itself; shared behind an `Arc` by every signaling session
#[derive(Default)]
pub struct SignalingBroker {
    tables: Mutex<Tables>,
}

impl SignalingBroker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a connection and send the `registered` greeting
    pub fn register(&self, connection_id: &str, user_id: &str, sender: SignalSender) {
        let mut tables = self.tables.lock();

        if tables.clients.contains_key(connection_id) {
            warn!(connection_id, "replacing already-registered signaling client");
            Self::drain_unregister(&mut tables, connection_id);
        }

        let greeting = SignalMessage::Registered {
            client_id: connection_id.to_string(),
        };
        let _ = sender.send(greeting);

        tables.clients.insert(
            connection_id.to_string(),
            ClientRecord {
                user_id: user_id.to_string(),
                sender,
                rooms: HashSet::new(),
                roles: HashMap::new(),
            },
        );

        info!(connection_id, user_id, "signaling client registered");
    }

    /// Remove a connection, leaving every room it belonged to
    pub fn unregister(&self, connection_id: &str) {
        let mut tables = self.tables.lock();
        Self::drain_unregister(&mut tables, connection_id);
        info!(connection_id, "signaling client unregistered");
    }

    /// Handle one message from a connection
    ///
    /// Returns the direct reply, if any; forwarded messages produce no reply
    /// unless routing fails.
    pub fn handle_message(
        &self,
        sender_id: &str,
        message: SignalMessage,
    ) -> Option<SignalMessage> {
        let mut tables = self.tables.lock();

        if !tables.clients.contains_key(sender_id) {
            return Some(SignalMessage::error("Client (connection) not registered"));
        }

        match message {
            SignalMessage::Join { room_id, role } => {
                Some(Self::join_room_locked(&mut tables, sender_id, &room_id, role))
            }
            SignalMessage::Leave { room_id } => {
                Some(Self::leave_room_locked(&mut tables, sender_id, &room_id))
            }
            SignalMessage::GetRoomInfo { room_id } => Some(SignalMessage::RoomInfo {
                clients: Self::room_clients_locked(&tables, &room_id),
                room_id,
            }),
            SignalMessage::Offer {
                target,
                room_id,
                sdp,
                ..
            } => Self::forward_locked(
                &mut tables,
                sender_id,
                target,
                room_id,
                |target, client_id, room_id| SignalMessage::Offer {
                    target,
                    room_id,
                    sdp,
                    client_id: Some(client_id),
                },
            ),
            SignalMessage::Answer {
                target,
                room_id,
                sdp,
                ..
            } => Self::forward_locked(
                &mut tables,
                sender_id,
                target,
                room_id,
                |target, client_id, room_id| SignalMessage::Answer {
                    target,
                    room_id,
                    sdp,
                    client_id: Some(client_id),
                },
            ),
            SignalMessage::IceCandidate {
                target,
                room_id,
                candidate,
                ..
            } => Self::forward_locked(
                &mut tables,
                sender_id,
                target,
                room_id,
                |target, client_id, room_id| SignalMessage::IceCandidate {
                    target,
                    room_id,
                    candidate,
                    client_id: Some(client_id),
                },
            ),
            other => {
                warn!(sender_id, message = ?other, "unexpected signaling message from client");
                Some(SignalMessage::error("Unexpected message type"))
            }
        }
    }

    /// Aggregate counters for every active room
    pub fn room_overviews(&self) -> Vec<RoomOverview> {
        let tables = self.tables.lock();
        let mut overviews: Vec<RoomOverview> = tables
            .rooms
            .iter()
            .map(|(room_id, room)| RoomOverview {
                room_id: room_id.clone(),
                total_clients: room.clients.len(),
                broadcasters: room.broadcasters.len(),
                viewers: room.viewers.len(),
            })
            .collect();
        overviews.sort_by(|a, b| a.room_id.cmp(&b.room_id));
        overviews
    }

    /// Members of one room
    pub fn room_clients(&self, room_id: &str) -> Vec<ClientSummary> {
        let tables = self.tables.lock();
        Self::room_clients_locked(&tables, room_id)
    }

    // ========================================================================
    // Locked helpers (callers hold the tables mutex)
    // ========================================================================

    fn join_room_locked(
        tables: &mut Tables,
        sender_id: &str,
        room_id: &str,
        role: Role,
    ) -> SignalMessage {
        // The broadcaster slot is exclusive; reject before touching any
        // state so a refused join leaves no trace
        if role == Role::Broadcaster {
            if let Some(room) = tables.rooms.get(room_id) {
                if !room.broadcasters.is_empty() && !room.broadcasters.contains(sender_id) {
                    warn!(room_id, sender_id, "rejecting second broadcaster");
                    return SignalMessage::error(format!(
                        "Room {} already has a broadcaster",
                        room_id
                    ));
                }
            }
        }

        let room = tables.rooms.entry(room_id.to_string()).or_default();
        room.clients.insert(sender_id.to_string());
        match role {
            Role::Broadcaster => {
                room.broadcasters.insert(sender_id.to_string());
                room.viewers.remove(sender_id);
            }
            Role::Viewer => {
                room.viewers.insert(sender_id.to_string());
                room.broadcasters.remove(sender_id);
            }
        }

        if let Some(client) = tables.clients.get_mut(sender_id) {
            client.rooms.insert(room_id.to_string());
            client.roles.insert(room_id.to_string(), role);
            info!(room_id, sender_id, user_id = %client.user_id, %role, "client joined room");
        }

        Self::notify_room_locked(
            tables,
            room_id,
            SignalMessage::ClientJoined {
                room_id: room_id.to_string(),
                client_id: sender_id.to_string(),
                role,
            },
            Some(sender_id),
        );

        SignalMessage::Joined {
            room_id: room_id.to_string(),
            role,
            clients: Self::room_clients_locked(tables, room_id),
        }
    }

    fn leave_room_locked(tables: &mut Tables, sender_id: &str, room_id: &str) -> SignalMessage {
        let Some(room) = tables.rooms.get_mut(room_id) else {
            return SignalMessage::error(format!("Room {} not found", room_id));
        };
        if !room.clients.remove(sender_id) {
            return SignalMessage::error(format!(
                "Connection {} not in room {}",
                sender_id, room_id
            ));
        }
        room.broadcasters.remove(sender_id);
        room.viewers.remove(sender_id);
        let room_empty = room.clients.is_empty();

        if let Some(client) = tables.clients.get_mut(sender_id) {
            client.rooms.remove(room_id);
            client.roles.remove(room_id);
        }

        info!(room_id, sender_id, "client left room");

        if room_empty {
            tables.rooms.remove(room_id);
            debug!(room_id, "room destroyed (no clients)");
        } else {
            Self::notify_room_locked(
                tables,
                room_id,
                SignalMessage::ClientLeft {
                    room_id: room_id.to_string(),
                    client_id: sender_id.to_string(),
                },
                None,
            );
        }

        SignalMessage::Left {
            room_id: room_id.to_string(),
        }
    }

    fn forward_locked(
        tables: &mut Tables,
        sender_id: &str,
        target: String,
        room_id: Option<String>,
        build: impl FnOnce(String, String, Option<String>) -> SignalMessage,
    ) -> Option<SignalMessage> {
        let target_id = match Self::resolve_target_locked(tables, &target, room_id.as_deref()) {
            Ok(id) => id,
            Err(message) => return Some(SignalMessage::Error { message }),
        };

        let forwarded = build(target, sender_id.to_string(), room_id);
        if Self::send_locked(tables, &target_id, forwarded) {
            debug!(sender_id, target = %target_id, "forwarded signaling message");
            None
        } else {
            warn!(target = %target_id, "target write failed, unregistering");
            Self::drain_unregister(tables, &target_id);
            Some(SignalMessage::error(format!(
                "Target client '{}' not reachable",
                target_id
            )))
        }
    }

    fn resolve_target_locked(
        tables: &Tables,
        target: &str,
        room_id: Option<&str>,
    ) -> Result<String, String> {
        if target == "broadcaster" {
            let Some(room_id) = room_id else {
                return Err("Target 'broadcaster' requires a roomId".to_string());
            };
            let Some(room) = tables.rooms.get(room_id) else {
                return Err(format!("Room {} not found", room_id));
            };
            let mut broadcasters = room.broadcasters.iter();
            match (broadcasters.next(), broadcasters.next()) {
                (Some(id), None) => Ok(id.clone()),
                (None, _) => Err(format!("No broadcaster in room {}", room_id)),
                (Some(_), Some(_)) => Err(format!(
                    "Room {} has multiple broadcasters, target 'broadcaster' is ambiguous",
                    room_id
                )),
            }
        } else if tables.clients.contains_key(target) {
            Ok(target.to_string())
        } else {
            Err(format!("Target client '{}' not found", target))
        }
    }

    fn room_clients_locked(tables: &Tables, room_id: &str) -> Vec<ClientSummary> {
        let Some(room) = tables.rooms.get(room_id) else {
            return Vec::new();
        };
        let mut clients: Vec<ClientSummary> = room
            .clients
            .iter()
            .filter_map(|connection_id| {
                tables.clients.get(connection_id).map(|client| ClientSummary {
                    client_id: connection_id.clone(),
                    user_id: client.user_id.clone(),
                    role: client.roles.get(room_id).copied().unwrap_or_default(),
                })
            })
            .collect();
        clients.sort_by(|a, b| a.client_id.cmp(&b.client_id));
        clients
    }

    /// Send to every room member except `exclude`; members whose writer is
    /// gone are unregistered on the spot
    fn notify_room_locked(
        tables: &mut Tables,
        room_id: &str,
        message: SignalMessage,
        exclude: Option<&str>,
    ) {
        let Some(room) = tables.rooms.get(room_id) else {
            return;
        };
        let peers: Vec<String> = room
            .clients
            .iter()
            .filter(|id| Some(id.as_str()) != exclude)
            .cloned()
            .collect();

        for peer in peers {
            if !Self::send_locked(tables, &peer, message.clone()) {
                warn!(peer = %peer, room_id, "peer write failed during notify, unregistering");
                Self::drain_unregister(tables, &peer);
            }
        }
    }

    fn send_locked(tables: &Tables, connection_id: &str, message: SignalMessage) -> bool {
        match tables.clients.get(connection_id) {
            Some(client) => client.sender.send(message).is_ok(),
            None => false,
        }
    }

    /// Unregister a connection and everything that cascades from it
    /// (peers whose writers turn out dead while propagating `client-left`)
    fn drain_unregister(tables: &mut Tables, connection_id: &str) {
        let mut worklist = vec![connection_id.to_string()];
        while let Some(id) = worklist.pop() {
            worklist.extend(Self::unregister_locked(tables, &id));
        }
    }

    /// Remove one connection; returns peers whose sends failed
    fn unregister_locked(tables: &mut Tables, connection_id: &str) -> Vec<String> {
        let Some(client) = tables.clients.remove(connection_id) else {
            return Vec::new();
        };

        let mut failed = Vec::new();
        for room_id in client.rooms {
            let Some(room) = tables.rooms.get_mut(&room_id) else {
                continue;
            };
            room.clients.remove(connection_id);
            room.broadcasters.remove(connection_id);
            room.viewers.remove(connection_id);

            if room.clients.is_empty() {
                tables.rooms.remove(&room_id);
                debug!(room_id = %room_id, "room destroyed (no clients)");
                continue;
            }

            let message = SignalMessage::ClientLeft {
                room_id: room_id.clone(),
                client_id: connection_id.to_string(),
            };
            let peers: Vec<String> = tables.rooms[&room_id].clients.iter().cloned().collect();
            for peer in peers {
                if !Self::send_locked(tables, &peer, message.clone()) {
                    failed.push(peer);
                }
            }
        }
        failed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::signaling::types::IceCandidateInit;
    use tokio::sync::mpsc::UnboundedReceiver;

    fn connect(broker: &SignalingBroker, id: &str, user: &str) -> UnboundedReceiver<SignalMessage> {
        let (tx, mut rx) = mpsc::unbounded_channel();
        broker.register(id, user, tx);
        // Swallow the greeting
        let greeting = rx.try_recv().unwrap();
        assert_eq!(
            greeting,
            SignalMessage::Registered {
                client_id: id.to_string()
            }
        );
        rx
    }

    fn join(broker: &SignalingBroker, id: &str, room: &str, role: Role) -> SignalMessage {
        broker
            .handle_message(
                id,
                SignalMessage::Join {
                    room_id: room.to_string(),
                    role,
                },
            )
            .unwrap()
    }

    #[tokio::test]
    async fn test_join_and_presence() {
        let broker = SignalingBroker::new();
        let mut rpi = connect(&broker, "rpi-conn", "rpi");
        let mut phone = connect(&broker, "phone-conn", "7");

        let reply = join(&broker, "rpi-conn", "R", Role::Broadcaster);
        assert!(matches!(reply, SignalMessage::Joined { ref room_id, role: Role::Broadcaster, .. } if room_id == "R"));

        let reply = join(&broker, "phone-conn", "R", Role::Viewer);
        let SignalMessage::Joined { clients, .. } = reply else {
            panic!("expected joined");
        };
        assert_eq!(clients.len(), 2);

        // The broadcaster observes the viewer arriving; the viewer itself
        // gets no echo of its own join
        let presence = rpi.try_recv().unwrap();
        assert_eq!(
            presence,
            SignalMessage::ClientJoined {
                room_id: "R".to_string(),
                client_id: "phone-conn".to_string(),
                role: Role::Viewer,
            }
        );
        assert!(phone.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_second_broadcaster_rejected_atomically() {
        let broker = SignalingBroker::new();
        let _b1 = connect(&broker, "b1", "rpi");
        let _b2 = connect(&broker, "b2", "rpi");

        join(&broker, "b1", "R", Role::Broadcaster);
        let reply = join(&broker, "b2", "R", Role::Broadcaster);
        assert!(matches!(reply, SignalMessage::Error { .. }));

        // No partial membership for the rejected join
        let clients = broker.room_clients("R");
        assert_eq!(clients.len(), 1);
        assert_eq!(clients[0].client_id, "b1");

        let overviews = broker.room_overviews();
        assert_eq!(overviews[0].broadcasters, 1);
        assert_eq!(overviews[0].total_clients, 1);
    }

    #[tokio::test]
    async fn test_leave_restores_membership_and_destroys_empty_room() {
        let broker = SignalingBroker::new();
        let _b = connect(&broker, "b1", "rpi");

        join(&broker, "b1", "R", Role::Broadcaster);
        assert_eq!(broker.room_overviews().len(), 1);

        let reply = broker
            .handle_message(
                "b1",
                SignalMessage::Leave {
                    room_id: "R".to_string(),
                },
            )
            .unwrap();
        assert!(matches!(reply, SignalMessage::Left { .. }));
        assert!(broker.room_overviews().is_empty());

        // Leaving again errors
        let reply = broker
            .handle_message(
                "b1",
                SignalMessage::Leave {
                    room_id: "R".to_string(),
                },
            )
            .unwrap();
        assert!(matches!(reply, SignalMessage::Error { .. }));
    }

    #[tokio::test]
    async fn test_offer_routed_to_broadcaster() {
        let broker = SignalingBroker::new();
        let mut rpi = connect(&broker, "rpi-conn", "rpi");
        let _phone = connect(&broker, "phone-conn", "7");

        join(&broker, "rpi-conn", "R", Role::Broadcaster);
        join(&broker, "phone-conn", "R", Role::Viewer);
        let _ = rpi.try_recv(); // client-joined

        let reply = broker.handle_message(
            "phone-conn",
            SignalMessage::Offer {
                target: "broadcaster".to_string(),
                room_id: Some("R".to_string()),
                sdp: "v=0...".to_string(),
                client_id: None,
            },
        );
        assert!(reply.is_none());

        let forwarded = rpi.try_recv().unwrap();
        let SignalMessage::Offer { client_id, sdp, .. } = forwarded else {
            panic!("expected offer");
        };
        assert_eq!(client_id.as_deref(), Some("phone-conn"));
        assert_eq!(sdp, "v=0...");
    }

    #[tokio::test]
    async fn test_offer_to_broadcaster_without_one_errors() {
        let broker = SignalingBroker::new();
        let _phone = connect(&broker, "phone-conn", "7");
        join(&broker, "phone-conn", "R", Role::Viewer);

        let reply = broker.handle_message(
            "phone-conn",
            SignalMessage::Offer {
                target: "broadcaster".to_string(),
                room_id: Some("R".to_string()),
                sdp: "v=0...".to_string(),
                client_id: None,
            },
        );
        assert!(matches!(reply, Some(SignalMessage::Error { .. })));
    }

    #[tokio::test]
    async fn test_answer_routed_by_connection_id() {
        let broker = SignalingBroker::new();
        let _rpi = connect(&broker, "rpi-conn", "rpi");
        let mut phone = connect(&broker, "phone-conn", "7");

        let reply = broker.handle_message(
            "rpi-conn",
            SignalMessage::Answer {
                target: "phone-conn".to_string(),
                room_id: None,
                sdp: "v=0...".to_string(),
                client_id: None,
            },
        );
        assert!(reply.is_none());

        let forwarded = phone.try_recv().unwrap();
        assert!(matches!(
            forwarded,
            SignalMessage::Answer { ref client_id, .. } if client_id.as_deref() == Some("rpi-conn")
        ));
    }

    #[tokio::test]
    async fn test_unknown_target_errors() {
        let broker = SignalingBroker::new();
        let _rpi = connect(&broker, "rpi-conn", "rpi");

        let reply = broker.handle_message(
            "rpi-conn",
            SignalMessage::IceCandidate {
                target: "ghost".to_string(),
                room_id: None,
                candidate: IceCandidateInit {
                    candidate: "candidate:...".to_string(),
                    sdp_mid: None,
                    sdp_mline_index: None,
                },
                client_id: None,
            },
        );
        assert!(matches!(reply, Some(SignalMessage::Error { .. })));
    }

    #[tokio::test]
    async fn test_disconnect_leaves_all_rooms() {
        let broker = SignalingBroker::new();
        let mut rpi = connect(&broker, "rpi-conn", "rpi");
        let _phone = connect(&broker, "phone-conn", "7");

        join(&broker, "rpi-conn", "R", Role::Broadcaster);
        join(&broker, "phone-conn", "R", Role::Viewer);
        let _ = rpi.try_recv();

        broker.unregister("phone-conn");

        let left = rpi.try_recv().unwrap();
        assert_eq!(
            left,
            SignalMessage::ClientLeft {
                room_id: "R".to_string(),
                client_id: "phone-conn".to_string(),
            }
        );

        let overviews = broker.room_overviews();
        assert_eq!(overviews[0].viewers, 0);
        assert_eq!(overviews[0].broadcasters, 1);
    }

    #[tokio::test]
    async fn test_dead_writer_cascades_to_unregister() {
        let broker = SignalingBroker::new();
        let rpi = connect(&broker, "rpi-conn", "rpi");
        let _phone = connect(&broker, "phone-conn", "7");

        join(&broker, "rpi-conn", "R", Role::Broadcaster);
        // Broadcaster's writer dies
        drop(rpi);

        // Viewer joins; notifying the dead broadcaster unregisters it
        join(&broker, "phone-conn", "R", Role::Viewer);

        let clients = broker.room_clients("R");
        assert_eq!(clients.len(), 1);
        assert_eq!(clients[0].client_id, "phone-conn");
    }

    #[tokio::test]
    async fn test_unregistered_sender_rejected() {
        let broker = SignalingBroker::new();
        let reply = broker.handle_message(
            "nobody",
            SignalMessage::Join {
                room_id: "R".to_string(),
                role: Role::Viewer,
            },
        );
        assert!(matches!(reply, Some(SignalMessage::Error { .. })));
    }
}
