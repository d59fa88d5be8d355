//! WebRTC signaling: broker (hub side), client (device side), wire types,
//! and TURN credential minting

pub mod broker;
pub mod client;
pub mod turn;
pub mod types;

pub use broker::{SignalSender, SignalingBroker};
pub use client::{
    NullSignalHandler, PresenceSignal, SignalHandler, SignalOutbox, SignalingClient,
};
pub use turn::{mint_ice_servers, IceServer, IceServersResponse};
pub use types::{ClientSummary, IceCandidateInit, Role, RoomOverview, SignalMessage};
