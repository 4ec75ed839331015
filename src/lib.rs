#![cfg_attr(not(test), deny(clippy::panic))]
#![allow(
    clippy::missing_errors_doc,
    clippy::missing_panics_doc,
    clippy::module_name_repetitions,
    clippy::too_many_lines
)]

//! # Scene Sync Node
//!
//! A real-time multiplayer sync node for a grid-partitioned 3D world.
//!
//! The world is a 100x100 grid of maps; each map hosts at most one room on
//! this node. Clients connect over WebSocket, prove control of a public key
//! via challenge-response, and exchange positions, chats and emotes with the
//! other clients in their room. Nodes announce themselves to a set of
//! discovery relays with periodic signed heartbeat records.

/// Node-state heartbeat publishing
pub mod announcer;

/// Challenge-response verification of client identities
pub mod auth;

/// Server configuration and environment variables
pub mod config;

/// Heartbeat ingestion and network-state projection
pub mod discovery;

/// Map grid and area-of-interest cell math
pub mod grid;

/// Structured logging configuration
pub mod logging;

/// Room creation, routing policy and empty-room reaping
pub mod manager;

/// Metrics collection and reporting
pub mod metrics;

/// WebSocket message protocol definitions
pub mod protocol;

/// Outbound relay sessions and the session pool
pub mod relay;

/// Per-map room state and message fan-out
pub mod room;

/// Served-map selection via frontier expansion
pub mod selector;

/// Signed discovery events and key handling
pub mod signer;

/// WebSocket connection handling
pub mod websocket;
