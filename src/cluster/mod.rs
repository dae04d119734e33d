//! Cluster membership and leader fault detection.
//!
//! Followers run [`leader_fd::LeaderFaultDetection`] against the elected
//! leader; the leader answers pings through
//! [`ping_handler::LeaderPingValidator`].  Both sides talk through the
//! [`transport::Transport`] trait and read membership from
//! [`state::MembershipView`].

pub mod discovery;
pub mod leader_fd;
pub mod messages;
pub mod node;
pub mod ping_handler;
pub mod scheduler;
pub mod state;
pub mod transport;
