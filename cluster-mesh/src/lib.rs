//! Full-mesh message passing between the nodes of a small cluster.
//!
//! Every node listens on its own address and keeps one outbound TCP
//! connection to every node in the peer list, itself included. Application
//! code talks to a node only through its mailbox: envelopes go into an
//! [`Outbox`] and arrive in the target's [`Inbox`]. Each module handles one
//! part of that path:
//!
//! - [`config`] loads the peer list into an immutable [`PeerTable`].
//! - [`topology`] binds every listener, wires the N² connections, and starts
//!   the nodes.
//! - [`codec`] turns envelopes into length-prefixed frames and back.
//! - [`dispatcher`] drains an outbox, expands broadcasts, and assigns
//!   message ids.
//! - [`receiver`] accepts inbound connections and fills the inbox.
//! - [`node`] ties one dispatcher and one receiver to a mailbox.
//! - [`load`] drives a whole cluster through its mailboxes and counts what
//!   arrives.
//! - [`cli`] and [`console`] back the `cluster-mesh` binary.

pub mod cli;
pub mod codec;
pub mod config;
pub mod console;
pub mod dispatcher;
pub mod envelope;
pub mod load;
pub mod node;
pub mod receiver;
pub mod topology;

pub use config::{NodeId, PeerTable, BROADCAST};
pub use envelope::Envelope;
pub use node::{Inbox, Node, Outbox};
pub use topology::{Cluster, TopologyBuilder};
