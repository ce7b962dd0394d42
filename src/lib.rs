//! I/O substrate for NAT port mapping.
//!
//! Port mapping protocols — NAT-PMP, PCP and UPnP IGD — all boil down to a
//! client exchanging small messages with a gateway device, over UDP sockets,
//! TCP streams and the occasional helper process. This crate provides the
//! substrate those protocol drivers run on:
//!
//! - [`bus`]: the single-consumer FIFO queue that is the only way anything
//!   in this crate communicates across tasks.
//! - [`network`]: the [`NetworkGateway`], a single-task reactor multiplexing
//!   any number of non-blocking UDP and TCP sockets. Sockets are created,
//!   written to and closed by sending [`NetworkRequest`] messages; all reads,
//!   write completions and failures come back as [`NetworkEvent`]s on the
//!   response bus the caller registered.
//! - [`process`]: the [`ProcessGateway`], the same idea for child processes
//!   and their stdio streams.
//! - [`natpmp`] and [`pcp`]: the wire codecs drivers feed through the
//!   network gateway.
//!
//! Gateways are single-threaded actors by construction: each owns its state
//! inside one task, suspends only on its inbox (and socket readiness), and
//! is reachable exclusively through its request bus. Every id a gateway
//! hands out is eventually followed by exactly one terminal event on its
//! response bus — a close confirmation, an exit notification or a resource
//! error — on every path, including gateway shutdown.

#![deny(missing_docs, rustdoc::broken_intra_doc_links)]

pub mod bus;
pub mod natpmp;
pub mod network;
pub mod pcp;
pub mod process;

mod interfaces;
mod util;

pub use bus::{Bus, Inbox};
pub use interfaces::local_addresses;
pub use network::{NetworkEvent, NetworkGateway, NetworkRequest, SocketId};
pub use process::{ProcessEvent, ProcessGateway, ProcessId, ProcessRequest, StdioSource};
