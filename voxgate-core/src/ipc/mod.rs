//! Messages sent back to the client over the session transport.
//!
//! The transport itself is external: a session hands out a receiver of
//! [`events::OutboundFrame`]s and the host writes them to the socket in
//! order, JSON frames as text and audio frames as binary.

pub mod events;
