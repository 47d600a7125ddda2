//! Xare - Single-Peer XMPP Bot
//!
//! Connects to an XMPP account, prints what one peer sent while the bot was
//! offline, and optionally sends that peer one OMEMO-encrypted message and
//! one file.
//!
//! Key principles:
//! - One peer per run
//! - Nothing leaves unencrypted
//! - Only devices the operator trusted receive messages
//! - Session and trust state in a single JSON table

pub mod xmpp;
