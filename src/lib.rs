// This file is Copyright its original authors, visible in version control
// history.
//
// This file is licensed under the Apache License, Version 2.0 <LICENSE-APACHE
// or http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your option.
// You may not use this file except in accordance with one or both of these
// licenses.

//! Photon is the core of a Lightning Network client, split into two engines:
//!
//! * A gossip synchronization engine ([`routing::sync`]) which discovers the
//!   public channel topology from several untrusted peers at once and only
//!   admits facts corroborated by more than a configured number of them.
//! * An outgoing multi-part payment engine ([`ln::payment_master`] and
//!   [`ln::outbound_payment`]) which shards a payment across local channels,
//!   reacts to local and remote failures, and reconciles HTLC resolution.
//!
//! Transport encryption, channel commitment machinery, invoice parsing, the
//! persistent router database and the path-finder are deliberately external:
//! the crate consumes them through the traits in [`routing::sync`],
//! [`routing::gossip`], [`routing::router`] and [`ln::payment_master`].
//!
//! Every state machine here is a cooperative actor: a private FIFO with a
//! single consumer task (see [`util::mailbox`]). Posting a message never
//! blocks and processing never performs I/O directly.

#![deny(non_upper_case_globals)]
#![deny(non_camel_case_types)]
#![deny(non_snake_case)]
#![deny(unused_mut)]

#[macro_use]
pub mod util;
pub mod ln;
pub mod routing;
