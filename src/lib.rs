// This file is Copyright its original authors, visible in version control
// history.
//
// This file is licensed under the Apache License, Version 2.0 <LICENSE-APACHE
// or http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your option.
// You may not use this file except in accordance with one or both of these
// licenses.

#![deny(rustdoc::broken_intra_doc_links)]
#![deny(rustdoc::private_intra_doc_links)]
#![deny(missing_docs)]
#![deny(non_upper_case_globals)]
#![deny(non_camel_case_types)]
#![deny(non_snake_case)]
#![deny(unused_mut)]
#![cfg_attr(docsrs, feature(doc_auto_cfg))]

//! Adaptive multi-part payment routing and dispatch for the Lightning Network.
//!
//! Given a destination, an amount and a partially-known channel graph, this crate finds one or
//! more paths that jointly deliver the amount while trading off fee cost against probability of
//! success, dispatches the resulting multi-part payment through a caller-provided
//! [`FlowDispatcher`], and adapts to failures reported hop-by-hop.
//!
//! The three moving parts:
//!
//!  * [`UncertaintyMap`] holds per-direction liquidity bounds for every channel we have learned
//!    something about. It is shared across payments and refined by every attempt.
//!  * [`minflow`] splits an amount into increments and routes each over the cheapest path under a
//!    cost function mixing `-log(P)` reliability cost with fees and time-value of locked funds.
//!  * [`PaymentSession`] is the retry state machine: it searches, dispatches, folds completions
//!    into the payment's running totals, classifies onion failures into belief updates or
//!    disabled channels, and re-searches until success, a fatal error, or the deadline.
//!
//! Invoice decoding, gossip persistence and onion construction are deliberately out of scope;
//! they appear only as data at the crate boundary ([`PaymentParams`], [`GossipSink`]).
//!
//! [`UncertaintyMap`]: crate::routing::uncertainty::UncertaintyMap
//! [`minflow`]: crate::routing::minflow::minflow
//! [`PaymentSession`]: crate::ln::session::PaymentSession
//! [`FlowDispatcher`]: crate::ln::session::FlowDispatcher
//! [`GossipSink`]: crate::ln::session::GossipSink
//! [`PaymentParams`]: crate::ln::payment::PaymentParams

extern crate bitcoin;
extern crate hashbrown;
extern crate possiblyrandom;

#[macro_use]
pub mod util;
pub mod ln;
pub mod routing;

mod prelude {
	pub(crate) use crate::util::hash_tables::*;
	#[allow(unused_imports)]
	pub(crate) use std::vec::Vec;
}
