// This file is Copyright its original authors, visible in version control
// history.
//
// This file is licensed under the Apache License, Version 2.0 <LICENSE-APACHE
// or http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your option.
// You may not use this file except in accordance with one or both of these
// licenses.

//! The [`Payment`] record: one user-level payment intent and everything we accumulate while
//! trying to fulfill it.

use core::fmt;
use std::time::Instant;

use crate::prelude::*;
use crate::routing::gossip::NodeId;
use crate::routing::minflow::FlowParams;

/// The payment hash identifying an HTLC and, by extension, a payment.
#[derive(Hash, Copy, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct PaymentHash(pub [u8; 32]);

impl fmt::Display for PaymentHash {
	fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
		for byte in self.0.iter() {
			write!(f, "{:02x}", byte)?;
		}
		Ok(())
	}
}
impl fmt::Debug for PaymentHash {
	fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
		write!(f, "PaymentHash({})", self)
	}
}

/// The preimage whose SHA256 is a [`PaymentHash`]; possession proves the destination was paid.
#[derive(Hash, Copy, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct PaymentPreimage(pub [u8; 32]);

impl fmt::Debug for PaymentPreimage {
	fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
		write!(f, "PaymentPreimage(..)")?;
		Ok(())
	}
}

/// When no explicit fee budget is given, allow the larger of this flat amount or
/// [`DEFAULT_FEE_BUDGET_DIVISOR`]th of the payment.
pub const DEFAULT_BASE_FEE_BUDGET_MSAT: u64 = 5_000;
/// Default proportional fee budget: 1/200th, i.e. 0.5%.
pub const DEFAULT_FEE_BUDGET_DIVISOR: u64 = 200;

/// Caller-supplied description of one payment to make.
#[derive(Clone, Debug)]
pub struct PaymentParams {
	/// Who to pay.
	pub destination: NodeId,
	/// The payment hash from the invoice.
	pub payment_hash: PaymentHash,
	/// The amount the destination must receive, in millisatoshi.
	pub amount_msat: u64,
	/// Maximum total routing fee across all parts, or `None` for the default of
	/// max(5000 msat, 0.5% of the amount).
	pub max_fee_msat: Option<u64>,
	/// Maximum acceptable CLTV delay, in blocks, from first hop to final expiry.
	pub max_delay: u32,
	/// The final CLTV delta the invoice demands for the last hop.
	pub final_cltv_delta: u32,
	/// Absolute deadline: no new searches or dispatches after this point.
	pub stop_time: Instant,
	/// Minimum aggregate success probability below which a flow set is "too unlikely".
	pub prob_floor: f64,
	/// Accept a flow set below the probability floor when the only alternative within the fee
	/// budget is giving up.
	pub accept_risky: bool,
}

/// Why a payment could not be made (or could not even be attempted). Retryable protocol errors
/// never appear here; they are absorbed into belief updates and retries.
#[derive(Clone, Debug, PartialEq)]
pub enum PaymentError {
	/// The amount was zero or overflowed together with its fee budget.
	InvalidAmount,
	/// The destination is our own node.
	SelfPayment,
	/// No feasible flow set under current beliefs and budgets.
	RouteNotFound {
		/// The amount that had no route when the search gave up.
		remaining_msat: u64,
		/// The fee budget that constrained the search.
		fee_budget_msat: u64,
	},
	/// The destination rejected the payment outright.
	DestinationFailure {
		/// The BOLT 4 failure code the destination returned.
		failcode: u16,
	},
	/// The deadline passed with undelivered amount outstanding.
	DeadlineExpired,
}

impl fmt::Display for PaymentError {
	fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
		match self {
			PaymentError::InvalidAmount => write!(f, "invalid payment amount"),
			PaymentError::SelfPayment => write!(f, "refusing to pay ourselves"),
			PaymentError::RouteNotFound { remaining_msat, fee_budget_msat } => write!(
				f,
				"no route found for {} msat within fee budget {} msat",
				remaining_msat, fee_budget_msat
			),
			PaymentError::DestinationFailure { failcode } => {
				write!(f, "destination failed the payment with code {:#06x}", failcode)
			},
			PaymentError::DeadlineExpired => write!(f, "payment deadline expired"),
		}
	}
}

impl std::error::Error for PaymentError {}

/// One user-level payment intent, mutated by every dispatch and reply until it completes or
/// fails.
pub struct Payment {
	/// Who we are paying.
	pub destination: NodeId,
	/// The payment hash all parts share.
	pub payment_hash: PaymentHash,
	/// The amount the destination must receive.
	pub amount_msat: u64,
	/// The routing fee budget across all parts.
	pub fee_budget_msat: u64,
	/// Maximum acceptable worst-path CLTV delay, in blocks.
	pub max_delay: u32,
	/// The invoice's final-hop CLTV delta.
	pub final_cltv_delta: u32,
	/// Absolute deadline for new searches and dispatches.
	pub stop_time: Instant,
	/// Shared id tying all parts of this attempt together on the wire.
	pub groupid: u64,
	/// Next part id to hand out. Part ids start at 1.
	pub next_partid: u64,
	/// Total amount dispatched and not yet failed, including fees.
	pub total_sent_msat: u64,
	/// Total amount currently en route to (or arrived at) the destination, excluding fees.
	pub total_delivering_msat: u64,
	/// Search weights, carried across retries so adjustments persist.
	pub flow_params: FlowParams,
	/// Aggregate probability floor for the tradeoff search.
	pub prob_floor: f64,
	/// Whether a below-floor flow set may be accepted when fees and probability cannot both be
	/// satisfied.
	pub accept_risky: bool,
	/// Channels disabled for the remainder of this payment only.
	pub disabled_scids: HashSet<u64>,
	paynotes: Vec<String>,
}

impl Payment {
	/// Builds the payment record, applying the default fee budget if none was given.
	///
	/// Input validation (zero amount, overflow, self-payment) happens in
	/// [`PaymentSession::new`], which is the only caller that matters.
	///
	/// [`PaymentSession::new`]: crate::ln::session::PaymentSession::new
	pub fn new(params: &PaymentParams, groupid: u64) -> Payment {
		let fee_budget_msat = params.max_fee_msat.unwrap_or_else(|| {
			DEFAULT_BASE_FEE_BUDGET_MSAT.max(params.amount_msat / DEFAULT_FEE_BUDGET_DIVISOR)
		});
		Payment {
			destination: params.destination,
			payment_hash: params.payment_hash,
			amount_msat: params.amount_msat,
			fee_budget_msat,
			max_delay: params.max_delay,
			final_cltv_delta: params.final_cltv_delta,
			stop_time: params.stop_time,
			groupid,
			next_partid: 1,
			total_sent_msat: 0,
			total_delivering_msat: 0,
			flow_params: FlowParams::default(),
			prob_floor: params.prob_floor,
			accept_risky: params.accept_risky,
			disabled_scids: new_hash_set(),
			paynotes: Vec::new(),
		}
	}

	/// The amount still missing at the destination, counting amounts currently in flight as
	/// delivered (they are removed again if their part fails).
	pub fn remaining_msat(&self) -> u64 {
		self.amount_msat.saturating_sub(self.total_delivering_msat)
	}

	/// The fee budget not yet spoken for by dispatched parts.
	pub fn remaining_fee_budget_msat(&self) -> u64 {
		let fees_in_flight =
			self.total_sent_msat.saturating_sub(self.total_delivering_msat);
		self.fee_budget_msat.saturating_sub(fees_in_flight)
	}

	/// Appends a human-readable note to the payment's log. Notes record every decision made
	/// during search and execution and are exposed by the status query.
	pub fn note(&mut self, note: String) {
		self.paynotes.push(note);
	}

	/// The ordered note log.
	pub fn notes(&self) -> &[String] {
		&self.paynotes
	}
}

/// A point-in-time view of a payment, as returned by status queries.
#[derive(Clone, Debug)]
pub struct PaymentStatus {
	/// Who the payment is to.
	pub destination: NodeId,
	/// The amount the destination must receive.
	pub amount_msat: u64,
	/// Total dispatched and not yet failed, including fees.
	pub total_sent_msat: u64,
	/// Total en route to or arrived at the destination.
	pub total_delivering_msat: u64,
	/// The running note log produced during search and execution.
	pub notes: Vec<String>,
}
