// This file is Copyright its original authors, visible in version control
// history.
//
// This file is licensed under the Apache License, Version 2.0 <LICENSE-APACHE
// or http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your option.
// You may not use this file except in accordance with one or both of these
// licenses.

//! Classification of BOLT 4 onion failure codes into the actions the payment loop takes in
//! response, plus the blame policy applied when an error report cannot be attributed to a
//! specific hop.

/// The failing node provides a `channel_update` with this failure.
pub const UPDATE: u16 = 0x1000;
/// Permanent failure (retrying the same thing will fail again).
pub const PERM: u16 = 0x4000;
/// The failing node is at fault, not a specific channel.
pub const NODE: u16 = 0x2000;
/// The onion itself was malformed as received, reported by the node that could not peel it.
pub const BADONION: u16 = 0x8000;

/// A forwarding node lacked the liquidity (or otherwise transiently refused) to forward.
pub const TEMPORARY_CHANNEL_FAILURE: u16 = UPDATE | 7;
/// Permanent failure of the outgoing channel.
pub const PERMANENT_CHANNEL_FAILURE: u16 = PERM | 8;
/// The outgoing channel requires features we did not negotiate.
pub const REQUIRED_CHANNEL_FEATURE_MISSING: u16 = PERM | 9;
/// The forwarding node does not have the requested outgoing channel.
pub const UNKNOWN_NEXT_PEER: u16 = PERM | 10;
/// The HTLC was below the outgoing channel's minimum.
pub const AMOUNT_BELOW_MINIMUM: u16 = UPDATE | 11;
/// The fee offered was below the outgoing channel's requirement.
pub const FEE_INSUFFICIENT: u16 = UPDATE | 12;
/// The CLTV delta offered was below the outgoing channel's requirement.
pub const INCORRECT_CLTV_EXPIRY: u16 = UPDATE | 13;
/// The HTLC expiry is too close to the current height for the node to forward safely.
pub const EXPIRY_TOO_SOON: u16 = UPDATE | 14;
/// The destination rejected the payment: unknown hash, wrong amount, or expired invoice.
pub const INCORRECT_OR_UNKNOWN_PAYMENT_DETAILS: u16 = PERM | 15;
/// The destination received an HTLC whose final CLTV did not match the onion.
pub const FINAL_INCORRECT_CLTV_EXPIRY: u16 = 18;
/// The destination received an HTLC whose amount did not match the onion.
pub const FINAL_INCORRECT_HTLC_AMOUNT: u16 = 19;
/// The outgoing channel is disabled.
pub const CHANNEL_DISABLED: u16 = UPDATE | 20;
/// The HTLC expiry is too far in the future.
pub const EXPIRY_TOO_FAR: u16 = 21;
/// The destination timed out waiting for the rest of a multi-part payment.
pub const MPP_TIMEOUT: u16 = 23;
/// Onion HMAC was incorrect as received.
pub const INVALID_ONION_HMAC: u16 = BADONION | PERM | 5;
/// Onion version byte was unknown as received.
pub const INVALID_ONION_VERSION: u16 = BADONION | PERM | 4;
/// Onion ephemeral key was unparseable as received.
pub const INVALID_ONION_KEY: u16 = BADONION | PERM | 6;
/// Onion payload was unparseable by the reporting node.
pub const INVALID_ONION_PAYLOAD: u16 = PERM | 22;
/// The reporting node is temporarily unable to forward anything.
pub const TEMPORARY_NODE_FAILURE: u16 = NODE | 2;
/// The reporting node is permanently unable to forward anything.
pub const PERMANENT_NODE_FAILURE: u16 = PERM | NODE | 2;
/// The reporting node requires features we did not negotiate.
pub const REQUIRED_NODE_FEATURE_MISSING: u16 = PERM | NODE | 3;

/// What the payment loop should do about a failed part, derived purely from the failure code
/// and whether the destination reported it.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum FailureAction {
	/// A liquidity shortfall at the erring channel: cap its believed maximum below the amount
	/// we tried, then retry.
	TightenMax,
	/// Remove the erring channel from consideration for the rest of this payment, then retry.
	DisableChannel,
	/// The error carries a `channel_update` to hand to the gossip layer before retrying. If no
	/// update is attached or the gossip layer rejects it, fall back to disabling the channel.
	ForwardUpdate,
	/// No belief change warranted; retry the remaining amount (the destination gave up waiting
	/// for other parts).
	ContinueMpp,
	/// The destination itself refused the payment. Fatal for the whole payment.
	FatalDestination {
		/// The BOLT 4 failure code the destination returned.
		failcode: u16,
	},
}

/// Maps a failure code to the action the payment loop takes.
///
/// `from_destination` distinguishes codes like [`INCORRECT_OR_UNKNOWN_PAYMENT_DETAILS`] which
/// are fatal from the destination but indicate a broken intermediate node anywhere else.
pub fn classify_failure(failcode: u16, from_destination: bool) -> FailureAction {
	match failcode {
		MPP_TIMEOUT => FailureAction::ContinueMpp,
		TEMPORARY_CHANNEL_FAILURE if !from_destination => FailureAction::TightenMax,
		AMOUNT_BELOW_MINIMUM | FEE_INSUFFICIENT | INCORRECT_CLTV_EXPIRY | EXPIRY_TOO_SOON
			if !from_destination =>
		{
			FailureAction::ForwardUpdate
		},
		INCORRECT_OR_UNKNOWN_PAYMENT_DETAILS | FINAL_INCORRECT_CLTV_EXPIRY
		| FINAL_INCORRECT_HTLC_AMOUNT
			if from_destination =>
		{
			FailureAction::FatalDestination { failcode }
		},
		PERMANENT_CHANNEL_FAILURE | REQUIRED_CHANNEL_FEATURE_MISSING | UNKNOWN_NEXT_PEER
		| CHANNEL_DISABLED | EXPIRY_TOO_FAR | INVALID_ONION_HMAC | INVALID_ONION_VERSION
		| INVALID_ONION_KEY
		| INVALID_ONION_PAYLOAD | TEMPORARY_NODE_FAILURE | PERMANENT_NODE_FAILURE
		| REQUIRED_NODE_FEATURE_MISSING => FailureAction::DisableChannel,
		// Codes we don't recognize: a destination sending us garbage is fatal (it clearly
		// received the payment attempt and won't take it), anyone else gets disabled.
		_ => {
			if from_destination {
				FailureAction::FatalDestination { failcode }
			} else {
				FailureAction::DisableChannel
			}
		},
	}
}

/// Picks which hop to penalize when a failed part's error report could not be parsed or
/// attributed, so we cannot know who actually failed.
pub trait BlamePolicy {
	/// Returns the index of the hop to blame, in `0..path_len`. Index `i` is the channel from
	/// the `i`th node on the path; `path_len - 1` is the channel delivering to the
	/// destination.
	fn blame_hop(&mut self, path_len: usize) -> usize;
}

/// Blames a hop chosen at random, avoiding both endpoints on paths long enough to have a
/// middle: we know our own first hop relayed (it accepted the HTLC), and an unparseable error
/// from a node adjacent to the destination would be indistinguishable from destination
/// misbehavior we'd rather not conclude from garbage.
pub struct RandomizedBlame;

fn random_below(n: u64) -> u64 {
	debug_assert!(n > 0);
	let mut bytes = [0u8; 8];
	possiblyrandom::getpossiblyrandom(&mut bytes);
	u64::from_le_bytes(bytes) % n
}

impl BlamePolicy for RandomizedBlame {
	fn blame_hop(&mut self, path_len: usize) -> usize {
		debug_assert!(path_len > 0);
		if path_len == 1 {
			0
		} else if path_len > 3 {
			1 + random_below(path_len as u64 - 2) as usize
		} else {
			random_below(path_len as u64 - 1) as usize
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn liquidity_failures_tighten() {
		assert_eq!(
			classify_failure(TEMPORARY_CHANNEL_FAILURE, false),
			FailureAction::TightenMax
		);
		// The same code from the destination makes no sense as a liquidity report; treat the
		// node as broken.
		assert_eq!(
			classify_failure(TEMPORARY_CHANNEL_FAILURE, true),
			FailureAction::FatalDestination { failcode: TEMPORARY_CHANNEL_FAILURE }
		);
	}

	#[test]
	fn update_carrying_failures_forward() {
		for code in
			[AMOUNT_BELOW_MINIMUM, FEE_INSUFFICIENT, INCORRECT_CLTV_EXPIRY, EXPIRY_TOO_SOON]
		{
			assert_eq!(classify_failure(code, false), FailureAction::ForwardUpdate);
		}
		// A disabled channel is structurally unusable for this payment, update or not.
		assert_eq!(classify_failure(CHANNEL_DISABLED, false), FailureAction::DisableChannel);
	}

	#[test]
	fn destination_refusals_are_fatal() {
		for code in [
			INCORRECT_OR_UNKNOWN_PAYMENT_DETAILS,
			FINAL_INCORRECT_CLTV_EXPIRY,
			FINAL_INCORRECT_HTLC_AMOUNT,
		] {
			assert_eq!(
				classify_failure(code, true),
				FailureAction::FatalDestination { failcode: code }
			);
		}
		// An intermediate node returning a final-hop code is lying or broken; route around it.
		assert_eq!(
			classify_failure(INCORRECT_OR_UNKNOWN_PAYMENT_DETAILS, false),
			FailureAction::DisableChannel
		);
	}

	#[test]
	fn mpp_timeout_just_retries() {
		assert_eq!(classify_failure(MPP_TIMEOUT, true), FailureAction::ContinueMpp);
		assert_eq!(classify_failure(MPP_TIMEOUT, false), FailureAction::ContinueMpp);
	}

	#[test]
	fn structural_failures_disable() {
		for code in [PERMANENT_CHANNEL_FAILURE, UNKNOWN_NEXT_PEER, PERMANENT_NODE_FAILURE,
			INVALID_ONION_HMAC, EXPIRY_TOO_FAR]
		{
			assert_eq!(classify_failure(code, false), FailureAction::DisableChannel);
		}
	}

	#[test]
	fn unknown_codes_depend_on_source() {
		assert_eq!(classify_failure(0x3fff, false), FailureAction::DisableChannel);
		assert_eq!(
			classify_failure(0x3fff, true),
			FailureAction::FatalDestination { failcode: 0x3fff }
		);
	}

	#[test]
	fn randomized_blame_avoids_endpoints_on_long_paths() {
		let mut policy = RandomizedBlame;
		for _ in 0..200 {
			let hop = policy.blame_hop(5);
			assert!(hop >= 1 && hop <= 3);
		}
	}

	#[test]
	fn randomized_blame_short_paths() {
		let mut policy = RandomizedBlame;
		assert_eq!(policy.blame_hop(1), 0);
		for _ in 0..50 {
			// Two hops: never blame the hop delivering to the destination.
			assert_eq!(policy.blame_hop(2), 0);
			assert!(policy.blame_hop(3) < 2);
		}
	}
}
