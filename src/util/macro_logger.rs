// This file is Copyright its original authors, visible in version control
// history.
//
// This file is licensed under the Apache License, Version 2.0 <LICENSE-APACHE
// or http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your option.
// You may not use this file except in accordance with one or both of these
// licenses.

use crate::routing::flow::Flow;

/// Logs a byte slice in hex format.
#[macro_export]
macro_rules! log_bytes {
	($obj: expr) => {
		$crate::util::logger::DebugBytes(&$obj)
	};
}

pub(crate) struct DebugFlows<'a>(pub &'a [Flow]);
impl<'a> core::fmt::Display for DebugFlows<'a> {
	fn fmt(&self, f: &mut core::fmt::Formatter) -> Result<(), core::fmt::Error> {
		for (idx, flow) in self.0.iter().enumerate() {
			writeln!(f, "flow {}:", idx)?;
			for hop in flow.hops.iter() {
				writeln!(
					f,
					" short_channel_id: {}, direction: {}, amount_msat: {}",
					hop.scid, hop.direction, hop.amount_msat
				)?;
			}
			writeln!(f, " success probability {:.4}", flow.success_prob)?;
		}
		Ok(())
	}
}
macro_rules! log_flows {
	($obj: expr) => {
		$crate::util::macro_logger::DebugFlows(&$obj)
	};
}

/// Create a new Record and log it. You probably don't want to use this macro directly,
/// but it needs to be exported so `log_trace` etc can use it in external crates.
#[doc(hidden)]
#[macro_export]
macro_rules! log_internal {
	($logger: expr, $lvl:expr, $($arg:tt)+) => (
		$logger.log($crate::util::logger::Record::new($lvl, format_args!($($arg)+), module_path!(), file!(), line!(), None))
	);
}

/// Logs an entry at the given level.
#[doc(hidden)]
#[macro_export]
macro_rules! log_given_level {
	($logger: expr, $lvl:expr, $($arg:tt)+) => (
		match $lvl {
			$crate::util::logger::Level::Error => $crate::log_internal!($logger, $lvl, $($arg)*),
			$crate::util::logger::Level::Warn => $crate::log_internal!($logger, $lvl, $($arg)*),
			$crate::util::logger::Level::Info => $crate::log_internal!($logger, $lvl, $($arg)*),
			$crate::util::logger::Level::Debug => $crate::log_internal!($logger, $lvl, $($arg)*),
			$crate::util::logger::Level::Trace => $crate::log_internal!($logger, $lvl, $($arg)*),
			$crate::util::logger::Level::Gossip => $crate::log_internal!($logger, $lvl, $($arg)*),
		}
	);
}

/// Log at the `ERROR` level.
#[macro_export]
macro_rules! log_error {
	($logger: expr, $($arg:tt)*) => (
		$crate::log_given_level!($logger, $crate::util::logger::Level::Error, $($arg)*);
	)
}

/// Log at the `WARN` level.
#[macro_export]
macro_rules! log_warn {
	($logger: expr, $($arg:tt)*) => (
		$crate::log_given_level!($logger, $crate::util::logger::Level::Warn, $($arg)*);
	)
}

/// Log at the `INFO` level.
#[macro_export]
macro_rules! log_info {
	($logger: expr, $($arg:tt)*) => (
		$crate::log_given_level!($logger, $crate::util::logger::Level::Info, $($arg)*);
	)
}

/// Log at the `DEBUG` level.
#[macro_export]
macro_rules! log_debug {
	($logger: expr, $($arg:tt)*) => (
		$crate::log_given_level!($logger, $crate::util::logger::Level::Debug, $($arg)*);
	)
}

/// Log at the `TRACE` level.
#[macro_export]
macro_rules! log_trace {
	($logger: expr, $($arg:tt)*) => (
		$crate::log_given_level!($logger, $crate::util::logger::Level::Trace, $($arg)*)
	)
}

/// Log at the `GOSSIP` level.
#[macro_export]
macro_rules! log_gossip {
	($logger: expr, $($arg:tt)*) => (
		$crate::log_given_level!($logger, $crate::util::logger::Level::Gossip, $($arg)*);
	)
}
