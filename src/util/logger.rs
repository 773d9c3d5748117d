// Pruned copy of crate rust log, without global logger
// https://github.com/rust-lang-nursery/log #7a60286
//
// This file is licensed under the Apache License, Version 2.0 <LICENSE-APACHE
// or http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your option.
// You may not use this file except in accordance with one or both of these
// licenses.

//! Log traits live here, which are called throughout the library to provide useful information for
//! debugging purposes.
//!
//! Log messages should be filtered client-side by implementing check against a given [`Record`]'s
//! [`Level`] field. Each module may have its own Logger or share one.

use core::cmp;
use core::fmt;
use core::fmt::Display;
use core::ops::Deref;

use crate::ln::payment::PaymentHash;

static LOG_LEVEL_NAMES: [&'static str; 6] = ["GOSSIP", "TRACE", "DEBUG", "INFO", "WARN", "ERROR"];

/// An enum representing the available verbosity levels of the logger.
#[derive(Copy, Clone, PartialEq, Eq, Debug, Hash)]
pub enum Level {
	/// Designates extremely verbose information, including gossip-induced messages
	Gossip,
	/// Designates very low priority, often extremely verbose, information
	Trace,
	/// Designates lower priority information
	Debug,
	/// Designates useful information
	Info,
	/// Designates hazardous situations
	Warn,
	/// Designates very serious errors
	Error,
}

impl PartialOrd for Level {
	#[inline]
	fn partial_cmp(&self, other: &Level) -> Option<cmp::Ordering> {
		Some(self.cmp(other))
	}
}

impl Ord for Level {
	#[inline]
	fn cmp(&self, other: &Level) -> cmp::Ordering {
		(*self as usize).cmp(&(*other as usize))
	}
}

impl fmt::Display for Level {
	fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
		fmt.pad(LOG_LEVEL_NAMES[*self as usize])
	}
}

impl Level {
	/// Returns the most verbose logging level.
	#[inline]
	pub fn max() -> Level {
		Level::Gossip
	}
}

/// A Record, unit of logging output with Metadata to enable filtering
/// Module_path, file, line to inform on log's source
#[derive(Clone, Debug)]
pub struct Record<'a> {
	/// The verbosity level of the message.
	pub level: Level,
	/// The message body.
	pub args: fmt::Arguments<'a>,
	/// The module path of the message.
	pub module_path: &'static str,
	/// The source file containing the message.
	pub file: &'static str,
	/// The line containing the message.
	pub line: u32,
	/// The payment hash.
	///
	/// Note that this is only filled in for logs pertaining to a specific payment, and will be
	/// `None` for logs which are not directly related to a payment.
	pub payment_hash: Option<PaymentHash>,
}

impl<'a> Record<'a> {
	/// Returns a new Record.
	#[inline]
	pub fn new(
		level: Level, args: fmt::Arguments<'a>, module_path: &'static str, file: &'static str,
		line: u32, payment_hash: Option<PaymentHash>,
	) -> Record<'a> {
		Record { level, args, module_path, file, line, payment_hash }
	}
}

impl<'a> Display for Record<'a> {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "{:<5} [{}:{}]", self.level, self.module_path, self.line)?;
		if let Some(payment_hash) = self.payment_hash {
			write!(f, " h:{}", DebugBytes(&payment_hash.0))?;
		}
		write!(f, " {}", self.args)
	}
}

/// A trait encapsulating the operations required of a logger. Keep in mind that log messages might
/// not be entirely self-explanatory and may need accompanying context fields to be fully
/// understood.
pub trait Logger {
	/// Logs the [`Record`]. Since [`Record::payment_hash`] is not embedded in the message body,
	/// log implementations should print it alongside the message to keep entries clear.
	fn log(&self, record: Record);
}

/// Adds relevant context to a [`Record`] before passing it to the wrapped [`Logger`].
pub struct WithContext<'a, L: Deref>
where
	L::Target: Logger,
{
	/// The logger to delegate to after adding context to the record.
	logger: &'a L,
	/// The payment hash of the payment pertaining to the logged record.
	payment_hash: Option<PaymentHash>,
}

impl<'a, L: Deref> Logger for WithContext<'a, L>
where
	L::Target: Logger,
{
	fn log(&self, mut record: Record) {
		if self.payment_hash.is_some() {
			record.payment_hash = self.payment_hash;
		}
		self.logger.log(record)
	}
}

impl<'a, L: Deref> WithContext<'a, L>
where
	L::Target: Logger,
{
	/// Wraps the given logger, providing additional context to any logged records.
	pub fn from(logger: &'a L, payment_hash: Option<PaymentHash>) -> Self {
		WithContext { logger, payment_hash }
	}
}

/// Wrapper for logging byte slices in hex format.
#[doc(hidden)]
pub struct DebugBytes<'a>(pub &'a [u8]);
impl<'a> core::fmt::Display for DebugBytes<'a> {
	fn fmt(&self, f: &mut core::fmt::Formatter) -> Result<(), core::fmt::Error> {
		for i in self.0 {
			write!(f, "{:02x}", i)?;
		}
		Ok(())
	}
}
