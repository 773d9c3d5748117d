// This file is Copyright its original authors, visible in version control
// history.
//
// This file is licensed under the Apache License, Version 2.0 <LICENSE-APACHE
// or http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your option.
// You may not use this file except in accordance with one or both of these
// licenses.

//! Payment-level objects: the payment record, in-flight parts, onion failure interpretation and
//! the retry state machine.

pub mod onion_errors;
pub mod pay_flow;
pub mod payment;
pub mod session;
