// This file is Copyright its original authors, visible in version control
// history.
//
// This file is licensed under the Apache License, Version 2.0 <LICENSE-APACHE
// or http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your option.
// You may not use this file except in accordance with one or both of these
// licenses.

//! The payment engine stamps failure statistics with wall-clock milliseconds
//! so they can decay over real time. The clock is a trait so tests can move
//! time by hand.

use std::time::{SystemTime, UNIX_EPOCH};

/// A source of wall-clock time in milliseconds since the unix epoch.
pub trait TimeProvider: Send + Sync {
	/// Current wall-clock time, in milliseconds.
	fn now_millis(&self) -> u64;
}

/// [`TimeProvider`] backed by [`SystemTime`].
pub struct DefaultTimeProvider;

impl TimeProvider for DefaultTimeProvider {
	fn now_millis(&self) -> u64 {
		SystemTime::now().duration_since(UNIX_EPOCH).map(|d| d.as_millis() as u64).unwrap_or(0)
	}
}
