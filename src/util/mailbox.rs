// This file is Copyright its original authors, visible in version control
// history.
//
// This file is licensed under the Apache License, Version 2.0 <LICENSE-APACHE
// or http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your option.
// You may not use this file except in accordance with one or both of these
// licenses.

//! Per-actor mailboxes. Every state machine in this crate owns a private FIFO
//! drained by a single consumer task, so each machine is strictly sequential
//! internally while distinct machines run in parallel. Posting a message is
//! fire-and-forget: it never blocks and a message sent to a machine that has
//! already shut down is silently dropped.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::mpsc;

/// A state machine driven by messages delivered one at a time.
///
/// `process` must not block: all I/O happens through collaborators which post
/// their results back as messages. Cooperative timers are expressed with
/// [`Mailbox::send_delayed`].
pub trait Actor: Send + 'static {
	/// The message type this machine consumes.
	type Message: Send + 'static;
	/// Handles one message. Called from the machine's dedicated consumer task.
	fn process(&mut self, msg: Self::Message);
}

enum MailboxInner<M> {
	Task(mpsc::UnboundedSender<M>),
	Queue(Arc<Mutex<VecDeque<M>>>),
}

/// A handle for posting messages to one actor's FIFO.
///
/// Handles are cheap to clone and may be shared across threads; they are the
/// only way actors refer to each other (no actor ever holds another actor's
/// state directly).
pub struct Mailbox<M> {
	inner: MailboxInner<M>,
}

impl<M> Clone for Mailbox<M> {
	fn clone(&self) -> Self {
		let inner = match &self.inner {
			MailboxInner::Task(tx) => MailboxInner::Task(tx.clone()),
			MailboxInner::Queue(q) => MailboxInner::Queue(Arc::clone(q)),
		};
		Mailbox { inner }
	}
}

impl<M: Send + 'static> Mailbox<M> {
	/// Posts a message onto the actor's FIFO. Never blocks.
	pub fn send(&self, msg: M) {
		match &self.inner {
			MailboxInner::Task(tx) => {
				let _ = tx.send(msg);
			},
			MailboxInner::Queue(q) => q.lock().unwrap().push_back(msg),
		}
	}

	/// Posts a message after `delay` has elapsed, without blocking the caller.
	///
	/// In the collecting test mode the message is enqueued immediately so that
	/// scheduled work is observable.
	pub fn send_delayed(&self, msg: M, delay: Duration) {
		match &self.inner {
			MailboxInner::Task(tx) => {
				let tx = tx.clone();
				tokio::spawn(async move {
					tokio::time::sleep(delay).await;
					let _ = tx.send(msg);
				});
			},
			MailboxInner::Queue(q) => q.lock().unwrap().push_back(msg),
		}
	}

	/// A mailbox which collects posted messages instead of delivering them.
	/// Tests drain it with [`Mailbox::drain`] and feed messages to `process`
	/// by hand, which keeps message interleavings deterministic.
	pub fn collector() -> Mailbox<M> {
		Mailbox { inner: MailboxInner::Queue(Arc::new(Mutex::new(VecDeque::new()))) }
	}

	/// Removes and returns every message collected so far. Returns an empty
	/// vector for task-backed mailboxes.
	pub fn drain(&self) -> Vec<M> {
		match &self.inner {
			MailboxInner::Task(_) => Vec::new(),
			MailboxInner::Queue(q) => q.lock().unwrap().drain(..).collect(),
		}
	}

	/// A type-erased sink posting into this mailbox.
	pub fn sink(&self) -> MessageSink<M> {
		let mailbox = self.clone();
		MessageSink(Arc::new(move |msg| mailbox.send(msg)))
	}

	/// A type-erased sink which maps messages of another kind into this
	/// mailbox's message type before posting. This is how a child machine
	/// reports to its supervisor without knowing the supervisor's full
	/// message vocabulary.
	pub fn sink_map<N: Send + 'static, F: Fn(N) -> M + Send + Sync + 'static>(&self, f: F) -> MessageSink<N> {
		let mailbox = self.clone();
		MessageSink(Arc::new(move |msg| mailbox.send(f(msg))))
	}
}

/// A cloneable, type-erased destination for messages of one kind.
pub struct MessageSink<M>(Arc<dyn Fn(M) + Send + Sync>);

impl<M> Clone for MessageSink<M> {
	fn clone(&self) -> Self {
		MessageSink(Arc::clone(&self.0))
	}
}

impl<M: Send + 'static> MessageSink<M> {
	/// Wraps an arbitrary delivery function.
	pub fn new(f: impl Fn(M) + Send + Sync + 'static) -> Self {
		MessageSink(Arc::new(f))
	}

	/// Posts one message.
	pub fn deliver(&self, msg: M) {
		(self.0)(msg)
	}
}

/// Spawns an actor on its own single-consumer task and returns its mailbox.
///
/// The builder receives the new mailbox first so the actor can keep a handle
/// to itself for delayed self-sends. Must be called from within a tokio
/// runtime.
pub fn spawn<A: Actor, F: FnOnce(Mailbox<A::Message>) -> A>(build: F) -> Mailbox<A::Message> {
	let (tx, mut rx) = mpsc::unbounded_channel();
	let mailbox = Mailbox { inner: MailboxInner::Task(tx) };
	let mut actor = build(mailbox.clone());
	tokio::spawn(async move {
		while let Some(msg) = rx.recv().await {
			actor.process(msg);
		}
	});
	mailbox
}
