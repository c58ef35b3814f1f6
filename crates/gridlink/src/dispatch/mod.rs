// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 gridlink.dev

//! Message dispatcher.
//!
//! Routes accepted inbound messages to handlers registered per submessage
//! tag, and runs outbound write hooks that stamp cross-cutting tags onto a
//! message before it leaves.
//!
//! Every top-level key in a message's submessage tree for which a read
//! handler is registered fires that handler exactly once with the full
//! message and the sender's uuid. Registration order inside one tag is
//! stable; order across tags is not guaranteed.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::message::{KvTree, Message};

/// Inbound handler: full message plus the sending peer's uuid.
pub type ReadHandler = Arc<dyn Fn(&Message, &str) + Send + Sync>;

/// Outbound hook: mutable access to the submessage tree before send.
pub type WriteHook = Arc<dyn Fn(&mut KvTree) + Send + Sync>;

/// Tag-keyed handler registries.
#[derive(Default)]
pub struct Dispatcher {
    read_handlers: Mutex<HashMap<String, Vec<ReadHandler>>>,
    write_hooks: Mutex<Vec<(String, WriteHook)>>,
}

impl Dispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a read handler for one submessage tag.
    pub fn register_read_handler<F>(&self, tag: &str, handler: F)
    where
        F: Fn(&Message, &str) + Send + Sync + 'static,
    {
        self.read_handlers
            .lock()
            .entry(tag.to_string())
            .or_default()
            .push(Arc::new(handler));
        log::debug!("[dispatch] read handler registered for tag {}", tag);
    }

    /// Register an outbound write hook for one submessage tag. Hooks run in
    /// registration order on every outbound message.
    pub fn register_write_hook<F>(&self, tag: &str, hook: F)
    where
        F: Fn(&mut KvTree) + Send + Sync + 'static,
    {
        self.write_hooks
            .lock()
            .push((tag.to_string(), Arc::new(hook)));
        log::debug!("[dispatch] write hook registered for tag {}", tag);
    }

    /// Fan an accepted inbound message out to its handlers.
    pub fn handle_inbound(&self, msg: &Message, source: &str) {
        // Snapshot the handler lists so a handler may register handlers
        // without deadlocking.
        let mut firing: Vec<ReadHandler> = Vec::new();
        {
            let handlers = self.read_handlers.lock();
            for tag in msg.submessages.keys() {
                if let Some(list) = handlers.get(tag) {
                    firing.extend(list.iter().cloned());
                }
            }
        }
        for handler in firing {
            handler(msg, source);
        }
    }

    /// Run every write hook over an outgoing message's submessage tree.
    pub fn handle_outbound(&self, submessages: &mut KvTree) {
        let hooks: Vec<WriteHook> = self
            .write_hooks
            .lock()
            .iter()
            .map(|(_, hook)| hook.clone())
            .collect();
        for hook in hooks {
            hook(submessages);
        }
    }
}

/// Composes a read handler with a pre-processing step, producing a handler
/// of the same signature.
pub struct Prehandler;

impl Prehandler {
    pub fn compose<P, H>(pre: P, handler: H) -> impl Fn(&Message, &str) + Send + Sync
    where
        P: Fn(&Message, &str) + Send + Sync,
        H: Fn(&Message, &str) + Send + Sync,
    {
        move |msg, source| {
            pre(msg, source);
            handler(msg, source);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::StatusCode;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn message_with(tags: &[&str]) -> Message {
        let mut msg = Message::new(StatusCode::Ok);
        for tag in tags {
            let mut sub = KvTree::new();
            sub.put("x", "1");
            msg.submessages.put_child(*tag, sub);
        }
        msg
    }

    #[test]
    fn test_handler_fires_once_per_registered_tag() {
        let dispatcher = Dispatcher::new();
        let count = Arc::new(AtomicUsize::new(0));
        let c = count.clone();
        dispatcher.register_read_handler("gm", move |_, _| {
            c.fetch_add(1, Ordering::SeqCst);
        });

        dispatcher.handle_inbound(&message_with(&["gm", "lb"]), "peer");
        assert_eq!(count.load(Ordering::SeqCst), 1);

        // A message without the tag fires nothing.
        dispatcher.handle_inbound(&message_with(&["lb"]), "peer");
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_multiple_handlers_same_tag_in_order() {
        let dispatcher = Dispatcher::new();
        let order = Arc::new(Mutex::new(Vec::new()));
        for i in 0..3 {
            let order = order.clone();
            dispatcher.register_read_handler("gm", move |_, _| {
                order.lock().push(i);
            });
        }
        dispatcher.handle_inbound(&message_with(&["gm"]), "peer");
        assert_eq!(*order.lock(), vec![0, 1, 2]);
    }

    #[test]
    fn test_handler_receives_source() {
        let dispatcher = Dispatcher::new();
        let seen = Arc::new(Mutex::new(String::new()));
        let s = seen.clone();
        dispatcher.register_read_handler("gm", move |_, source| {
            *s.lock() = source.to_string();
        });
        dispatcher.handle_inbound(&message_with(&["gm"]), "peer-42");
        assert_eq!(*seen.lock(), "peer-42");
    }

    #[test]
    fn test_write_hooks_run_in_registration_order() {
        let dispatcher = Dispatcher::new();
        dispatcher.register_write_hook("src", |tree| {
            tree.put("trace", "a");
        });
        dispatcher.register_write_hook("sc", |tree| {
            // Later hooks observe earlier hooks' writes.
            let prior = tree.get("trace").unwrap_or("").to_string();
            tree.put("trace", prior + "b");
        });

        let mut submessages = KvTree::new();
        dispatcher.handle_outbound(&mut submessages);
        assert_eq!(submessages.get("trace"), Some("ab"));
    }

    #[test]
    fn test_handler_may_register_another_handler() {
        let dispatcher = Arc::new(Dispatcher::new());
        let inner = dispatcher.clone();
        let fired = Arc::new(AtomicUsize::new(0));
        let f = fired.clone();
        dispatcher.register_read_handler("gm", move |_, _| {
            let f = f.clone();
            inner.register_read_handler("late", move |_, _| {
                f.fetch_add(1, Ordering::SeqCst);
            });
        });

        dispatcher.handle_inbound(&message_with(&["gm"]), "peer");
        dispatcher.handle_inbound(&message_with(&["late"]), "peer");
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_prehandler_composition() {
        let dispatcher = Dispatcher::new();
        let trace = Arc::new(Mutex::new(Vec::new()));
        let t1 = trace.clone();
        let t2 = trace.clone();
        let composed = Prehandler::compose(
            move |_, _| t1.lock().push("pre"),
            move |_, _| t2.lock().push("main"),
        );
        dispatcher.register_read_handler("gm", composed);
        dispatcher.handle_inbound(&message_with(&["gm"]), "peer");
        assert_eq!(*trace.lock(), vec!["pre", "main"]);
    }
}
