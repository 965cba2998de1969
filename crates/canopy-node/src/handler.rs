//! Package handler registry and callback context
//!
//! Application code registers handlers per integer package type; the node
//! dispatches inbound application packages through them in registration
//! order until one consumes the package. Handlers and user callbacks
//! receive a [`CallbackContext`] instead of the mesh itself: sends issued
//! from inside a handler are batched and applied right after it returns,
//! so a handler can never re-enter mesh state.
//!
//! A panicking handler is isolated: the panic is caught, logged, and the
//! package counts as consumed.

use std::collections::HashMap;
use std::panic::{AssertUnwindSafe, catch_unwind};

use serde_json::Value;
use tracing::warn;

use canopy_core::{AppPackage, ConnId, NodeId};

/// Outbound work queued by a handler or callback
#[derive(Debug, Clone, PartialEq)]
pub enum OutboundCommand {
    Broadcast { msg: Value, include_self: bool },
    Single { dest: NodeId, msg: Value },
}

/// The mesh surface visible from inside a handler or callback
pub struct CallbackContext<'a> {
    self_id: NodeId,
    mesh_time_us: u64,
    outbox: &'a mut Vec<OutboundCommand>,
}

impl<'a> CallbackContext<'a> {
    pub fn new(self_id: NodeId, mesh_time_us: u64, outbox: &'a mut Vec<OutboundCommand>) -> Self {
        Self {
            self_id,
            mesh_time_us,
            outbox,
        }
    }

    /// This node's id
    pub fn node_id(&self) -> NodeId {
        self.self_id
    }

    /// Synchronized mesh time in microseconds
    pub fn mesh_time_us(&self) -> u64 {
        self.mesh_time_us
    }

    /// Queue a broadcast; it goes out after the handler returns
    pub fn send_broadcast(&mut self, msg: Value, include_self: bool) {
        self.outbox.push(OutboundCommand::Broadcast { msg, include_self });
    }

    /// Queue a unicast; it goes out after the handler returns
    pub fn send_single(&mut self, dest: NodeId, msg: Value) {
        self.outbox.push(OutboundCommand::Single { dest, msg });
    }
}

/// One registered application handler
///
/// Returns `true` to consume the package and stop the chain.
pub type AppHandler = Box<dyn FnMut(&mut CallbackContext<'_>, &AppPackage, ConnId, u64) -> bool>;

/// Registry of application handlers keyed by package type
#[derive(Default)]
pub struct PackageHandler {
    handlers: HashMap<u16, Vec<AppHandler>>,
}

impl PackageHandler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler for one package type
    ///
    /// Handlers for the same type run in registration order.
    pub fn register(&mut self, type_code: u16, handler: AppHandler) {
        self.handlers.entry(type_code).or_default().push(handler);
    }

    /// Drop every handler for a type
    pub fn unregister(&mut self, type_code: u16) {
        self.handlers.remove(&type_code);
    }

    pub fn handler_count(&self, type_code: u16) -> usize {
        self.handlers.get(&type_code).map_or(0, Vec::len)
    }

    /// Dispatch a package; `true` if some handler consumed it
    pub fn dispatch(
        &mut self,
        ctx: &mut CallbackContext<'_>,
        pkg: &AppPackage,
        conn: ConnId,
        time_received_us: u64,
    ) -> bool {
        let Some(handlers) = self.handlers.get_mut(&pkg.type_code) else {
            return false;
        };
        for handler in handlers {
            let outcome = catch_unwind(AssertUnwindSafe(|| {
                handler(ctx, pkg, conn, time_received_us)
            }));
            match outcome {
                Ok(true) => return true,
                Ok(false) => continue,
                Err(_) => {
                    warn!(type_code = pkg.type_code, "package handler panicked; treating as consumed");
                    return true;
                }
            }
        }
        false
    }

    pub fn clear(&mut self) {
        self.handlers.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use canopy_core::Routing;
    use serde_json::json;
    use std::cell::RefCell;
    use std::rc::Rc;

    fn app_pkg(type_code: u16) -> AppPackage {
        AppPackage {
            type_code,
            from: NodeId(7),
            routing: Routing::Broadcast,
            dest: None,
            raw: json!({"type": type_code, "from": 7, "routing": 2}),
        }
    }

    fn ctx_with<'a>(outbox: &'a mut Vec<OutboundCommand>) -> CallbackContext<'a> {
        CallbackContext::new(NodeId(1), 0, outbox)
    }

    #[test]
    fn test_dispatch_in_order_until_consumed() {
        let calls = Rc::new(RefCell::new(Vec::new()));
        let mut registry = PackageHandler::new();

        for (name, consume) in [("first", false), ("second", true), ("third", true)] {
            let calls = Rc::clone(&calls);
            registry.register(
                250,
                Box::new(move |_, _, _, _| {
                    calls.borrow_mut().push(name);
                    consume
                }),
            );
        }

        let mut outbox = Vec::new();
        let consumed = registry.dispatch(&mut ctx_with(&mut outbox), &app_pkg(250), ConnId(1), 0);
        assert!(consumed);
        assert_eq!(*calls.borrow(), vec!["first", "second"]);
    }

    #[test]
    fn test_unregistered_type_not_consumed() {
        let mut registry = PackageHandler::new();
        let mut outbox = Vec::new();
        assert!(!registry.dispatch(&mut ctx_with(&mut outbox), &app_pkg(300), ConnId(1), 0));
    }

    #[test]
    fn test_panicking_handler_is_consumed_and_isolated() {
        let mut registry = PackageHandler::new();
        registry.register(250, Box::new(|_, _, _, _| panic!("handler bug")));
        let reached = Rc::new(RefCell::new(false));
        {
            let reached = Rc::clone(&reached);
            registry.register(
                250,
                Box::new(move |_, _, _, _| {
                    *reached.borrow_mut() = true;
                    true
                }),
            );
        }

        let mut outbox = Vec::new();
        let consumed = registry.dispatch(&mut ctx_with(&mut outbox), &app_pkg(250), ConnId(1), 0);
        assert!(consumed);
        assert!(!*reached.borrow());
    }

    #[test]
    fn test_handler_sends_are_batched_in_outbox() {
        let mut registry = PackageHandler::new();
        registry.register(
            260,
            Box::new(|ctx, pkg, _, _| {
                ctx.send_single(pkg.from, json!("reply"));
                ctx.send_broadcast(json!("fanout"), false);
                true
            }),
        );

        let mut outbox = Vec::new();
        registry.dispatch(&mut ctx_with(&mut outbox), &app_pkg(260), ConnId(1), 0);
        assert_eq!(
            outbox,
            vec![
                OutboundCommand::Single {
                    dest: NodeId(7),
                    msg: json!("reply")
                },
                OutboundCommand::Broadcast {
                    msg: json!("fanout"),
                    include_self: false
                },
            ]
        );
    }

    #[test]
    fn test_unregister() {
        let mut registry = PackageHandler::new();
        registry.register(250, Box::new(|_, _, _, _| true));
        assert_eq!(registry.handler_count(250), 1);
        registry.unregister(250);
        assert_eq!(registry.handler_count(250), 0);
    }
}
