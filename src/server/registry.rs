// src/server/registry.rs - Event handler table
//
// One callback per key, re-registration overwrites. A wildcard entry, when
// present, receives every event and shadows the specific ones.

use crate::error::HandlerError;
use crate::server::classify::EventKind;
use crate::server::connection::Connection;
use log::error;
use std::collections::HashMap;
use std::panic::{self, AssertUnwindSafe};

/// Verdict of a CONNECT handler. Ignored for every other event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Admission {
    /// Track the connection and watch it for reads.
    #[default]
    Accept,
    /// Close the socket without registering it.
    Deny,
}

pub type HandlerResult = Result<Admission, HandlerError>;

pub type Handler = Box<dyn FnMut(EventKind, &mut Connection) -> HandlerResult + Send>;

/// Registration key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKey {
    Only(EventKind),
    AllEvents,
}

impl From<EventKind> for EventKey {
    fn from(kind: EventKind) -> Self {
        EventKey::Only(kind)
    }
}

#[derive(Default)]
pub struct HandlerRegistry {
    handlers: HashMap<EventKey, Handler>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_handler<F>(&mut self, handler: F, on_event: impl Into<EventKey>)
    where
        F: FnMut(EventKind, &mut Connection) -> HandlerResult + Send + 'static,
    {
        self.handlers.insert(on_event.into(), Box::new(handler));
    }

    /// Chaining form of [`add_handler`](Self::add_handler).
    pub fn handler<F>(&mut self, on_event: impl Into<EventKey>, handler: F) -> &mut Self
    where
        F: FnMut(EventKind, &mut Connection) -> HandlerResult + Send + 'static,
    {
        self.add_handler(handler, on_event);
        self
    }

    pub fn contains(&self, key: impl Into<EventKey>) -> bool {
        self.handlers.contains_key(&key.into())
    }

    fn resolve(&mut self, kind: EventKind) -> Option<&mut Handler> {
        if self.handlers.contains_key(&EventKey::AllEvents) {
            return self.handlers.get_mut(&EventKey::AllEvents);
        }
        self.handlers.get_mut(&EventKey::Only(kind))
    }

    /// Whether an event of `kind` would reach any handler.
    pub fn handles(&self, kind: EventKind) -> bool {
        self.handlers.contains_key(&EventKey::AllEvents)
            || self.handlers.contains_key(&EventKey::Only(kind))
    }

    /// Run the handler for `kind`.
    ///
    /// Returns `None` when nothing is registered. Errors and panics raised by
    /// the handler are logged here and returned as `Err`.
    pub fn dispatch(&mut self, kind: EventKind, conn: &mut Connection) -> Option<HandlerResult> {
        let handler = self.resolve(kind)?;
        let token = conn.token();

        let result = match panic::catch_unwind(AssertUnwindSafe(|| handler(kind, conn))) {
            Ok(result) => result,
            Err(payload) => Err(panic_message(payload).into()),
        };

        if let Err(e) = &result {
            error!("{} handler failed on connection {}: {}", kind, token, e);
        }
        Some(result)
    }
}

pub(crate) fn panic_message(payload: Box<dyn std::any::Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        format!("handler panicked: {s}")
    } else if let Some(s) = payload.downcast_ref::<String>() {
        format!("handler panicked: {s}")
    } else {
        "handler panicked".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::server::connection::tests::connection_pair;
    use std::sync::{Arc, Mutex};

    #[test]
    fn test_specific_handler_dispatch() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let mut registry = HandlerRegistry::new();

        let log = seen.clone();
        registry.add_handler(
            move |kind, _conn: &mut Connection| {
                log.lock().unwrap().push(kind);
                Ok(Admission::Accept)
            },
            EventKind::Receive,
        );

        let (mut conn, _client) = connection_pair();
        assert!(registry.dispatch(EventKind::Receive, &mut conn).is_some());
        assert!(registry.dispatch(EventKind::Response, &mut conn).is_none());
        assert_eq!(*seen.lock().unwrap(), vec![EventKind::Receive]);
    }

    #[test]
    fn test_wildcard_shadows_specific() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let mut registry = HandlerRegistry::new();

        registry.handler(EventKind::Receive, |_, _| panic!("shadowed handler ran"));
        let log = seen.clone();
        registry.handler(EventKey::AllEvents, move |kind, _| {
            log.lock().unwrap().push(kind);
            Ok(Admission::Accept)
        });

        let (mut conn, _client) = connection_pair();
        for kind in [EventKind::Receive, EventKind::Response, EventKind::Disconnect] {
            let result = registry.dispatch(kind, &mut conn).expect("wildcard registered");
            assert!(result.is_ok());
        }
        assert_eq!(
            *seen.lock().unwrap(),
            vec![EventKind::Receive, EventKind::Response, EventKind::Disconnect]
        );
    }

    #[test]
    fn test_reregistration_overwrites() {
        let mut registry = HandlerRegistry::new();
        registry.handler(EventKind::Connect, |_, _| Ok(Admission::Accept));
        registry.handler(EventKind::Connect, |_, _| Ok(Admission::Deny));

        let (mut conn, _client) = connection_pair();
        let result = registry.dispatch(EventKind::Connect, &mut conn).unwrap();
        assert_eq!(result.unwrap(), Admission::Deny);
    }

    #[test]
    fn test_panic_is_contained() {
        let mut registry = HandlerRegistry::new();
        registry.handler(EventKind::Receive, |_, _| panic!("boom"));

        let (mut conn, _client) = connection_pair();
        let result = registry.dispatch(EventKind::Receive, &mut conn).unwrap();
        let err = result.unwrap_err();
        assert!(err.to_string().contains("boom"));
    }

    #[test]
    fn test_handles() {
        let mut registry = HandlerRegistry::new();
        assert!(!registry.handles(EventKind::Connect));
        registry.handler(EventKind::Connect, |_, _| Ok(Admission::Accept));
        assert!(registry.handles(EventKind::Connect));
        assert!(!registry.handles(EventKind::Receive));
        assert!(registry.contains(EventKind::Connect));
    }
}
