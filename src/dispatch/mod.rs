//! Typed event routing.
//!
//! [`EventRouter`] maps `(topic, eventType)` to a handler that receives the
//! fully decoded [`EventEnvelope<T>`]. Payload types are fixed when the route
//! is registered, so dispatch never inspects payloads at runtime.
//!
//! ```ignore
//! let router = EventRouter::new()
//!     .on("OrderPlaced", |event: EventEnvelope<OrderPlaced>| async move {
//!         println!("order {}", event.payload.id);
//!         Ok(())
//!     })
//!     .on_topic("refunds", "OrderPlaced", handle_refund_order);
//! ```

use std::collections::HashMap;
use std::future::Future;

use async_trait::async_trait;
use futures::future::{self, BoxFuture, FutureExt};
use serde::de::DeserializeOwned;
use tracing::debug;

use crate::envelope::{EventEnvelope, EventHeader};
use crate::handlers::{EventHandler, HandlerError};

type Route = Box<dyn Fn(&EventHeader) -> BoxFuture<'static, Result<(), HandlerError>> + Send + Sync>;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct RouteKey {
    topic: Option<String>,
    event_type: String,
}

/// Routes events to typed handlers by topic and event type.
///
/// A route registered for a specific topic wins over a route registered for
/// the event type alone. Events with no route are accepted and skipped.
#[derive(Default)]
pub struct EventRouter {
    routes: HashMap<RouteKey, Route>,
}

impl EventRouter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Route `event_type` on any topic to `handler`.
    pub fn on<T, F, Fut>(self, event_type: impl Into<String>, handler: F) -> Self
    where
        T: DeserializeOwned + Send + 'static,
        F: Fn(EventEnvelope<T>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), HandlerError>> + Send + 'static,
    {
        self.register(None, event_type.into(), handler)
    }

    /// Route `event_type` on `topic` only to `handler`.
    pub fn on_topic<T, F, Fut>(
        self,
        topic: impl Into<String>,
        event_type: impl Into<String>,
        handler: F,
    ) -> Self
    where
        T: DeserializeOwned + Send + 'static,
        F: Fn(EventEnvelope<T>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), HandlerError>> + Send + 'static,
    {
        self.register(Some(topic.into()), event_type.into(), handler)
    }

    pub fn len(&self) -> usize {
        self.routes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }

    fn register<T, F, Fut>(mut self, topic: Option<String>, event_type: String, handler: F) -> Self
    where
        T: DeserializeOwned + Send + 'static,
        F: Fn(EventEnvelope<T>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), HandlerError>> + Send + 'static,
    {
        let route: Route = Box::new(move |header: &EventHeader| match header.decode::<T>() {
            Ok(envelope) => handler(envelope).boxed(),
            Err(e) => future::ready(Err(HandlerError::Payload(e))).boxed(),
        });
        self.routes.insert(RouteKey { topic, event_type }, route);
        self
    }

    fn route(&self, header: &EventHeader) -> Option<&Route> {
        let specific = RouteKey {
            topic: Some(header.topic.clone()),
            event_type: header.event_type.clone(),
        };
        self.routes.get(&specific).or_else(|| {
            self.routes.get(&RouteKey {
                topic: None,
                event_type: header.event_type.clone(),
            })
        })
    }
}

#[async_trait]
impl EventHandler for EventRouter {
    async fn handle_event(&self, header: &EventHeader) -> Result<(), HandlerError> {
        match self.route(header) {
            Some(route) => route(header).await,
            None => {
                debug!(
                    topic = %header.topic,
                    event_type = %header.event_type,
                    "No route for event, skipping"
                );
                Ok(())
            }
        }
    }
}
