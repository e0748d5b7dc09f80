//! A simple case-insensitive topic → handler map, the default
//! [`coord_core::HandlerResolver`] implementation.

use coord_core::{Handler, HandlerResolver};
use std::collections::HashMap;
use std::sync::Arc;

#[derive(Default)]
pub struct MapHandlerResolver {
    handlers: HashMap<String, Arc<dyn Handler>>,
}

impl MapHandlerResolver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(mut self, topic: impl Into<String>, handler: Arc<dyn Handler>) -> Self {
        self.handlers.insert(topic.into().to_lowercase(), handler);
        self
    }
}

impl HandlerResolver for MapHandlerResolver {
    fn try_get(&self, topic: &str) -> Option<Arc<dyn Handler>> {
        self.handlers.get(&topic.to_lowercase()).cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use coord_core::{Delivery, HandlerOutcome};

    #[tokio::test]
    async fn lookup_is_case_insensitive() {
        let resolver = MapHandlerResolver::new().register(
            "Work.Topic",
            Arc::new(|_delivery: Delivery| async move { HandlerOutcome::Success }),
        );

        assert!(resolver.try_get("work.topic").is_some());
        assert!(resolver.try_get("WORK.TOPIC").is_some());
        assert!(resolver.try_get("other.topic").is_none());
    }
}
