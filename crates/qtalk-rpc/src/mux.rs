//! Selector-based handler multiplexing.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;
use qtalk_codec::Codec;

use crate::server::{BoxFuture, Call, Handler, Responder};

/// Normalize a selector: collapse repeated slashes, trim trailing ones,
/// ensure a leading slash. The empty selector maps to `"/"`.
pub fn clean_selector(selector: &str) -> String {
    let mut out = String::with_capacity(selector.len() + 1);
    for segment in selector.split('/') {
        if segment.is_empty() {
            continue;
        }
        out.push('/');
        out.push_str(segment);
    }
    if out.is_empty() {
        out.push('/');
    }
    out
}

/// Routes calls to the handler registered under the longest pattern that
/// prefixes the selector, with `"/"` as the fallback.
pub struct RespondMux<C: Codec> {
    routes: RwLock<HashMap<String, Arc<dyn Handler<C>>>>,
}

impl<C: Codec> Default for RespondMux<C> {
    fn default() -> Self {
        Self::new()
    }
}

impl<C: Codec> RespondMux<C> {
    pub fn new() -> Self {
        Self {
            routes: RwLock::new(HashMap::new()),
        }
    }

    /// Register a handler under a pattern. Patterns are normalized the same
    /// way selectors are; re-registering a pattern replaces its handler.
    pub fn handle(&self, pattern: &str, handler: impl Handler<C> + 'static) {
        self.routes
            .write()
            .insert(clean_selector(pattern), Arc::new(handler));
    }

    /// Remove and return the handler registered under a pattern.
    pub fn remove(&self, pattern: &str) -> Option<Arc<dyn Handler<C>>> {
        self.routes.write().remove(&clean_selector(pattern))
    }

    fn match_handler(&self, selector: &str) -> Option<Arc<dyn Handler<C>>> {
        let routes = self.routes.read();
        let mut best: Option<(&str, &Arc<dyn Handler<C>>)> = None;
        for (pattern, handler) in routes.iter() {
            let matches = pattern == "/"
                || selector == pattern
                || (selector.len() > pattern.len()
                    && selector.starts_with(pattern.as_str())
                    && selector.as_bytes()[pattern.len()] == b'/');
            if matches && best.map_or(true, |(b, _)| pattern.len() > b.len()) {
                best = Some((pattern, handler));
            }
        }
        best.map(|(_, h)| h.clone())
    }
}

impl<C: Codec> Handler<C> for RespondMux<C> {
    fn respond(&self, resp: Responder<C>, call: Call<C>) -> BoxFuture<'static, ()> {
        match self.match_handler(call.selector()) {
            Some(handler) => handler.respond(resp, call),
            None => Box::pin(async move {
                if let Err(e) = resp
                    .ret_err(format!("not found: {}", call.selector()))
                    .await
                {
                    tracing::debug!(error = %e, "failed to send not-found response");
                }
            }),
        }
    }
}
