//! Mock transport for testing without a device.
//!
//! [`MockTransport`] answers requests from a script and records every URL it
//! was asked for, so tests can assert on the exact command sequence.
//!
//! # Matching
//!
//! Routes are keyed by a query pattern such as `"pt=7&cmd=get"`:
//!
//! 1. a route whose parameters equal the request's parameters (any order) wins
//! 2. otherwise the longest pattern that is a substring of the URL wins
//! 3. otherwise the fallback reply is used (`200` with an empty body)
//!
//! One-shot replies queued with [`MockTransport::push`] are served before the
//! route's standing reply.
//!
//! # Example
//!
//! ```rust
//! use rs_megad::hal::MockTransport;
//! use rs_megad::traits::Transport;
//!
//! # let rt = tokio::runtime::Builder::new_current_thread().build().unwrap();
//! # rt.block_on(async {
//! let mock = MockTransport::new().with_body("pt=7&cmd=get", "ON");
//! let reply = mock.get("http://10.0.0.14/sec/?pt=7&cmd=get").await.unwrap();
//! assert_eq!(reply.body, "ON");
//! assert_eq!(mock.requests(), vec!["pt=7&cmd=get"]);
//! # });
//! ```

use std::collections::{BTreeSet, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::time::Instant;

use crate::error::TransportError;
use crate::traits::{HttpReply, Transport};

/// What the mock does for one request.
#[derive(Clone, Debug)]
pub enum MockReply {
    /// Answer with this reply.
    Reply(HttpReply),
    /// Fail immediately.
    Fail(TransportError),
    /// Never answer.
    Hang,
}

impl MockReply {
    /// A 200 reply with `body`.
    pub fn body(body: impl Into<String>) -> Self {
        MockReply::Reply(HttpReply::ok(body))
    }
}

#[derive(Debug)]
struct Route {
    pattern: String,
    params: BTreeSet<(String, String)>,
    queued: VecDeque<MockReply>,
    standing: Option<MockReply>,
}

#[derive(Debug)]
struct MockState {
    routes: Vec<Route>,
    fallback: MockReply,
    requests: Vec<(Instant, String)>,
    latency: Duration,
}

/// Scripted [`Transport`]. Clones share the same script and request log.
#[derive(Clone, Debug)]
pub struct MockTransport {
    state: Arc<Mutex<MockState>>,
    in_flight: Arc<AtomicUsize>,
    max_in_flight: Arc<AtomicUsize>,
}

impl Default for MockTransport {
    fn default() -> Self {
        Self::new()
    }
}

fn query_of(url: &str) -> &str {
    url.split_once('?').map_or("", |(_, q)| q)
}

fn param_set(query: &str) -> BTreeSet<(String, String)> {
    query
        .split('&')
        .filter(|kv| !kv.is_empty())
        .map(|kv| match kv.split_once('=') {
            Some((k, v)) => (k.to_string(), v.to_string()),
            None => (kv.to_string(), String::new()),
        })
        .collect()
}

impl MockTransport {
    /// Creates a mock that answers everything with an empty 200.
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(MockState {
                routes: Vec::new(),
                fallback: MockReply::body(""),
                requests: Vec::new(),
                latency: Duration::ZERO,
            })),
            in_flight: Arc::new(AtomicUsize::new(0)),
            max_in_flight: Arc::new(AtomicUsize::new(0)),
        }
    }

    fn state(&self) -> MutexGuard<'_, MockState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn route_mut<'a>(state: &'a mut MockState, pattern: &str) -> &'a mut Route {
        let index = match state.routes.iter().position(|r| r.pattern == pattern) {
            Some(i) => i,
            None => {
                state.routes.push(Route {
                    pattern: pattern.to_string(),
                    params: param_set(pattern),
                    queued: VecDeque::new(),
                    standing: None,
                });
                state.routes.len() - 1
            }
        };
        &mut state.routes[index]
    }

    /// Sets the standing reply for `pattern`.
    pub fn set(&self, pattern: &str, reply: MockReply) {
        let mut state = self.state();
        Self::route_mut(&mut state, pattern).standing = Some(reply);
    }

    /// Queues a one-shot reply for `pattern`.
    pub fn push(&self, pattern: &str, reply: MockReply) {
        let mut state = self.state();
        Self::route_mut(&mut state, pattern).queued.push_back(reply);
    }

    /// Builder form of [`set`](Self::set) with a 200 body.
    pub fn with_body(self, pattern: &str, body: impl Into<String>) -> Self {
        self.set(pattern, MockReply::body(body));
        self
    }

    /// Builder form of [`set`](Self::set).
    pub fn with_reply(self, pattern: &str, reply: MockReply) -> Self {
        self.set(pattern, reply);
        self
    }

    /// Replaces the reply used when no route matches.
    pub fn with_fallback(self, reply: MockReply) -> Self {
        self.state().fallback = reply;
        self
    }

    /// Delays every reply.
    pub fn with_latency(self, latency: Duration) -> Self {
        self.state().latency = latency;
        self
    }

    /// Query strings of every request so far, in order.
    pub fn requests(&self) -> Vec<String> {
        self.state()
            .requests
            .iter()
            .map(|(_, url)| query_of(url).to_string())
            .collect()
    }

    /// Full URLs of every request so far.
    pub fn urls(&self) -> Vec<String> {
        self.state().requests.iter().map(|(_, u)| u.clone()).collect()
    }

    /// Times at which each request arrived.
    pub fn request_times(&self) -> Vec<Instant> {
        self.state().requests.iter().map(|(t, _)| *t).collect()
    }

    /// Number of requests whose query contains `needle`.
    pub fn count(&self, needle: &str) -> usize {
        self.requests().iter().filter(|q| q.contains(needle)).count()
    }

    /// Forgets recorded requests.
    pub fn clear_requests(&self) {
        self.state().requests.clear();
    }

    /// Highest number of requests that were in flight at the same time.
    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }

    fn resolve(&self, url: &str) -> (MockReply, Duration) {
        let mut guard = self.state();
        let state = &mut *guard;
        state.requests.push((Instant::now(), url.to_string()));
        let latency = state.latency;
        let fallback = state.fallback.clone();

        let wanted = param_set(query_of(url));
        let index = state
            .routes
            .iter()
            .position(|r| !r.params.is_empty() && r.params == wanted)
            .or_else(|| {
                state
                    .routes
                    .iter()
                    .enumerate()
                    .filter(|(_, r)| url.contains(r.pattern.as_str()))
                    .max_by_key(|(_, r)| r.pattern.len())
                    .map(|(i, _)| i)
            });

        let reply = match index {
            Some(i) => {
                let route = &mut state.routes[i];
                route
                    .queued
                    .pop_front()
                    .or_else(|| route.standing.clone())
                    .unwrap_or(fallback)
            }
            None => fallback,
        };
        (reply, latency)
    }
}

impl Transport for MockTransport {
    async fn get(&self, url: &str) -> Result<HttpReply, TransportError> {
        let (reply, latency) = self.resolve(url);

        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);
        let _guard = InFlight(&self.in_flight);

        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }
        match reply {
            MockReply::Reply(reply) => Ok(reply),
            MockReply::Fail(err) => Err(err),
            MockReply::Hang => std::future::pending().await,
        }
    }
}

struct InFlight<'a>(&'a AtomicUsize);

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    const BASE: &str = "http://10.0.0.14/sec/";

    #[tokio::test]
    async fn exact_params_beat_substring() {
        let mock = MockTransport::new()
            .with_body("pt=3", "<page>")
            .with_body("pt=3&cmd=get", "ON");

        let page = mock.get(&format!("{BASE}?pt=3")).await.unwrap();
        let value = mock.get(&format!("{BASE}?cmd=get&pt=3")).await.unwrap();
        assert_eq!(page.body, "<page>");
        assert_eq!(value.body, "ON");
    }

    #[tokio::test]
    async fn longest_substring_wins() {
        let mock = MockTransport::new()
            .with_body("pt=3", "three")
            .with_body("pt=30", "thirty");
        let reply = mock.get(&format!("{BASE}?pt=30")).await.unwrap();
        assert_eq!(reply.body, "thirty");
    }

    #[tokio::test]
    async fn queued_replies_come_first() {
        let mock = MockTransport::new().with_body("cmd=list", "a:ON/OFF");
        mock.push("cmd=list", MockReply::body("busy"));

        let url = format!("{BASE}?pt=30&cmd=list");
        assert_eq!(mock.get(&url).await.unwrap().body, "busy");
        assert_eq!(mock.get(&url).await.unwrap().body, "a:ON/OFF");
        assert_eq!(mock.count("cmd=list"), 2);
    }

    #[tokio::test]
    async fn failures_and_fallback() {
        let mock = MockTransport::new()
            .with_reply("pt=1", MockReply::Fail(TransportError::Timeout))
            .with_fallback(MockReply::Reply(HttpReply::with_status(404, "")));

        assert_eq!(
            mock.get(&format!("{BASE}?pt=1")).await,
            Err(TransportError::Timeout)
        );
        assert_eq!(mock.get(&format!("{BASE}?pt=2")).await.unwrap().status, 404);
    }

    #[tokio::test(start_paused = true)]
    async fn hang_never_resolves() {
        let mock = MockTransport::new().with_reply("pt=1", MockReply::Hang);
        let result =
            tokio::time::timeout(Duration::from_secs(60), mock.get(&format!("{BASE}?pt=1"))).await;
        assert!(result.is_err());
        assert_eq!(mock.max_in_flight(), 1);
    }
}
