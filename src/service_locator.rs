use crate::error::{Error, Result};
use crate::httpx::client::Client;
use crate::httpx::request::Request;
use crate::protocol::{self, MetaServerEntry};
use rand::Rng;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tokio::sync::Notify;
use tracing::{debug, warn};

/// How many consecutive meta-server endpoints the background refresh tries
/// before giving up on a single refresh cycle and waiting for the next
/// tick; exhausting the budget leaves the previously known endpoint list in
/// place rather than clearing it (a meta-server outage should not make an
/// otherwise-healthy config service unreachable).
const META_SERVER_RETRY_BUDGET: usize = 3;

/// Tracks the set of known config service endpoints and hands out a
/// shuffled ordering for failover, optionally honoring a caller-supplied
/// preferred endpoint for a single attempt.
///
/// Endpoint lists are refreshed either wholesale (via
/// [`ServiceLocator::update`], e.g. from a test) or in the background by
/// polling the meta-server's `GET /services/config` (via
/// [`ServiceLocator::spawn_background_refresh`]); callers of
/// `attempt_order` must tolerate the list changing between calls.
pub struct ServiceLocator {
    endpoints: RwLock<Vec<String>>,
    stopped: AtomicBool,
    stop_notify: Notify,
}

impl ServiceLocator {
    pub fn new(endpoints: Vec<String>) -> Self {
        Self {
            endpoints: RwLock::new(endpoints),
            stopped: AtomicBool::new(false),
            stop_notify: Notify::new(),
        }
    }

    pub fn update(&self, endpoints: Vec<String>) {
        debug!(count = endpoints.len(), "service locator endpoints updated");
        *self.endpoints.write().unwrap() = endpoints;
    }

    /// Queries the meta-server once, iterating `meta_server_addrs` until one
    /// responds, and replaces the known endpoint list on success. Fails
    /// with `NoAvailableService` only once every meta-server address (up to
    /// [`META_SERVER_RETRY_BUDGET`]) has been tried and failed.
    pub async fn refresh_from_meta_server<C: Client>(
        &self,
        client: &C,
        meta_server_addrs: &[String],
    ) -> Result<()> {
        let mut last_error: Option<Error> = None;
        for addr in meta_server_addrs.iter().take(META_SERVER_RETRY_BUDGET) {
            let url = protocol::meta_server_url(addr);
            let req = Request::get(url);
            match client.execute(req).await {
                Ok(response) if response.status().is_success() => {
                    match response.json::<Vec<MetaServerEntry>>().await {
                        Ok(entries) if !entries.is_empty() => {
                            self.update(entries.into_iter().map(|e| e.homepage_url).collect());
                            return Ok(());
                        }
                        Ok(_) => {
                            last_error = Some(Error::no_available_service(
                                "meta server returned an empty service list",
                            ));
                        }
                        Err(e) => last_error = Some(e.into()),
                    }
                }
                Ok(response) => {
                    last_error = Some(Error::no_available_service(format!(
                        "meta server {addr} returned status {}",
                        response.status()
                    )));
                }
                Err(e) => last_error = Some(e.into()),
            }
        }

        Err(last_error.unwrap_or_else(|| {
            Error::no_available_service("no meta server addresses were configured")
        }))
    }

    /// Spawns the background refresh loop: polls the meta-server on
    /// `interval`, logging and otherwise ignoring a failed cycle (the
    /// previously known endpoint list remains in effect, per C1's "returns
    /// non-empty list or fails" contract — a refresh failure must not empty
    /// out an already-populated locator).
    pub fn spawn_background_refresh<C: Client + 'static>(
        self: &Arc<Self>,
        client: Arc<C>,
        meta_server_addrs: Vec<String>,
        interval: Duration,
    ) {
        let locator = self.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = tokio::time::sleep(interval) => {
                        if locator.stopped.load(Ordering::SeqCst) {
                            return;
                        }
                        if let Err(e) = locator.refresh_from_meta_server(client.as_ref(), &meta_server_addrs).await {
                            warn!(error = %e, "meta server refresh failed; keeping previous endpoint list");
                        }
                    }
                    _ = locator.stop_notify.notified() => return,
                }
            }
        });
    }

    pub fn stop_background_refresh(&self) {
        self.stopped.store(true, Ordering::SeqCst);
        self.stop_notify.notify_waiters();
    }

    pub fn endpoints(&self) -> Vec<String> {
        self.endpoints.read().unwrap().clone()
    }

    /// Returns an attempt order over the known endpoints: the preferred
    /// endpoint first if it is still known, followed by the rest in random
    /// order. Used so that a repository prefers the endpoint that served it
    /// last time while still being willing to fail over.
    pub fn attempt_order(&self, preferred: Option<&str>) -> Result<Vec<String>> {
        let endpoints = self.endpoints.read().unwrap();
        if endpoints.is_empty() {
            return Err(Error::no_available_service(
                "no config service endpoints are known",
            ));
        }

        let mut rest: Vec<String> = endpoints
            .iter()
            .filter(|e| Some(e.as_str()) != preferred)
            .cloned()
            .collect();
        shuffle(&mut rest);

        let mut order = Vec::with_capacity(endpoints.len());
        if let Some(preferred) = preferred {
            if endpoints.iter().any(|e| e == preferred) {
                order.push(preferred.to_string());
            }
        }
        order.extend(rest);
        Ok(order)
    }
}

fn shuffle(items: &mut [String]) {
    let mut rng = rand::rng();
    for i in (1..items.len()).rev() {
        let j = rng.random_range(0..=i);
        items.swap(i, j);
    }
}
