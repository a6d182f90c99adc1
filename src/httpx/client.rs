/*
 *
 *  * Copyright (c) 2025 Couchbase, Inc.
 *  *
 *  * Licensed under the Apache License, Version 2.0 (the "License");
 *  * you may not use this file except in compliance with the License.
 *  * You may obtain a copy of the License at
 *  *
 *  *    http://www.apache.org/licenses/LICENSE-2.0
 *  *
 *  * Unless required by applicable law or agreed to in writing, software
 *  * distributed under the License is distributed on an "AS IS" BASIS,
 *  * WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
 *  * See the License for the specific language governing permissions and
 *  * limitations under the License.
 *
 */

use crate::httpx::error::{Error, Result as HttpxResult};
use crate::httpx::request::{Auth, Request};
use crate::httpx::response::Response;
use arc_swap::ArcSwap;
use async_trait::async_trait;
use reqwest::redirect::Policy;
use std::error::Error as StdError;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, trace};
use uuid::Uuid;

#[async_trait]
pub trait Client: Send + Sync {
    async fn execute(&self, req: Request) -> HttpxResult<Response>;
}

#[derive(Clone, Debug)]
#[non_exhaustive]
pub struct ClientConfig {
    pub idle_connection_timeout: Duration,
    pub max_idle_connections_per_host: Option<usize>,
    pub tcp_keep_alive_time: Duration,
    pub default_timeout: Duration,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            idle_connection_timeout: Duration::from_secs(90),
            max_idle_connections_per_host: None,
            tcp_keep_alive_time: Duration::from_secs(60),
            default_timeout: Duration::from_secs(10),
        }
    }
}

impl ClientConfig {
    pub fn new() -> Self {
        Default::default()
    }

    pub fn idle_connection_timeout(mut self, timeout: Duration) -> Self {
        self.idle_connection_timeout = timeout;
        self
    }

    pub fn max_idle_connections_per_host(mut self, max_idle_connections_per_host: usize) -> Self {
        self.max_idle_connections_per_host = Some(max_idle_connections_per_host);
        self
    }

    pub fn default_timeout(mut self, timeout: Duration) -> Self {
        self.default_timeout = timeout;
        self
    }
}

/// Thin wrapper over `reqwest::Client` behind an `ArcSwap`, so the
/// underlying client (and therefore its connection pool) can be rebuilt
/// without disrupting requests already in flight against the old one.
///
/// The long-poll notifier issues requests that sit open for up to 90
/// seconds; a naive `&mut reqwest::Client` would force every caller to
/// serialize behind a lock for that entire duration. Swapping an `Arc`
/// instead means readers only ever briefly hold a strong reference.
#[derive(Debug)]
pub struct ReqwestClient {
    inner: ArcSwap<reqwest::Client>,
    client_id: String,
    default_timeout: Duration,
}

impl ReqwestClient {
    pub fn new(cfg: ClientConfig) -> HttpxResult<Self> {
        let default_timeout = cfg.default_timeout;
        let inner = Self::new_client(&cfg)?;

        Ok(Self {
            inner: ArcSwap::from_pointee(inner),
            client_id: Uuid::new_v4().to_string(),
            default_timeout,
        })
    }

    pub fn reconfigure(&self, cfg: ClientConfig) -> HttpxResult<()> {
        let new_client = Self::new_client(&cfg)?;
        self.inner.store(Arc::new(new_client));
        debug!("reconfigured HTTP client {}", &self.client_id);
        Ok(())
    }

    fn new_client(cfg: &ClientConfig) -> HttpxResult<reqwest::Client> {
        let mut builder = reqwest::Client::builder()
            .redirect(Policy::limited(10))
            .pool_idle_timeout(cfg.idle_connection_timeout)
            .tcp_keepalive(cfg.tcp_keep_alive_time);

        if let Some(max_idle) = cfg.max_idle_connections_per_host {
            builder = builder.pool_max_idle_per_host(max_idle);
        }

        builder
            .build()
            .map_err(|e| Error::new_message_error(format!("failed to build http client {e}")))
    }
}

#[async_trait]
impl Client for ReqwestClient {
    async fn execute(&self, req: Request) -> HttpxResult<Response> {
        let inner = self.inner.load();

        let id = req
            .unique_id
            .clone()
            .unwrap_or_else(|| Uuid::new_v4().to_string());

        trace!(
            "writing request on {} to {}. method={}. request id={}",
            &self.client_id,
            &req.uri,
            &req.method,
            &id
        );

        let mut builder = inner
            .request(req.method, &req.uri)
            .timeout(req.timeout.unwrap_or(self.default_timeout));

        if let Some(user_agent) = &req.user_agent {
            builder = builder.header(reqwest::header::USER_AGENT, user_agent);
        }

        for (key, value) in &req.headers {
            builder = builder.header(key, value);
        }

        if let Some(Auth::BearerAuth(token)) = &req.auth {
            builder = builder.bearer_auth(token);
        }

        match builder.send().await {
            Ok(response) => {
                trace!(
                    "received response on {}. request id={}. status: {}",
                    &self.client_id,
                    &id,
                    response.status()
                );
                Ok(Response::from(response))
            }
            Err(err) => {
                let mut msg = format!(
                    "received error on {}. request id={}. err: {}",
                    &self.client_id, &id, &err,
                );

                if let Some(source) = err.source() {
                    msg = format!("{msg}. source: {source}");
                }

                trace!("{msg}");

                if err.is_timeout() {
                    Err(Error::new_timeout_error(err.to_string()))
                } else if err.is_connect() {
                    Err(Error::new_connection_error(err.to_string()))
                } else if err.is_request() {
                    Err(Error::new_request_error(err.to_string()))
                } else {
                    Err(Error::new_message_error(err.to_string()))
                }
            }
        }
    }
}

impl Drop for ReqwestClient {
    fn drop(&mut self) {
        debug!("dropping HTTP client {}", &self.client_id);
    }
}
