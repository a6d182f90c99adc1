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

use std::collections::HashMap;
use std::time::Duration;

#[derive(Debug)]
#[non_exhaustive]
pub struct Request {
    pub(crate) method: reqwest::Method,
    pub(crate) uri: String,
    pub(crate) auth: Option<Auth>,
    pub(crate) user_agent: Option<String>,
    pub(crate) headers: HashMap<String, String>,
    pub(crate) timeout: Option<Duration>,
    pub(crate) unique_id: Option<String>,
}

impl Request {
    pub fn new(method: reqwest::Method, uri: impl Into<String>) -> Self {
        Self {
            method,
            uri: uri.into(),
            auth: None,
            user_agent: None,
            headers: HashMap::new(),
            timeout: None,
            unique_id: None,
        }
    }

    pub fn get(uri: impl Into<String>) -> Self {
        Self::new(reqwest::Method::GET, uri)
    }

    pub fn auth(mut self, auth: impl Into<Option<Auth>>) -> Self {
        self.auth = auth.into();
        self
    }

    pub fn user_agent(mut self, user_agent: impl Into<Option<String>>) -> Self {
        self.user_agent = user_agent.into();
        self
    }

    pub fn timeout(mut self, timeout: impl Into<Option<Duration>>) -> Self {
        self.timeout = timeout.into();
        self
    }

    pub fn unique_id(mut self, unique_id: impl Into<Option<String>>) -> Self {
        self.unique_id = unique_id.into();
        self
    }

    pub fn add_header(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(key.into(), value.into());
        self
    }
}

/// The only auth scheme the config server API needs: an optional bearer
/// token, sent as `Authorization: Bearer <token>`. Basic auth and the
/// on-behalf-of header scheme that the wider HTTP stack supports internally
/// have no counterpart in this client's server protocol.
#[derive(Clone, PartialEq, Eq, Debug)]
#[non_exhaustive]
pub enum Auth {
    BearerAuth(String),
}
