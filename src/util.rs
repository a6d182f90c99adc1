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

/// Joins a base endpoint (`http(s)://host:port`) with a path, without
/// double- or missing-slashing the seam.
pub(crate) fn join_url(base: &str, path: &str) -> String {
    let base = base.trim_end_matches('/');
    let path = path.trim_start_matches('/');
    format!("{base}/{path}")
}

/// Appends a query string built from `params` to `url`, in insertion order.
///
/// Per the fetch/notify design's resolved open question, the `?` separator
/// is only appended when at least one parameter is present; a request with
/// an empty parameter list leaves the URL untouched rather than adding a
/// trailing `?`.
pub(crate) fn append_query(url: &str, params: &[(&str, &str)]) -> String {
    if params.is_empty() {
        return url.to_string();
    }

    let mut out = String::with_capacity(url.len() + 16 * params.len());
    out.push_str(url);
    out.push('?');
    for (i, (key, value)) in params.iter().enumerate() {
        if i > 0 {
            out.push('&');
        }
        out.push_str(&url::form_urlencoded::byte_serialize(key.as_bytes()).collect::<String>());
        out.push('=');
        out.push_str(&url::form_urlencoded::byte_serialize(value.as_bytes()).collect::<String>());
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn join_url_avoids_double_slash() {
        assert_eq!(join_url("http://host:8080/", "/configs/app"), "http://host:8080/configs/app");
        assert_eq!(join_url("http://host:8080", "configs/app"), "http://host:8080/configs/app");
    }

    #[test]
    fn append_query_omits_separator_when_empty() {
        assert_eq!(append_query("http://host/configs/app", &[]), "http://host/configs/app");
    }

    #[test]
    fn append_query_encodes_and_joins_params() {
        let url = append_query("http://host/notifications/v2", &[("ip", "10.0.0.1"), ("notifications", "[{\"k\":1}]")]);
        assert!(url.starts_with("http://host/notifications/v2?ip=10.0.0.1&notifications="));
    }
}
