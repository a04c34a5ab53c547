//! Conversions between JSON, HTTP messages and Rhai values.

use bytes::Bytes;
use http::header::{HeaderName, HeaderValue};
use http::{HeaderMap, Method, Response, StatusCode, Uri, request};
use portcullis_kernel::HttpResponse;
use rhai::{Array, Blob, Dynamic, INT, Map};
use std::net::SocketAddr;

/// JSON documents enter scripts through Rhai's serde support.
pub fn json_to_dynamic(value: &serde_json::Value) -> Dynamic {
    rhai::serde::to_dynamic(value).unwrap_or_default()
}

/// Blobs become byte arrays; values with no JSON form fall back to their
/// display string.
pub fn dynamic_to_json(value: &Dynamic) -> serde_json::Value {
    if value.is_blob() {
        let blob = value.clone().cast::<Blob>();
        return serde_json::Value::Array(blob.into_iter().map(serde_json::Value::from).collect());
    }
    rhai::serde::from_dynamic(value).unwrap_or_else(|_| serde_json::Value::String(value.to_string()))
}

/// Request view bound to `this` in `serve_http`.
///
/// `method`, `uri`, `headers` and `body` are written back when the handler
/// forwards the request; `path`, `query`, `host` and `remote_addr` are
/// informational. Bodies and header values are strings when they are valid
/// UTF-8 and blobs otherwise.
pub(crate) fn request_to_dynamic(
    parts: &request::Parts,
    body: &Bytes,
    remote_addr: Option<SocketAddr>,
) -> Dynamic {
    let mut map = Map::new();
    map.insert("method".into(), parts.method.as_str().into());
    map.insert("uri".into(), parts.uri.to_string().into());
    map.insert("path".into(), parts.uri.path().into());
    map.insert("query".into(), parts.uri.query().unwrap_or_default().into());
    map.insert("proto".into(), format!("{:?}", parts.version).into());

    let host = parts
        .headers
        .get(http::header::HOST)
        .and_then(|h| h.to_str().ok())
        .map(str::to_string)
        .or_else(|| parts.uri.authority().map(|a| a.to_string()))
        .unwrap_or_default();
    map.insert("host".into(), host.into());
    map.insert(
        "remote_addr".into(),
        remote_addr.map(|a| a.to_string()).unwrap_or_default().into(),
    );
    map.insert("headers".into(), headers_to_dynamic(&parts.headers));
    map.insert("body".into(), bytes_to_dynamic(body));
    Dynamic::from(map)
}

/// Writes the script's edits of the request view back onto the request.
pub(crate) fn apply_request_changes(
    parts: &mut request::Parts,
    body: &mut Bytes,
    view: Dynamic,
) -> Result<(), String> {
    let map = view
        .try_cast::<Map>()
        .ok_or_else(|| "request binding was replaced by a non-map value".to_string())?;

    if let Some(method) = map.get("method") {
        let method = string_field("method", method)?;
        parts.method = Method::from_bytes(method.as_bytes()).map_err(|e| format!("method: {e}"))?;
    }
    if let Some(uri) = map.get("uri") {
        let uri = string_field("uri", uri)?;
        parts.uri = uri.parse::<Uri>().map_err(|e| format!("uri: {e}"))?;
    }
    if let Some(headers) = map.get("headers") {
        let headers = headers_from_dynamic(headers)?;
        if headers != parts.headers {
            parts.headers = headers;
        }
    }
    if let Some(value) = map.get("body") {
        let changed = body_from_dynamic(value)?;
        if changed != *body {
            *body = changed;
        }
    }
    Ok(())
}

/// Builds the answer from a `#{status, headers, body}` map.
pub(crate) fn response_from_dynamic(value: Dynamic) -> Result<HttpResponse, String> {
    let type_name = value.type_name();
    let map = value
        .try_cast::<Map>()
        .ok_or_else(|| format!("expected a response map, got {type_name}"))?;

    let status = match map.get("status") {
        Some(status) => {
            let code = status
                .as_int()
                .map_err(|t| format!("status: expected integer, got {t}"))?;
            u16::try_from(code)
                .ok()
                .and_then(|code| StatusCode::from_u16(code).ok())
                .ok_or_else(|| format!("status: {code} is not a valid HTTP status"))?
        }
        None => StatusCode::OK,
    };

    let body = match map.get("body") {
        Some(body) => body_from_dynamic(body)?,
        None => Bytes::new(),
    };

    let mut response = Response::new(body);
    *response.status_mut() = status;
    if let Some(headers) = map.get("headers") {
        *response.headers_mut() = headers_from_dynamic(headers)?;
    }
    Ok(response)
}

/// Connection view bound to `this` in `serve_tcp`.
pub(crate) fn conn_to_dynamic(remote_addr: SocketAddr) -> Dynamic {
    let mut map = Map::new();
    map.insert("remote_addr".into(), remote_addr.to_string().into());
    map.insert("ip".into(), remote_addr.ip().to_string().into());
    map.insert("port".into(), Dynamic::from(INT::from(remote_addr.port())));
    Dynamic::from(map)
}

// Single-valued headers become strings, repeated ones arrays.
fn headers_to_dynamic(headers: &HeaderMap) -> Dynamic {
    let mut map = Map::new();
    for name in headers.keys() {
        let values: Array = headers
            .get_all(name)
            .iter()
            .map(|v| bytes_to_dynamic(v.as_bytes()))
            .collect();
        let value = if values.len() == 1 {
            values.into_iter().next().unwrap_or(Dynamic::UNIT)
        } else {
            Dynamic::from(values)
        };
        map.insert(name.as_str().into(), value);
    }
    Dynamic::from(map)
}

fn headers_from_dynamic(value: &Dynamic) -> Result<HeaderMap, String> {
    let map = value
        .read_lock::<Map>()
        .ok_or_else(|| format!("headers: expected a map, got {}", value.type_name()))?;

    let mut headers = HeaderMap::new();
    for (name, value) in map.iter() {
        let header = HeaderName::from_bytes(name.as_bytes())
            .map_err(|e| format!("header name {name:?}: {e}"))?;
        let values = if value.is_array() {
            value.clone().cast::<Array>()
        } else {
            vec![value.clone()]
        };
        for v in values {
            let raw = if v.is_blob() {
                v.cast::<Blob>()
            } else {
                v.to_string().into_bytes()
            };
            let v = HeaderValue::from_bytes(&raw).map_err(|e| format!("header {name}: {e}"))?;
            headers.append(header.clone(), v);
        }
    }
    Ok(headers)
}

fn bytes_to_dynamic(raw: &[u8]) -> Dynamic {
    match std::str::from_utf8(raw) {
        Ok(text) => text.into(),
        Err(_) => Dynamic::from_blob(raw.to_vec()),
    }
}

fn body_from_dynamic(value: &Dynamic) -> Result<Bytes, String> {
    if value.is_unit() {
        Ok(Bytes::new())
    } else if value.is_blob() {
        Ok(Bytes::from(value.clone().cast::<Blob>()))
    } else if value.is_string() {
        Ok(Bytes::from(value.to_string()))
    } else {
        Err(format!("body: expected string or blob, got {}", value.type_name()))
    }
}

fn string_field(name: &str, value: &Dynamic) -> Result<String, String> {
    value
        .clone()
        .into_string()
        .map_err(|t| format!("{name}: expected string, got {t}"))
}
