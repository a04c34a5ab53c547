//! The `http_handler` host module.
//!
//! Guests read and edit the current request and response through these
//! functions. Buffers are passed as `(ptr, limit)` pairs; when a value does
//! not fit, nothing is written and the required length is returned so the
//! guest can retry with a larger buffer.

use super::sockets::SocketTable;
use super::{WasmError, WasmResult};
use bytes::{Bytes, BytesMut};
use http::header::{HeaderName, HeaderValue};
use http::{HeaderMap, Method, StatusCode, Uri};
use portcullis_kernel::{HttpRequest, HttpResponse};
use std::net::SocketAddr;
use std::sync::Arc;
use tracing::{Level, debug, enabled, error, info, warn};
use wasmtime::{Caller, Linker, Memory, ResourceLimiter, Result};
use wasmtime_wasi::p1::WasiP1Ctx;

pub(crate) const HOST_MODULE: &str = "http_handler";

const KIND_REQUEST: i32 = 0;
const KIND_RESPONSE: i32 = 1;

const LOG_DEBUG: i32 = -1;
const LOG_INFO: i32 = 0;
const LOG_WARN: i32 = 1;
const LOG_ERROR: i32 = 2;

/// Store limits for resource control
pub(crate) struct StoreLimits {
    pub(crate) max_memory_bytes: u64,
    pub(crate) max_table_elements: u32,
}

impl ResourceLimiter for StoreLimits {
    fn memory_growing(
        &mut self,
        _current: usize,
        desired: usize,
        maximum: Option<usize>,
    ) -> Result<bool> {
        let max = maximum.unwrap_or(self.max_memory_bytes as usize);
        Ok(desired <= max && desired <= self.max_memory_bytes as usize)
    }

    fn table_growing(
        &mut self,
        _current: usize,
        desired: usize,
        maximum: Option<usize>,
    ) -> Result<bool> {
        let max = maximum.unwrap_or(self.max_table_elements as usize);
        Ok(desired <= max && desired <= self.max_table_elements as usize)
    }
}

/// The request/response pair a guest instance works on.
#[derive(Default)]
pub(crate) struct Exchange {
    pub(crate) request: HttpRequest,
    pub(crate) response: HttpResponse,
    pub(crate) remote_addr: Option<SocketAddr>,
    read_offsets: [usize; 2],
    written: [bool; 2],
}

impl Exchange {
    pub(crate) fn new(request: HttpRequest, remote_addr: Option<SocketAddr>) -> Self {
        Self {
            request,
            remote_addr,
            ..Self::default()
        }
    }

    pub(crate) fn take_request(&mut self) -> HttpRequest {
        std::mem::take(&mut self.request)
    }

    /// Installs the downstream response so `handle_response` can inspect it.
    pub(crate) fn set_response(&mut self, response: HttpResponse) {
        self.response = response;
        self.read_offsets[KIND_RESPONSE as usize] = 0;
        self.written[KIND_RESPONSE as usize] = false;
    }

    pub(crate) fn take_response(&mut self) -> HttpResponse {
        std::mem::take(&mut self.response)
    }

    fn headers(&self, kind: i32) -> Option<&HeaderMap> {
        match kind {
            KIND_REQUEST => Some(self.request.headers()),
            KIND_RESPONSE => Some(self.response.headers()),
            _ => None,
        }
    }

    fn headers_mut(&mut self, kind: i32) -> Option<&mut HeaderMap> {
        match kind {
            KIND_REQUEST => Some(self.request.headers_mut()),
            KIND_RESPONSE => Some(self.response.headers_mut()),
            _ => None,
        }
    }

    fn body(&self, kind: i32) -> Option<&Bytes> {
        match kind {
            KIND_REQUEST => Some(self.request.body()),
            KIND_RESPONSE => Some(self.response.body()),
            _ => None,
        }
    }

    fn body_mut(&mut self, kind: i32) -> Option<&mut Bytes> {
        match kind {
            KIND_REQUEST => Some(self.request.body_mut()),
            KIND_RESPONSE => Some(self.response.body_mut()),
            _ => None,
        }
    }

    /// Next chunk of the body; the flag is set once the body is exhausted.
    fn read_body(&mut self, kind: i32, limit: usize) -> (Bytes, bool) {
        let Some(body) = self.body(kind).cloned() else {
            return (Bytes::new(), true);
        };
        let offset = self.read_offsets[kind as usize].min(body.len());
        let end = offset.saturating_add(limit).min(body.len());
        self.read_offsets[kind as usize] = end;
        (body.slice(offset..end), end == body.len())
    }

    /// The first write replaces the body, later writes append.
    fn write_body(&mut self, kind: i32, chunk: &[u8]) {
        let first = match kind {
            KIND_REQUEST | KIND_RESPONSE => !std::mem::replace(&mut self.written[kind as usize], true),
            _ => return,
        };
        if let Some(body) = self.body_mut(kind) {
            let mut buf = if first { BytesMut::new() } else { BytesMut::from(&body[..]) };
            buf.extend_from_slice(chunk);
            *body = buf.freeze();
        }
    }
}

/// Data stored in every guest store.
pub(crate) struct HostState {
    pub(crate) wasi: WasiP1Ctx,
    pub(crate) limits: StoreLimits,
    pub(crate) exchange: Exchange,
    pub(crate) config: Arc<Vec<u8>>,
    pub(crate) features: i32,
    pub(crate) sockets: SocketTable,
    pub(crate) plugin: Arc<str>,
}

pub(crate) fn memory(caller: &mut Caller<'_, HostState>) -> Result<Memory> {
    caller
        .get_export("memory")
        .and_then(|e| e.into_memory())
        .ok_or_else(|| wasmtime::Error::msg("guest does not export memory"))
}

/// Fails unless `[ptr, ptr + len)` lies inside guest memory.
pub(crate) fn check_range(caller: &mut Caller<'_, HostState>, ptr: u32, len: u64) -> Result<Memory> {
    let memory = memory(caller)?;
    let end = u64::from(ptr).saturating_add(len);
    if end > memory.data_size(&*caller) as u64 {
        return Err(wasmtime::Error::msg(format!(
            "guest range {ptr}+{len} is outside linear memory"
        )));
    }
    Ok(memory)
}

pub(crate) fn read_bytes(caller: &mut Caller<'_, HostState>, ptr: u32, len: u32) -> Result<Vec<u8>> {
    let memory = check_range(caller, ptr, u64::from(len))?;
    let mut buf = vec![0u8; len as usize];
    memory.read(&*caller, ptr as usize, &mut buf)?;
    Ok(buf)
}

fn read_string(caller: &mut Caller<'_, HostState>, ptr: u32, len: u32) -> Result<String> {
    String::from_utf8(read_bytes(caller, ptr, len)?).map_err(wasmtime::Error::msg)
}

pub(crate) fn write_bytes(caller: &mut Caller<'_, HostState>, ptr: u32, data: &[u8]) -> Result<()> {
    let memory = memory(caller)?;
    memory.write(&mut *caller, ptr as usize, data)?;
    Ok(())
}

/// Writes `data` when it fits in `limit` and returns its length either way.
fn write_if_fits(caller: &mut Caller<'_, HostState>, buf: u32, limit: u32, data: &[u8]) -> Result<u32> {
    let len = u32::try_from(data.len()).map_err(wasmtime::Error::msg)?;
    if len <= limit {
        write_bytes(caller, buf, data)?;
    }
    Ok(len)
}

/// NUL-terminated list encoded as `count << 32 | byte length`.
fn write_list<'a>(
    caller: &mut Caller<'_, HostState>,
    buf: u32,
    limit: u32,
    items: impl Iterator<Item = &'a [u8]>,
) -> Result<i64> {
    let mut encoded = Vec::new();
    let mut count: i64 = 0;
    for item in items {
        encoded.extend_from_slice(item);
        encoded.push(0);
        count += 1;
    }
    let len = write_if_fits(caller, buf, limit, &encoded)?;
    Ok((count << 32) | i64::from(len))
}

fn header_name(raw: &str) -> Result<HeaderName> {
    HeaderName::from_bytes(raw.as_bytes()).map_err(wasmtime::Error::msg)
}

fn header_value(raw: &str) -> Result<HeaderValue> {
    HeaderValue::from_str(raw).map_err(wasmtime::Error::msg)
}

fn headers_of<'a>(caller: &'a mut Caller<'_, HostState>, kind: i32) -> Result<&'a mut HeaderMap> {
    caller
        .data_mut()
        .exchange
        .headers_mut(kind)
        .ok_or_else(|| wasmtime::Error::msg(format!("unsupported header kind {kind}")))
}

pub(crate) fn add_to_linker(linker: &mut Linker<HostState>) -> WasmResult<()> {
    define(linker)
        .map(|_| ())
        .map_err(|e| WasmError::Internal(e.to_string()))
}

fn define(linker: &mut Linker<HostState>) -> Result<&mut Linker<HostState>> {
    linker.func_wrap(
        HOST_MODULE,
        "log",
        |mut caller: Caller<'_, HostState>, level: i32, ptr: u32, len: u32| -> Result<()> {
            let message = read_string(&mut caller, ptr, len)?;
            let plugin = caller.data().plugin.clone();
            match level {
                LOG_DEBUG => debug!(plugin = %plugin, "{message}"),
                LOG_INFO => info!(plugin = %plugin, "{message}"),
                LOG_WARN => warn!(plugin = %plugin, "{message}"),
                LOG_ERROR => error!(plugin = %plugin, "{message}"),
                _ => {}
            }
            Ok(())
        },
    )?;

    linker.func_wrap(HOST_MODULE, "log_enabled", |_caller: Caller<'_, HostState>, level: i32| -> i32 {
        let on = match level {
            LOG_DEBUG => enabled!(Level::DEBUG),
            LOG_INFO => enabled!(Level::INFO),
            LOG_WARN => enabled!(Level::WARN),
            LOG_ERROR => enabled!(Level::ERROR),
            _ => false,
        };
        i32::from(on)
    })?;

    linker.func_wrap(
        HOST_MODULE,
        "enable_features",
        |mut caller: Caller<'_, HostState>, features: i32| -> i32 {
            let state = caller.data_mut();
            state.features |= features;
            state.features
        },
    )?;

    linker.func_wrap(
        HOST_MODULE,
        "get_config",
        |mut caller: Caller<'_, HostState>, buf: u32, limit: u32| -> Result<u32> {
            let config = caller.data().config.clone();
            write_if_fits(&mut caller, buf, limit, &config)
        },
    )?;

    linker.func_wrap(
        HOST_MODULE,
        "get_method",
        |mut caller: Caller<'_, HostState>, buf: u32, limit: u32| -> Result<u32> {
            let method = caller.data().exchange.request.method().to_string();
            write_if_fits(&mut caller, buf, limit, method.as_bytes())
        },
    )?;

    linker.func_wrap(
        HOST_MODULE,
        "set_method",
        |mut caller: Caller<'_, HostState>, ptr: u32, len: u32| -> Result<()> {
            let method = read_bytes(&mut caller, ptr, len)?;
            let method = Method::from_bytes(&method).map_err(wasmtime::Error::msg)?;
            *caller.data_mut().exchange.request.method_mut() = method;
            Ok(())
        },
    )?;

    linker.func_wrap(
        HOST_MODULE,
        "get_uri",
        |mut caller: Caller<'_, HostState>, buf: u32, limit: u32| -> Result<u32> {
            let uri = caller.data().exchange.request.uri();
            let uri = uri
                .path_and_query()
                .map(|pq| pq.as_str().to_string())
                .unwrap_or_else(|| uri.to_string());
            write_if_fits(&mut caller, buf, limit, uri.as_bytes())
        },
    )?;

    linker.func_wrap(
        HOST_MODULE,
        "set_uri",
        |mut caller: Caller<'_, HostState>, ptr: u32, len: u32| -> Result<()> {
            let uri = read_string(&mut caller, ptr, len)?;
            let uri = uri.parse::<Uri>().map_err(wasmtime::Error::msg)?;
            *caller.data_mut().exchange.request.uri_mut() = uri;
            Ok(())
        },
    )?;

    linker.func_wrap(
        HOST_MODULE,
        "get_protocol_version",
        |mut caller: Caller<'_, HostState>, buf: u32, limit: u32| -> Result<u32> {
            let version = format!("{:?}", caller.data().exchange.request.version());
            write_if_fits(&mut caller, buf, limit, version.as_bytes())
        },
    )?;

    linker.func_wrap(
        HOST_MODULE,
        "get_header_names",
        |mut caller: Caller<'_, HostState>, kind: i32, buf: u32, limit: u32| -> Result<i64> {
            let names: Vec<String> = caller
                .data()
                .exchange
                .headers(kind)
                .map(|h| h.keys().map(|k| k.as_str().to_string()).collect())
                .unwrap_or_default();
            write_list(&mut caller, buf, limit, names.iter().map(|n| n.as_bytes()))
        },
    )?;

    linker.func_wrap(
        HOST_MODULE,
        "get_header_values",
        |mut caller: Caller<'_, HostState>,
         kind: i32,
         name: u32,
         name_len: u32,
         buf: u32,
         limit: u32|
         -> Result<i64> {
            let name = read_string(&mut caller, name, name_len)?;
            let values: Vec<Vec<u8>> = caller
                .data()
                .exchange
                .headers(kind)
                .map(|h| h.get_all(name.as_str()).iter().map(|v| v.as_bytes().to_vec()).collect())
                .unwrap_or_default();
            write_list(&mut caller, buf, limit, values.iter().map(Vec::as_slice))
        },
    )?;

    linker.func_wrap(
        HOST_MODULE,
        "set_header_value",
        |mut caller: Caller<'_, HostState>,
         kind: i32,
         name: u32,
         name_len: u32,
         value: u32,
         value_len: u32|
         -> Result<()> {
            let name = header_name(&read_string(&mut caller, name, name_len)?)?;
            let value = header_value(&read_string(&mut caller, value, value_len)?)?;
            headers_of(&mut caller, kind)?.insert(name, value);
            Ok(())
        },
    )?;

    linker.func_wrap(
        HOST_MODULE,
        "add_header_value",
        |mut caller: Caller<'_, HostState>,
         kind: i32,
         name: u32,
         name_len: u32,
         value: u32,
         value_len: u32|
         -> Result<()> {
            let name = header_name(&read_string(&mut caller, name, name_len)?)?;
            let value = header_value(&read_string(&mut caller, value, value_len)?)?;
            headers_of(&mut caller, kind)?.append(name, value);
            Ok(())
        },
    )?;

    linker.func_wrap(
        HOST_MODULE,
        "remove_header",
        |mut caller: Caller<'_, HostState>, kind: i32, name: u32, name_len: u32| -> Result<()> {
            let name = header_name(&read_string(&mut caller, name, name_len)?)?;
            headers_of(&mut caller, kind)?.remove(name);
            Ok(())
        },
    )?;

    linker.func_wrap(
        HOST_MODULE,
        "read_body",
        |mut caller: Caller<'_, HostState>, kind: i32, buf: u32, limit: u32| -> Result<i64> {
            let (chunk, eof) = caller.data_mut().exchange.read_body(kind, limit as usize);
            write_bytes(&mut caller, buf, &chunk)?;
            Ok((i64::from(eof) << 32) | chunk.len() as i64)
        },
    )?;

    linker.func_wrap(
        HOST_MODULE,
        "write_body",
        |mut caller: Caller<'_, HostState>, kind: i32, ptr: u32, len: u32| -> Result<()> {
            let chunk = read_bytes(&mut caller, ptr, len)?;
            caller.data_mut().exchange.write_body(kind, &chunk);
            Ok(())
        },
    )?;

    linker.func_wrap(HOST_MODULE, "get_status_code", |caller: Caller<'_, HostState>| -> u32 {
        u32::from(caller.data().exchange.response.status().as_u16())
    })?;

    linker.func_wrap(
        HOST_MODULE,
        "set_status_code",
        |mut caller: Caller<'_, HostState>, status: u32| -> Result<()> {
            let status = u16::try_from(status)
                .ok()
                .and_then(|s| StatusCode::from_u16(s).ok())
                .ok_or_else(|| wasmtime::Error::msg(format!("invalid status code {status}")))?;
            *caller.data_mut().exchange.response.status_mut() = status;
            Ok(())
        },
    )?;

    linker.func_wrap(
        HOST_MODULE,
        "get_source_addr",
        |mut caller: Caller<'_, HostState>, buf: u32, limit: u32| -> Result<u32> {
            let addr = caller
                .data()
                .exchange
                .remote_addr
                .map(|a| a.to_string())
                .unwrap_or_default();
            write_if_fits(&mut caller, buf, limit, addr.as_bytes())
        },
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use http::Request;

    fn exchange(body: &'static [u8]) -> Exchange {
        let request = Request::builder()
            .uri("/")
            .body(Bytes::from_static(body))
            .unwrap();
        Exchange::new(request, None)
    }

    #[test]
    fn body_reads_advance_until_eof() {
        let mut ex = exchange(b"hello world");
        let (chunk, eof) = ex.read_body(KIND_REQUEST, 5);
        assert_eq!(&chunk[..], b"hello");
        assert!(!eof);
        let (chunk, eof) = ex.read_body(KIND_REQUEST, 100);
        assert_eq!(&chunk[..], b" world");
        assert!(eof);
        let (chunk, eof) = ex.read_body(KIND_REQUEST, 100);
        assert!(chunk.is_empty());
        assert!(eof);
    }

    #[test]
    fn first_write_replaces_then_appends() {
        let mut ex = exchange(b"original");
        ex.write_body(KIND_REQUEST, b"new");
        ex.write_body(KIND_REQUEST, b" body");
        assert_eq!(&ex.request.body()[..], b"new body");
    }

    #[test]
    fn downstream_response_resets_write_state() {
        let mut ex = exchange(b"");
        ex.write_body(KIND_RESPONSE, b"guest");
        ex.set_response(HttpResponse::new(Bytes::from_static(b"upstream")));
        ex.write_body(KIND_RESPONSE, b"rewritten");
        assert_eq!(&ex.take_response().body()[..], b"rewritten");
    }

    #[test]
    fn unknown_kinds_are_inert() {
        let mut ex = exchange(b"data");
        assert!(ex.headers(7).is_none());
        let (chunk, eof) = ex.read_body(3, 10);
        assert!(chunk.is_empty() && eof);
        ex.write_body(3, b"ignored");
        assert_eq!(&ex.request.body()[..], b"data");
    }
}
