//! Shared fixtures for the plugin integration tests.

#![allow(dead_code)]

use bytes::Bytes;
use portcullis_kernel::{HttpRequest, HttpResponse, RemoteAddr, SharedHttpHandler, handler_fn};
use portcullis_plugins::archive::module_dir;
use portcullis_plugins::types::{LocalDescriptor, Settings};
use std::collections::HashMap;
use std::io::Write;
use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

/// Writes a plugin tree under `{root}/src/{module}`.
pub fn write_plugin(root: &Path, module: &str, manifest: &str, files: &[(&str, &[u8])]) {
    let dir = module_dir(&root.join("src"), module);
    std::fs::create_dir_all(&dir).unwrap();
    std::fs::write(dir.join(portcullis_plugins::MANIFEST_FILE), manifest).unwrap();
    for (name, content) in files {
        let path = dir.join(name);
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(path, content).unwrap();
    }
}

pub fn local(alias: &str, module: &str, settings: Settings) -> HashMap<String, LocalDescriptor> {
    let mut plugins = HashMap::new();
    plugins.insert(
        alias.to_string(),
        LocalDescriptor {
            module_name: module.to_string(),
            settings,
        },
    );
    plugins
}

/// Zip archive holding `entries`.
pub fn zip_bytes(entries: &[(&str, &str)]) -> Vec<u8> {
    let mut zip = zip::ZipWriter::new(std::io::Cursor::new(Vec::new()));
    for (name, data) in entries {
        zip.start_file(*name, zip::write::SimpleFileOptions::default())
            .unwrap();
        zip.write_all(data.as_bytes()).unwrap();
    }
    zip.finish().unwrap().into_inner()
}

pub fn request(uri: &str, peer: &str) -> HttpRequest {
    let mut req = http::Request::builder()
        .uri(uri)
        .header("host", "proxy.local")
        .body(Bytes::new())
        .unwrap();
    let addr: SocketAddr = peer.parse().unwrap();
    req.extensions_mut().insert(RemoteAddr(addr));
    req
}

/// A terminal handler answering 200 "next" and counting its calls.
pub fn counting_next() -> (SharedHttpHandler, Arc<AtomicUsize>) {
    let calls = Arc::new(AtomicUsize::new(0));
    let counter = calls.clone();
    let next = handler_fn(move |req: HttpRequest| {
        let counter = counter.clone();
        async move {
            counter.fetch_add(1, Ordering::SeqCst);
            let mut resp = HttpResponse::new(Bytes::from_static(b"next"));
            if let Some(value) = req.headers().get("x-plugin") {
                resp.headers_mut().insert("x-seen", value.clone());
            }
            resp
        }
    });
    (next, calls)
}

/// A terminal handler answering with the request's body and headers.
pub fn echo_next() -> SharedHttpHandler {
    handler_fn(|req: HttpRequest| async move {
        let (parts, body) = req.into_parts();
        let mut resp = HttpResponse::new(body);
        *resp.headers_mut() = parts.headers;
        resp
    })
}

pub fn calls(counter: &AtomicUsize) -> usize {
    counter.load(Ordering::SeqCst)
}
