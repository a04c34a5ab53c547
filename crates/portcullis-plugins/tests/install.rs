//! Remote plugin installation against a mock registry.

mod common;

use common::{calls, counting_next, request, zip_bytes};
use http::StatusCode;
use portcullis_plugins::client::DEFAULT_HASH_HEADER;
use portcullis_plugins::{
    Builder, Descriptor, Manager, RegistryDownloader, SetupError, setup_remote_plugins,
};
use serde_json::{Map, json};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use wiremock::matchers::{header, header_exists, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

const MODULE: &str = "github.com/acme/ip-allow";
const VERSION: &str = "v1.0.0";

const MANIFEST: &str = "displayName: IP allow\ntype: middleware\nimport: github.com/acme/ip-allow\nsummary: Rejects clients outside a prefix\ntestData:\n  allowedIPPrefix: \"127\"\n";

const SCRIPT: &str = r#"
fn create_config() { #{ allowedIPPrefix: "" } }

fn new_handler(config, name) {
    if config.allowedIPPrefix == "" {
        return [(), "allowedIPPrefix must be set"];
    }
    [#{ prefix: config.allowedIPPrefix, name: name }, ()]
}

fn serve_http(handler) {
    if this.remote_addr.starts_with(handler.prefix) {
        return;
    }
    #{ status: 403, body: "Forbidden" }
}
"#;

fn archive() -> Vec<u8> {
    zip_bytes(&[
        (format!("{MODULE}@{VERSION}/.portcullis.yml").as_str(), MANIFEST),
        (format!("{MODULE}@{VERSION}/ip_allow.rhai").as_str(), SCRIPT),
    ])
}

fn declared() -> HashMap<String, Descriptor> {
    let mut plugins = HashMap::new();
    plugins.insert("allow".to_string(), Descriptor::new(MODULE, VERSION));
    plugins
}

fn manager(server: &MockServer, output: &Path) -> Manager {
    let downloader = RegistryDownloader::new(&server.uri(), output.join("archives")).unwrap();
    Manager::new(Arc::new(downloader), output).unwrap()
}

#[tokio::test]
async fn second_run_reuses_the_archive_on_not_modified() {
    let server = MockServer::start().await;
    let body = archive();
    let hash = hex::encode(Sha256::digest(&body));

    Mock::given(method("GET"))
        .and(path(format!("/download/{MODULE}/{VERSION}")))
        .and(header(DEFAULT_HASH_HEADER, hash.as_str()))
        .respond_with(ResponseTemplate::new(304))
        .with_priority(1)
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path(format!("/download/{MODULE}/{VERSION}")))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(body.clone()))
        .with_priority(2)
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path(format!("/validate/{MODULE}/{VERSION}")))
        .and(header(DEFAULT_HASH_HEADER, hash.as_str()))
        .respond_with(ResponseTemplate::new(200))
        .expect(2)
        .mount(&server)
        .await;

    let output = tempfile::tempdir().unwrap();
    let plugins = declared();

    let first = manager(&server, output.path());
    setup_remote_plugins(&first, &plugins).await.unwrap();
    let archive_path = first.archive_path(MODULE, VERSION);
    let before = std::fs::read(&archive_path).unwrap();

    let second = manager(&server, output.path());
    setup_remote_plugins(&second, &plugins).await.unwrap();

    assert_eq!(std::fs::read(&archive_path).unwrap(), before);
    assert!(second.source_dir(MODULE).join("ip_allow.rhai").is_file());

    let state = second.read_state().unwrap().unwrap();
    assert_eq!(state.get(MODULE).map(String::as_str), Some(VERSION));
}

#[tokio::test]
async fn installed_plugin_filters_by_ip_prefix() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path(format!("/download/{MODULE}/{VERSION}")))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(archive()))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path(format!("/validate/{MODULE}/{VERSION}")))
        .and(header_exists(DEFAULT_HASH_HEADER))
        .respond_with(ResponseTemplate::new(200))
        .mount(&server)
        .await;

    let output = tempfile::tempdir().unwrap();
    let plugins = declared();
    let manager = manager(&server, output.path());
    setup_remote_plugins(&manager, &plugins).await.unwrap();

    let builder = Builder::new(manager.sources_root(), &plugins, output.path(), &HashMap::new()).unwrap();
    let config = json!({ "allowedIPPrefix": "127" });
    let middleware = builder
        .build("allow", config.as_object().unwrap(), "allow-local")
        .unwrap();

    let (next, counter) = counting_next();
    let handler = middleware.new_handler(next).unwrap();

    let resp = handler.serve_http(request("http://proxy.local/", "127.0.0.1:1234")).await;
    assert_eq!(resp.status(), StatusCode::OK);
    assert_eq!(resp.body().as_ref(), b"next");
    assert_eq!(calls(&counter), 1);

    let resp = handler.serve_http(request("http://proxy.local/", "192.168.1.1:1234")).await;
    assert_eq!(resp.status(), StatusCode::FORBIDDEN);
    assert_eq!(calls(&counter), 1);

    let empty = builder.build("allow", &Map::new(), "allow-empty").unwrap();
    let (next, _) = counting_next();
    assert!(empty.new_handler(next).is_err());
}

#[tokio::test]
async fn rejected_hash_wipes_the_storage() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path(format!("/download/{MODULE}/{VERSION}")))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(archive()))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path(format!("/validate/{MODULE}/{VERSION}")))
        .respond_with(ResponseTemplate::new(403).set_body_string("unknown hash"))
        .mount(&server)
        .await;

    let output = tempfile::tempdir().unwrap();
    let manager = manager(&server, output.path());

    let report = setup_remote_plugins(&manager, &declared()).await.unwrap_err();
    assert!(matches!(report.current_context(), SetupError::Install));
    assert!(format!("{report:?}").contains("unable to set up plugin allow"));
    assert!(!manager.archive_path(MODULE, VERSION).exists());
    assert!(manager.read_state().unwrap().is_none());
}

#[tokio::test]
async fn pinned_hash_skips_remote_validation() {
    let server = MockServer::start().await;
    let body = archive();
    let hash = hex::encode(Sha256::digest(&body));

    Mock::given(method("GET"))
        .and(path(format!("/download/{MODULE}/{VERSION}")))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(body))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path(format!("/validate/{MODULE}/{VERSION}")))
        .respond_with(ResponseTemplate::new(200))
        .expect(0)
        .mount(&server)
        .await;

    let output = tempfile::tempdir().unwrap();
    let manager = manager(&server, output.path());
    let mut plugins = HashMap::new();
    plugins.insert(
        "allow".to_string(),
        Descriptor::new(MODULE, VERSION).with_hash(hash),
    );

    setup_remote_plugins(&manager, &plugins).await.unwrap();
    assert!(manager.source_dir(MODULE).join(".portcullis.yml").is_file());
}
