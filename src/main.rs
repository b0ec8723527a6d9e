// Node entrypoint: boots the configuration, the LoRa-side zombie router and
// the gateway HTTP ingress. The HTTP surface runs on every node; whether the
// node actually bridges traffic to webhooks is a configuration flag.

use std::sync::Arc;

use actix_web::{middleware, App, HttpServer};
use serde_json::{json, Value};
use tracing::info;

use zombiegram_node::config_store::{ConfigStore, GLOBAL_GROUP};
use zombiegram_node::ingress;
use zombiegram_node::mesh::UdpMesh;
use zombiegram_node::router::ZombieRouter;

/// Boot-time defaults, only filled in where no persisted value exists.
fn seed_defaults(store: &ConfigStore) {
    store.set("device_trust_key", Value::Null, true, false);
    store.set("device_is_router", json!(true), true, false);
    store.set("device_is_gateway", json!(false), true, false);
    store.set("device_position", Value::Null, true, false);
    // Random initial sequence number so a reboot does not replay into the
    // neighbors' dedup window.
    store.set("lora_seq_num", json!(rand::random::<u8>()), true, false);
    store.set("lora_tampered_flag", json!(false), true, false);
    store.set("lora_maintenance_flag", json!(false), true, false);
    store.set("gateway_webhook_1", json!(""), true, false);
    store.set("gateway_webhook_2", json!(""), true, false);
    store.set("gateway_webhook_3", json!(""), true, false);
}

/// Stable low-32-bit device id: taken from the datastore, minted randomly and
/// persisted on first boot.
fn resolve_source_id(store: &ConfigStore) -> u32 {
    if let Some(source_id) = store.device_source_id() {
        return source_id;
    }
    let source_id: u32 = rand::random();
    store.set_device_source_id(source_id);
    if let Err(e) = store.save(GLOBAL_GROUP) {
        log::warn!("could not persist the freshly minted device source id: {e}");
    }
    source_id
}

#[actix_web::main]
async fn main() -> std::io::Result<()> {
    env_logger::init();
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let store = Arc::new(ConfigStore::new("datastore"));
    if let Err(e) = store.load(GLOBAL_GROUP) {
        log::warn!("no previous 'global' configuration save was found, booting with defaults ({e})");
    }
    seed_defaults(&store);
    let source_id = resolve_source_id(&store);

    let mesh = Arc::new(UdpMesh::bind().await?);
    let router = ZombieRouter::new(store.clone(), mesh, source_id);
    router.start();
    info!(
        source_id = format!("{source_id:08x}"),
        is_router = store.is_router(),
        is_gateway = store.is_gateway(),
        "node booted"
    );

    let http_router = router.clone();
    let http_store = store.clone();
    HttpServer::new(move || {
        App::new()
            .wrap(middleware::Logger::default())
            .configure(|cfg| ingress::config(cfg, http_router.clone(), http_store.clone()))
    })
    .bind(("0.0.0.0", 8080))?
    .run()
    .await
}
