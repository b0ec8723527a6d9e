//! HTTP ingress for gateway users: short text messages, key-compromise
//! notification and the field-fix endpoint.
//!
//! Handlers reach the router and the configuration store through shared
//! handles injected as app data at startup; payloads are queued, never sent
//! inline, so a request returns before the mesh has to be ready.

use std::sync::Arc;
use std::time::Instant;

use actix_web::{post, web, HttpResponse};
use metrics::histogram;
use serde_json::{json, Value};
use tracing::{debug, info, warn};

use crate::config_store::{ConfigStore, GLOBAL_GROUP};
use crate::router::ZombieRouter;
use crate::zombiegram::{Payload, Priority};

/// Queue a USMS text message at high priority.
#[post("/usms")]
pub async fn post_usms(body: web::Json<Value>, router: web::Data<ZombieRouter>) -> HttpResponse {
    let req_start = Instant::now();
    let text = body.get("text").and_then(|v| v.as_str()).unwrap_or("");
    let resp = match Payload::usms(text) {
        Ok(payload) => {
            router.enqueue(Priority::High, vec![payload]);
            info!("gateway USMS received and queued");
            HttpResponse::Ok().json(json!({"ok": true}))
        }
        Err(e) => {
            warn!(error = %e, "could not send USMS");
            HttpResponse::Ok().json(json!({"error": e.to_string()}))
        }
    };
    histogram!("zg.ingest.latency_ms").record(req_start.elapsed().as_secs_f64() * 1000.0);
    resp
}

/// Spread a network-change notice derived from the current trust key, then
/// drop the key locally. A node without a key has nothing to drop.
#[post("/key_compromised")]
pub async fn post_key_compromised(
    router: web::Data<ZombieRouter>,
    store: web::Data<ConfigStore>,
) -> HttpResponse {
    match store.trust_key() {
        Some(trust_key) => {
            let notice = Payload::network_change_from_key(&trust_key);
            router.enqueue(Priority::High, vec![notice]);
            store.set_trust_key(None);
            if let Err(e) = store.save(GLOBAL_GROUP) {
                warn!(error = %e, "persisting the dropped trust key failed");
            }
            warn!("key compromised event triggered, dropping our own trust key and propagating");
            HttpResponse::Ok().json(json!({}))
        }
        None => HttpResponse::Ok().json(json!({
            "error": "could not drop key, device probably does not have a key set"
        })),
    }
}

/// Field-fix endpoint: inject a detection and correct device flags/position.
#[post("/fix")]
pub async fn post_fix(
    body: web::Json<Value>,
    router: web::Data<ZombieRouter>,
    store: web::Data<ConfigStore>,
) -> HttpResponse {
    if let Some(confidence) = body.get("confidence").and_then(|v| v.as_u64()) {
        let confidence = u8::try_from(confidence).unwrap_or(u8::MAX);
        let hitcounter = body
            .get("hitcounter")
            .and_then(|v| v.as_u64())
            .and_then(|h| u8::try_from(h).ok())
            .unwrap_or(1);
        match Payload::detection(confidence, hitcounter) {
            Ok(detection) => router.enqueue(Priority::Urgent, vec![detection]),
            Err(e) => debug!(error = %e, "fix carried an invalid detection"),
        }
    }

    if body.get("tampered").is_some() {
        store.set_tampered_flag(true);
        if let Err(e) = store.save(GLOBAL_GROUP) {
            warn!(error = %e, "persisting the tampered flag failed");
        }
    }

    if let Some(latitude) = body.get("gps_latitude").and_then(|v| v.as_f64()) {
        // Key spelling matches what the field devices actually send.
        let longitude = body.get("gps_longtitude").and_then(|v| v.as_f64()).unwrap_or(0.0);
        store.set_position(latitude as f32, longitude as f32);
    }

    if body.get("maintenance").is_some() {
        store.set_maintenance_flag(true);
        if let Err(e) = store.save(GLOBAL_GROUP) {
            warn!(error = %e, "persisting the maintenance flag failed");
        }
    }

    HttpResponse::Ok().finish()
}

/// Register the ingress endpoints and attach the shared handles.
pub fn config(cfg: &mut web::ServiceConfig, router: Arc<ZombieRouter>, store: Arc<ConfigStore>) {
    cfg.app_data(web::Data::from(router));
    cfg.app_data(web::Data::from(store));
    cfg.service(post_usms);
    cfg.service(post_key_compromised);
    cfg.service(post_fix);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mesh::MeshTransport;
    use actix_web::{test, App};
    use async_trait::async_trait;
    use std::io;
    use std::net::SocketAddr;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct NullMesh;

    #[async_trait]
    impl MeshTransport for NullMesh {
        async fn send_to(&self, frame: &[u8], _addr: SocketAddr) -> io::Result<usize> {
            Ok(frame.len())
        }

        async fn recv_from(&self, _buf: &mut [u8]) -> io::Result<(usize, SocketAddr)> {
            std::future::pending().await
        }

        fn multicast_addr(&self) -> SocketAddr {
            "224.0.0.199:1337".parse().unwrap()
        }

        fn is_connected(&self) -> bool {
            false
        }

        fn neighbors(&self) -> Vec<u32> {
            Vec::new()
        }

        fn record_heard(&self, _source_id: u32, _addr: SocketAddr) {}

        fn local_ip(&self) -> Option<String> {
            None
        }

        fn deinit(&self) {}
    }

    fn handles() -> (Arc<ZombieRouter>, Arc<ConfigStore>) {
        static SEQ: AtomicUsize = AtomicUsize::new(0);
        let dir = std::env::temp_dir().join(format!(
            "zombiegram-ingress-{}-{}",
            std::process::id(),
            SEQ.fetch_add(1, Ordering::Relaxed)
        ));
        let store = Arc::new(ConfigStore::new(dir));
        let router = ZombieRouter::new(store.clone(), Arc::new(NullMesh), 0x0000_0001);
        (router, store)
    }

    #[actix_web::test]
    async fn usms_is_queued_at_high_priority() {
        let (router, store) = handles();
        let app = test::init_service(
            App::new().configure(|cfg| config(cfg, router.clone(), store.clone())),
        )
        .await;

        let req = test::TestRequest::post()
            .uri("/usms")
            .set_json(json!({"text": "need supplies at the mall"}))
            .to_request();
        let resp: Value = test::call_and_read_body_json(&app, req).await;
        assert_eq!(resp["ok"], true);

        let queued = router.queued();
        assert_eq!(queued.len(), 1);
        assert_eq!(queued[0].0, Priority::High);
        assert!(matches!(queued[0].1[0], Payload::Usms { .. }));
    }

    #[actix_web::test]
    async fn oversize_usms_reports_an_error() {
        let (router, store) = handles();
        let app = test::init_service(
            App::new().configure(|cfg| config(cfg, router.clone(), store.clone())),
        )
        .await;

        let text: String = std::iter::repeat('a').take(71).collect();
        let req = test::TestRequest::post()
            .uri("/usms")
            .set_json(json!({"text": text}))
            .to_request();
        let resp: Value = test::call_and_read_body_json(&app, req).await;
        assert!(resp["error"].as_str().unwrap().contains("71 chars given"));
        assert!(router.queued().is_empty());
    }

    #[actix_web::test]
    async fn key_compromised_queues_notice_and_drops_key() {
        let (router, store) = handles();
        store.set_trust_key(Some(b"test"));
        let app = test::init_service(
            App::new().configure(|cfg| config(cfg, router.clone(), store.clone())),
        )
        .await;

        let req = test::TestRequest::post().uri("/key_compromised").to_request();
        let resp: Value = test::call_and_read_body_json(&app, req).await;
        assert_eq!(resp, json!({}));
        assert_eq!(store.trust_key(), None);

        let queued = router.queued();
        assert_eq!(queued.len(), 1);
        assert!(matches!(queued[0].1[0], Payload::NetworkChange { .. }));

        // A second trigger has nothing left to drop.
        let req = test::TestRequest::post().uri("/key_compromised").to_request();
        let resp: Value = test::call_and_read_body_json(&app, req).await;
        assert!(resp["error"].as_str().unwrap().contains("does not have a key"));
        assert_eq!(router.queued().len(), 1);
    }

    #[actix_web::test]
    async fn fix_queues_detection_and_updates_flags() {
        let (router, store) = handles();
        let app = test::init_service(
            App::new().configure(|cfg| config(cfg, router.clone(), store.clone())),
        )
        .await;

        let req = test::TestRequest::post()
            .uri("/fix")
            .set_json(json!({
                "confidence": 80,
                "tampered": true,
                "gps_latitude": 50.95,
                "gps_longtitude": 5.35,
            }))
            .to_request();
        let resp = test::call_service(&app, req).await;
        assert!(resp.status().is_success());

        let queued = router.queued();
        assert_eq!(queued.len(), 1);
        assert_eq!(queued[0].0, Priority::Urgent);
        assert_eq!(queued[0].1[0], Payload::detection(80, 1).unwrap());
        assert!(store.tampered_flag());
        assert!(!store.maintenance_flag());
        assert!(store.position().is_some());
    }

    #[actix_web::test]
    async fn fix_without_confidence_queues_nothing() {
        let (router, store) = handles();
        let app = test::init_service(
            App::new().configure(|cfg| config(cfg, router.clone(), store.clone())),
        )
        .await;

        let req = test::TestRequest::post()
            .uri("/fix")
            .set_json(json!({"maintenance": true}))
            .to_request();
        let resp = test::call_service(&app, req).await;
        assert!(resp.status().is_success());
        assert!(router.queued().is_empty());
        assert!(store.maintenance_flag());
    }
}
