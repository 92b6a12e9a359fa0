//! Test doubles and helpers shared by the integration tests.

#![allow(dead_code)]

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use axum::body::Body;
use axum::http::{Request, Response};
use http_body_util::BodyExt;
use serde_json::Value;

use userland_gateway::auth::{CredentialVerifier, VerifyError};
use userland_gateway::distro::{validate_name, DistroController, DistroError, DistroRecord};
use userland_gateway::metrics::{CollectorError, MemoryUsage, SystemCollector, SystemSnapshot};
use userland_gateway::{AppState, Config};

/// Accepts exactly `alice` / `wonderland`.
pub struct FixedVerifier;

#[async_trait]
impl CredentialVerifier for FixedVerifier {
    async fn verify(&self, username: &str, password: &str) -> Result<(), VerifyError> {
        if username == "alice" && password == "wonderland" {
            Ok(())
        } else {
            Err(VerifyError::Rejected)
        }
    }
}

/// Returns a fixed snapshot, or fails while `failing` is set.
#[derive(Default)]
pub struct StaticCollector {
    pub failing: AtomicBool,
}

#[async_trait]
impl SystemCollector for StaticCollector {
    async fn snapshot(&self) -> Result<SystemSnapshot, CollectorError> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(CollectorError::Unavailable("/proc/stat: permission denied".into()));
        }
        Ok(SystemSnapshot {
            cpu: 42.0,
            memory: MemoryUsage {
                total: 4096,
                used: 1024,
                free: 3072,
                usage_percent: 25.0,
            },
            timestamp: 1,
            ..SystemSnapshot::default()
        })
    }
}

/// In-memory distro controller with the same validation rules as the
/// command-backed one.
#[derive(Default)]
pub struct MemoryDistros {
    records: Mutex<Vec<DistroRecord>>,
}

#[async_trait]
impl DistroController for MemoryDistros {
    async fn create(&self, name: &str, port: u64) -> Result<DistroRecord, DistroError> {
        validate_name(name)?;
        let port = u16::try_from(port)
            .ok()
            .filter(|p| *p >= 1024)
            .ok_or(DistroError::InvalidPort {
                port,
                min: 1024,
                max: 65535,
            })?;
        let mut records = self.records.lock().unwrap();
        if records.iter().any(|r| r.name == name) {
            return Err(DistroError::NameTaken(name.to_string()));
        }
        if records.iter().any(|r| r.port == port) {
            return Err(DistroError::PortTaken(port));
        }
        let record = DistroRecord {
            name: name.to_string(),
            port,
            status: "running".to_string(),
            created_at: Some(format!("2024-01-{:02}T00:00:00Z", records.len() + 1)),
        };
        records.push(record.clone());
        Ok(record)
    }

    async fn list(&self) -> Result<Vec<DistroRecord>, DistroError> {
        Ok(self.records.lock().unwrap().clone())
    }

    async fn delete(&self, name: &str) -> Result<(), DistroError> {
        let mut records = self.records.lock().unwrap();
        let before = records.len();
        records.retain(|r| r.name != name);
        if records.len() == before {
            return Err(DistroError::NotFound(name.to_string()));
        }
        Ok(())
    }
}

/// Config pointing at nothing real: `sh` in `/tmp`, a proxy backend on a
/// port nobody listens on, fast metrics.
pub fn test_config() -> Config {
    let mut config = Config::default();
    config.shell.program = "sh".to_string();
    config.shell.working_dir = "/tmp".to_string();
    config.proxy.backend = "127.0.0.1:1".to_string();
    config.proxy.connect_timeout_ms = 500;
    config.metrics.interval_ms = 2000;
    config
}

pub fn test_state() -> (AppState, Arc<StaticCollector>) {
    state_with(test_config())
}

pub fn state_with(config: Config) -> (AppState, Arc<StaticCollector>) {
    let collector = Arc::new(StaticCollector::default());
    let state = AppState::new(
        config,
        Arc::new(FixedVerifier),
        collector.clone(),
        Arc::new(MemoryDistros::default()),
    );
    (state, collector)
}

pub async fn body_json(response: Response<Body>) -> Value {
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    serde_json::from_slice(&bytes).unwrap()
}

pub fn get(uri: &str, token: Option<&str>) -> Request<Body> {
    let mut builder = Request::builder().method("GET").uri(uri);
    if let Some(t) = token {
        builder = builder.header("authorization", format!("Bearer {t}"));
    }
    builder.body(Body::empty()).unwrap()
}

pub fn json_request(method: &str, uri: &str, token: Option<&str>, body: &str) -> Request<Body> {
    let mut builder = Request::builder()
        .method(method)
        .uri(uri)
        .header("content-type", "application/json");
    if let Some(t) = token {
        builder = builder.header("authorization", format!("Bearer {t}"));
    }
    builder.body(Body::from(body.to_string())).unwrap()
}
