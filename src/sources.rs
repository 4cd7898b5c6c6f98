//! Video source registries.
//!
//! `DeviceRegistry` enumerates local capture devices; `UrlStore` is the
//! JSON-file-backed registry of known network video devices. Both are
//! explicit store objects owned by the pipeline controller — all
//! mutation goes through their methods (single-writer), other
//! components read through accessors.

use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use opencv::prelude::*;
use opencv::videoio::{VideoCapture, CAP_ANY};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};
use url::Url;

use crate::error::{HomewatchError, Result};

/// Transport schemes accepted for network sources.
pub const SUPPORTED_PROTOCOLS: [&str; 4] = ["http", "https", "rtsp", "rtmp"];

pub fn valid_protocol(protocol: &str) -> bool {
    SUPPORTED_PROTOCOLS
        .iter()
        .any(|p| p.eq_ignore_ascii_case(protocol))
}

// ─── Local devices ───────────────────────────────────────────────────────────

/// Snapshot of openable local capture indices.
pub struct DeviceRegistry {
    indices: Vec<i32>,
}

impl DeviceRegistry {
    /// Probe device indices `0..limit` and keep the ones that open.
    /// Opening is the only portable way to enumerate V4L/AVFoundation
    /// devices through the capture backend.
    pub fn scan(limit: i32) -> Self {
        let mut indices = Vec::new();
        for idx in 0..limit.max(0) {
            match VideoCapture::new(idx, CAP_ANY) {
                Ok(mut cap) if cap.is_opened().unwrap_or(false) => {
                    indices.push(idx);
                    let _ = cap.release();
                }
                _ => {}
            }
        }
        info!(target: "sources", "local device scan found {:?}", indices);
        Self { indices }
    }

    /// Build from known indices (tests, pre-configured deployments).
    pub fn from_indices(indices: Vec<i32>) -> Self {
        Self { indices }
    }

    pub fn is_empty(&self) -> bool {
        self.indices.is_empty()
    }

    pub fn len(&self) -> usize {
        self.indices.len()
    }

    pub fn indices(&self) -> &[i32] {
        &self.indices
    }

    /// Capture index for the nth scanned device.
    pub fn device_at(&self, position: usize) -> Option<i32> {
        self.indices.get(position).copied()
    }
}

// ─── Network device store ────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetworkDevice {
    pub url: String,
    #[serde(default)]
    pub index: i64,
    #[serde(default)]
    pub ip: String,
    #[serde(default)]
    pub port: String,
}

/// How a user-supplied network source resolved against the store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedUrl {
    pub url: String,
    /// False when the URL was not in the store yet; the controller
    /// persists it back after a successful open.
    pub known: bool,
}

/// What the caller passed to select a network source.
#[derive(Debug, Clone)]
pub enum NetworkSource {
    /// Index of a previously stored device.
    StoredIndex(i64),
    /// A bare IP or a full URL.
    Address(String),
}

pub struct UrlStore {
    path: PathBuf,
    devices: Vec<NetworkDevice>,
}

impl UrlStore {
    /// Load the store, re-deriving index/ip/port from each URL. A
    /// missing file is an empty store, not an error.
    pub fn load(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let mut devices: Vec<NetworkDevice> = if path.exists() {
            let raw = std::fs::read_to_string(&path)?;
            serde_json::from_str(&raw)?
        } else {
            Vec::new()
        };
        for (i, dev) in devices.iter_mut().enumerate() {
            dev.index = (i + 1) as i64;
            if let Ok(parsed) = Url::parse(&dev.url) {
                dev.ip = parsed.host_str().unwrap_or_default().to_string();
                dev.port = parsed.port().map(|p| p.to_string()).unwrap_or_default();
            }
        }
        let store = Self { path, devices };
        store.persist()?;
        Ok(store)
    }

    pub fn is_empty(&self) -> bool {
        self.devices.is_empty()
    }

    pub fn devices(&self) -> &[NetworkDevice] {
        &self.devices
    }

    pub fn url_for_index(&self, index: i64) -> Option<&str> {
        self.devices
            .iter()
            .find(|d| d.index == index)
            .map(|d| d.url.as_str())
    }

    pub fn url_for_ip(&self, ip: &str) -> Option<&str> {
        self.devices
            .iter()
            .find(|d| d.ip == ip)
            .map(|d| d.url.as_str())
    }

    pub fn contains_url(&self, url: &str) -> bool {
        self.devices.iter().any(|d| d.url == url)
    }

    /// Resolve a stored index, bare IP or URL to the canonical capture
    /// URL. `protocol` is used to synthesize a URL for an unknown IP.
    pub fn resolve(&self, source: &NetworkSource, protocol: &str) -> Result<ResolvedUrl> {
        if !valid_protocol(protocol) {
            return Err(HomewatchError::UnsupportedProtocol(protocol.to_string()));
        }
        match source {
            NetworkSource::StoredIndex(index) => self
                .url_for_index(*index)
                .map(|url| ResolvedUrl {
                    url: url.to_string(),
                    known: true,
                })
                .ok_or(HomewatchError::UnknownStoredIndex(*index)),
            NetworkSource::Address(addr) => {
                if IpAddr::from_str(addr).is_ok() {
                    // Bare IP: reuse the stored URL for that host when we
                    // have one, otherwise default to {protocol}://{ip}.
                    Ok(match self.url_for_ip(addr) {
                        Some(url) => ResolvedUrl {
                            url: url.to_string(),
                            known: true,
                        },
                        None => ResolvedUrl {
                            url: format!("{}://{}", protocol.to_ascii_lowercase(), addr),
                            known: false,
                        },
                    })
                } else {
                    Ok(ResolvedUrl {
                        url: addr.clone(),
                        known: self.contains_url(addr),
                    })
                }
            }
        }
    }

    /// Record a URL that opened successfully but was not stored yet.
    pub fn append(&mut self, url: &str) -> Result<()> {
        if self.contains_url(url) {
            return Ok(());
        }
        let index = self.devices.len() as i64 + 1;
        let (ip, port) = match Url::parse(url) {
            Ok(parsed) => (
                parsed.host_str().unwrap_or_default().to_string(),
                parsed.port().map(|p| p.to_string()).unwrap_or_default(),
            ),
            Err(err) => {
                warn!(target: "sources", "storing unparseable url {}: {}", url, err);
                (String::new(), String::new())
            }
        };
        self.devices.push(NetworkDevice {
            url: url.to_string(),
            index,
            ip,
            port,
        });
        self.persist()?;
        info!(target: "sources", "appended url {} to {}", url, self.path.display());
        Ok(())
    }

    fn persist(&self) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let raw = serde_json::to_string_pretty(&self.devices)?;
        std::fs::write(&self.path, raw)?;
        Ok(())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn store_with(urls: &[&str]) -> (UrlStore, TempDir) {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("devices.json");
        let devices: Vec<NetworkDevice> = urls
            .iter()
            .map(|u| NetworkDevice {
                url: u.to_string(),
                index: 0,
                ip: String::new(),
                port: String::new(),
            })
            .collect();
        std::fs::write(&path, serde_json::to_string(&devices).unwrap()).unwrap();
        (UrlStore::load(path).unwrap(), dir)
    }

    #[test]
    fn load_reindexes_and_derives_fields() {
        let (store, _dir) = store_with(&["rtsp://192.168.1.20:8554/live", "http://10.0.0.7:8081/"]);
        let devs = store.devices();
        assert_eq!(devs[0].index, 1);
        assert_eq!(devs[1].index, 2);
        assert_eq!(devs[0].ip, "192.168.1.20");
        assert_eq!(devs[0].port, "8554");
        assert_eq!(devs[1].ip, "10.0.0.7");
    }

    #[test]
    fn resolve_rejects_unknown_protocol() {
        let (store, _dir) = store_with(&[]);
        let err = store
            .resolve(&NetworkSource::Address("10.0.0.1".into()), "ftp")
            .unwrap_err();
        assert!(matches!(err, HomewatchError::UnsupportedProtocol(_)));
    }

    #[test]
    fn resolve_stored_index() {
        let (store, _dir) = store_with(&["rtsp://192.168.1.20:8554/live"]);
        let res = store
            .resolve(&NetworkSource::StoredIndex(1), "rtsp")
            .unwrap();
        assert_eq!(res.url, "rtsp://192.168.1.20:8554/live");
        assert!(res.known);
        assert!(store
            .resolve(&NetworkSource::StoredIndex(9), "rtsp")
            .is_err());
    }

    #[test]
    fn resolve_bare_ip_known_and_unknown() {
        let (store, _dir) = store_with(&["rtsp://192.168.1.20:8554/live"]);
        let known = store
            .resolve(&NetworkSource::Address("192.168.1.20".into()), "rtsp")
            .unwrap();
        assert!(known.known);
        assert_eq!(known.url, "rtsp://192.168.1.20:8554/live");

        let unknown = store
            .resolve(&NetworkSource::Address("10.9.9.9".into()), "RTSP")
            .unwrap();
        assert!(!unknown.known);
        assert_eq!(unknown.url, "rtsp://10.9.9.9");
    }

    #[test]
    fn append_persists_and_is_idempotent() {
        let (mut store, _dir) = store_with(&[]);
        store.append("rtsp://10.1.1.1:8554/live").unwrap();
        store.append("rtsp://10.1.1.1:8554/live").unwrap();
        assert_eq!(store.devices().len(), 1);

        let reloaded = UrlStore::load(store.path().to_path_buf()).unwrap();
        assert!(reloaded.contains_url("rtsp://10.1.1.1:8554/live"));
        assert_eq!(reloaded.devices()[0].ip, "10.1.1.1");
    }
}
