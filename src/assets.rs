//! On-disk model asset management.
//!
//! Assets are fetched over HTTPS with redirect following, written to a
//! `.partial` file and atomically renamed, and validated against a size
//! threshold (0.8× the nominal size, tolerating re-encodes while catching
//! truncation). Failed files retry with exponential backoff; concurrent
//! callers asking for the same asset set share one in-flight download.

use crate::config::EngineConfig;
use crate::error::{AssetErrorKind, AssetFailure, EngineError, Result};
use std::collections::HashMap;
use std::fs;
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex, OnceLock};
use std::time::Duration;

pub const VOICE_ENCODER_FILE: &str = "mimi_encoder.onnx";
pub const TEXT_CONDITIONER_FILE: &str = "text_conditioner.onnx";
pub const BACKBONE_FILE: &str = "flow_lm_main_int8.onnx";
pub const FLOW_FILE: &str = "flow_lm_flow_int8.onnx";
pub const DECODER_FILE: &str = "mimi_decoder_int8.onnx";
pub const TOKENIZER_FILE: &str = "tokenizer.model";
pub const VOICES_FILE: &str = "voices.bin";

/// A model file the engine needs on disk.
#[derive(Debug, Clone)]
pub struct ModelAsset {
    /// File name inside the models directory.
    pub name: &'static str,
    /// Remote location; redirects are followed.
    pub url: String,
    /// Expected size of a healthy download, in bytes.
    pub nominal_bytes: u64,
}

impl ModelAsset {
    /// Minimum acceptable on-disk size.
    pub fn min_bytes(&self) -> u64 {
        self.nominal_bytes * 4 / 5
    }

    pub fn path_in(&self, dir: &Path) -> PathBuf {
        dir.join(self.name)
    }

    /// Integrity predicate: the file exists and is at least [`min_bytes`].
    ///
    /// [`min_bytes`]: ModelAsset::min_bytes
    pub fn is_present(&self, dir: &Path) -> bool {
        fs::metadata(self.path_in(dir))
            .map(|meta| meta.len() >= self.min_bytes())
            .unwrap_or(false)
    }
}

/// The full asset set for the default model.
pub fn default_assets(base_url: &str) -> Vec<ModelAsset> {
    let base = base_url.trim_end_matches('/');
    let asset = |name: &'static str, nominal_bytes: u64| ModelAsset {
        name,
        url: format!("{base}/{name}"),
        nominal_bytes,
    };
    vec![
        asset(VOICE_ENCODER_FILE, 38_000_000),
        asset(TEXT_CONDITIONER_FILE, 66_000_000),
        asset(BACKBONE_FILE, 310_000_000),
        asset(FLOW_FILE, 46_000_000),
        asset(DECODER_FILE, 42_000_000),
        asset(TOKENIZER_FILE, 800_000),
        asset(VOICES_FILE, 17_000_000),
    ]
}

/// Retry and timeout policy for one asset set.
#[derive(Debug, Clone)]
pub struct DownloadPolicy {
    pub retries: u32,
    pub backoff_base: Duration,
    pub connect_timeout: Duration,
    pub request_timeout: Duration,
}

impl DownloadPolicy {
    pub fn from_config(config: &EngineConfig) -> Self {
        Self {
            retries: config.download_retries.max(1),
            backoff_base: config.download_backoff_base(),
            connect_timeout: config.connect_timeout(),
            request_timeout: config.request_timeout(),
        }
    }
}

/// Live byte counters for one asset download.
#[derive(Debug)]
pub struct AssetProgress {
    pub name: &'static str,
    bytes: AtomicU64,
    total: AtomicU64,
}

impl AssetProgress {
    fn new(name: &'static str) -> Self {
        Self {
            name,
            bytes: AtomicU64::new(0),
            total: AtomicU64::new(0),
        }
    }

    /// Bytes downloaded so far and the total when the server reported one.
    pub fn snapshot(&self) -> (u64, Option<u64>) {
        let total = self.total.load(Ordering::Relaxed);
        (
            self.bytes.load(Ordering::Relaxed),
            (total > 0).then_some(total),
        )
    }
}

struct Flight {
    outcome: Mutex<Option<Result<()>>>,
    done: Condvar,
    progress: Vec<Arc<AssetProgress>>,
}

/// Coalescing table for asset downloads.
///
/// A caller that finds a flight already active for its asset-set label waits
/// for that flight's outcome instead of issuing duplicate requests. Engines
/// share the [`global_hub`] by default so coalescing holds across every
/// engine in the process; a private hub is only for callers that need
/// isolation (tests, sandboxed embedders).
#[derive(Default)]
pub struct DownloadHub {
    flights: Mutex<HashMap<String, Arc<Flight>>>,
}

/// The process-wide hub: at most one download flight per asset-set label
/// anywhere in the process.
pub fn global_hub() -> Arc<DownloadHub> {
    static HUB: OnceLock<Arc<DownloadHub>> = OnceLock::new();
    Arc::clone(HUB.get_or_init(|| Arc::new(DownloadHub::new())))
}

impl DownloadHub {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bring every asset in the set to a valid on-disk state.
    ///
    /// Completes when each asset satisfies its integrity predicate, or fails
    /// with an aggregate error naming every asset that could not be fixed.
    /// Already-valid assets are never re-downloaded.
    pub fn ensure(
        &self,
        label: &str,
        assets: &[ModelAsset],
        dest: &Path,
        policy: &DownloadPolicy,
    ) -> Result<()> {
        let (flight, leader) = {
            let mut flights = self.flights.lock().expect("download hub mutex poisoned");
            match flights.get(label) {
                Some(flight) => (Arc::clone(flight), false),
                None => {
                    let flight = Arc::new(Flight {
                        outcome: Mutex::new(None),
                        done: Condvar::new(),
                        progress: assets
                            .iter()
                            .map(|asset| Arc::new(AssetProgress::new(asset.name)))
                            .collect(),
                    });
                    flights.insert(label.to_string(), Arc::clone(&flight));
                    (flight, true)
                }
            }
        };

        if !leader {
            log::debug!("joining in-flight download for '{label}'");
            let mut outcome = flight.outcome.lock().expect("flight mutex poisoned");
            while outcome.is_none() {
                outcome = flight
                    .done
                    .wait(outcome)
                    .expect("flight mutex poisoned");
            }
            return outcome.clone().unwrap_or(Ok(()));
        }

        let result = ensure_assets(assets, dest, policy, &flight.progress);
        {
            let mut outcome = flight.outcome.lock().expect("flight mutex poisoned");
            *outcome = Some(result.clone());
        }
        flight.done.notify_all();
        self.flights
            .lock()
            .expect("download hub mutex poisoned")
            .remove(label);
        result
    }

    /// Progress of an active flight, if one is running under this label.
    pub fn progress(&self, label: &str) -> Option<Vec<Arc<AssetProgress>>> {
        self.flights
            .lock()
            .expect("download hub mutex poisoned")
            .get(label)
            .map(|flight| flight.progress.clone())
    }
}

fn ensure_assets(
    assets: &[ModelAsset],
    dest: &Path,
    policy: &DownloadPolicy,
    progress: &[Arc<AssetProgress>],
) -> Result<()> {
    fs::create_dir_all(dest).map_err(|e| EngineError::Asset {
        asset: dest.display().to_string(),
        kind: AssetErrorKind::Disk,
        detail: e.to_string(),
    })?;

    let agent = ureq::AgentBuilder::new()
        .timeout_connect(policy.connect_timeout)
        .timeout(policy.request_timeout)
        .redirects(8)
        .build();

    let mut failures: Vec<AssetFailure> = Vec::new();
    for (asset, progress) in assets.iter().zip(progress) {
        let path = asset.path_in(dest);
        if asset.is_present(dest) {
            if let Ok(meta) = fs::metadata(&path) {
                progress.bytes.store(meta.len(), Ordering::Relaxed);
                progress.total.store(meta.len(), Ordering::Relaxed);
            }
            continue;
        }

        if path.exists() {
            log::warn!(
                "{} fails its integrity check, deleting and re-downloading",
                asset.name
            );
            if let Err(e) = fs::remove_file(&path) {
                failures.push(AssetFailure {
                    asset: asset.name.to_string(),
                    kind: AssetErrorKind::Disk,
                    detail: format!("could not remove corrupt file: {e}"),
                });
                continue;
            }
        }

        if let Err(failure) = download_with_retries(&agent, asset, &path, policy, progress) {
            // Keep going: one failed asset must not cancel its siblings.
            log::warn!("giving up on {}: {failure}", failure.asset);
            failures.push(failure);
        }
    }

    // Final pass: the predicate decides the outcome, not the download path.
    for asset in assets {
        if !asset.is_present(dest) && !failures.iter().any(|f| f.asset == asset.name) {
            failures.push(AssetFailure {
                asset: asset.name.to_string(),
                kind: AssetErrorKind::Integrity,
                detail: format!("file below {} byte threshold", asset.min_bytes()),
            });
        }
    }

    if failures.is_empty() {
        Ok(())
    } else {
        Err(EngineError::AssetSet { failures })
    }
}

fn download_with_retries(
    agent: &ureq::Agent,
    asset: &ModelAsset,
    path: &Path,
    policy: &DownloadPolicy,
    progress: &AssetProgress,
) -> std::result::Result<(), AssetFailure> {
    let mut last = AssetFailure {
        asset: asset.name.to_string(),
        kind: AssetErrorKind::Network,
        detail: "no attempt made".to_string(),
    };

    for attempt in 1..=policy.retries {
        if attempt > 1 {
            let backoff = policy.backoff_base * 2_u32.saturating_pow(attempt - 2);
            log::debug!("retrying {} in {backoff:?} (attempt {attempt})", asset.name);
            std::thread::sleep(backoff);
        }

        match download_once(agent, asset, path, progress) {
            Ok(()) => {
                let size = fs::metadata(path).map(|meta| meta.len()).unwrap_or(0);
                if size >= asset.min_bytes() {
                    log::info!("downloaded {} ({size} bytes)", asset.name);
                    return Ok(());
                }
                let _ = fs::remove_file(path);
                last = AssetFailure {
                    asset: asset.name.to_string(),
                    kind: AssetErrorKind::Integrity,
                    detail: format!("{size} bytes < {} required", asset.min_bytes()),
                };
            }
            Err(failure) => last = failure,
        }
    }

    Err(last)
}

fn download_once(
    agent: &ureq::Agent,
    asset: &ModelAsset,
    path: &Path,
    progress: &AssetProgress,
) -> std::result::Result<(), AssetFailure> {
    let fail = |kind: AssetErrorKind, detail: String| AssetFailure {
        asset: asset.name.to_string(),
        kind,
        detail,
    };

    let response = agent.get(&asset.url).call().map_err(|e| match e {
        ureq::Error::Status(code, _) => {
            fail(AssetErrorKind::Http(code), format!("GET {}", asset.url))
        }
        other => fail(AssetErrorKind::Network, other.to_string()),
    })?;
    if response.status() != 200 {
        return Err(fail(
            AssetErrorKind::Http(response.status()),
            format!("unexpected final status for {}", asset.url),
        ));
    }

    if let Some(total) = response
        .header("Content-Length")
        .and_then(|value| value.parse::<u64>().ok())
    {
        progress.total.store(total, Ordering::Relaxed);
    }
    progress.bytes.store(0, Ordering::Relaxed);

    let partial = partial_path(path);
    let mut file =
        fs::File::create(&partial).map_err(|e| fail(AssetErrorKind::Disk, e.to_string()))?;
    let mut reader = response.into_reader();
    let mut buffer = [0_u8; 64 * 1024];
    loop {
        let read = match reader.read(&mut buffer) {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) => {
                drop(file);
                let _ = fs::remove_file(&partial);
                return Err(fail(AssetErrorKind::Network, e.to_string()));
            }
        };
        if let Err(e) = file.write_all(&buffer[..read]) {
            drop(file);
            let _ = fs::remove_file(&partial);
            return Err(fail(AssetErrorKind::Disk, e.to_string()));
        }
        progress.bytes.fetch_add(read as u64, Ordering::Relaxed);
    }
    file.sync_all()
        .map_err(|e| fail(AssetErrorKind::Disk, e.to_string()))?;
    drop(file);

    fs::rename(&partial, path).map_err(|e| fail(AssetErrorKind::Disk, e.to_string()))
}

/// `<file>.partial` next to the final destination, so the rename is atomic.
fn partial_path(path: &Path) -> PathBuf {
    let mut name = path
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_default();
    name.push(".partial");
    path.with_file_name(name)
}
