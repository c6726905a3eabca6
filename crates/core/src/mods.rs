//! Mod inventory and the parallel-halves uploader.
//!
//! Mirrors the reference's `mods_list` scan in `core.main()` and the
//! `Client._sync_resources` / `Client._split_load` sync sub-loop: a client
//! asks for a mod by path, the server streams it over two sockets at once
//! (the primary reliable connection and a second "download" connection the
//! client opens separately), optionally throttled and optionally
//! serialized behind a process-wide queue flag.

use std::fs::File;
use std::io::{Read, Seek, SeekFrom, Write};
use std::net::TcpStream;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use crate::error::{RelayError, Result};

/// One chunk, matching the reference's `min(MB, remaining)` read size.
const CHUNK_SIZE: usize = 1024 * 1024;

/// Drain timeout per chunk write; a peer that can't keep up with even one
/// megabyte every two minutes is treated as gone.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(120);

/// Seconds to wait for the client's secondary download socket to attach
/// before giving up, polled in 100ms steps (so ~5s total).
pub const DOWNLOAD_SOCKET_WAIT_STEPS: u32 = 50;
pub const DOWNLOAD_SOCKET_POLL_INTERVAL: Duration = Duration::from_millis(100);

#[derive(Debug, Clone)]
pub struct ModEntry {
    pub path: String,
    pub size: u64,
}

/// Read-only catalog of `.zip` archives under the mods directory, scanned
/// once at server start. `lock_upload` is the process-wide serialization
/// flag used when the operator configured `use_queue`.
pub struct ModInventory {
    dir: PathBuf,
    mods: Vec<ModEntry>,
    total_size: u64,
    lock_upload: AtomicBool,
}

impl ModInventory {
    /// Scan `dir` for `.zip` files. A missing directory is treated as an
    /// empty inventory rather than an error — a fresh install has no mods
    /// yet, matching the reference's `os.mkdir` fallback.
    pub fn scan(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        let mut mods = Vec::new();
        let mut total_size = 0u64;

        if dir.is_dir() {
            for entry in std::fs::read_dir(&dir)? {
                let entry = entry?;
                let path = entry.path();
                if path.extension().and_then(|e| e.to_str()) != Some("zip") {
                    continue;
                }
                if !path.is_file() {
                    continue;
                }
                let size = entry.metadata()?.len();
                let rel = path.to_string_lossy().replace('\\', "/");
                total_size += size;
                mods.push(ModEntry { path: rel, size });
            }
        }

        tracing::info!(count = mods.len(), total_size, "mods loaded");
        Ok(Self {
            dir,
            mods,
            total_size,
            lock_upload: AtomicBool::new(false),
        })
    }

    pub fn total_size(&self) -> u64 {
        self.total_size
    }

    pub fn mods(&self) -> &[ModEntry] {
        &self.mods
    }

    pub fn find(&self, path: &str) -> Option<&ModEntry> {
        self.mods.iter().find(|m| m.path == path)
    }

    /// Reply body for the `SR` sub-message: all paths then all sizes, each
    /// `;`-terminated, or `-` when the inventory is empty.
    pub fn list_reply(&self) -> String {
        if self.mods.is_empty() {
            return "-".to_string();
        }
        let mut out = String::new();
        for m in &self.mods {
            out.push_str(&m.path);
            out.push(';');
        }
        for m in &self.mods {
            out.push_str(&m.size.to_string());
            out.push(';');
        }
        out
    }

    /// `/<basename>;` concatenation for the heartbeat's `modlist` field.
    pub fn modlist_tag(&self) -> String {
        self.mods
            .iter()
            .map(|m| {
                let basename = Path::new(&m.path)
                    .file_name()
                    .map(|n| n.to_string_lossy().into_owned())
                    .unwrap_or_else(|| m.path.clone());
                format!("/{basename};")
            })
            .collect()
    }

    /// Acquire the queue lock, busy-polling at 200ms like the reference.
    /// No-op (never blocks) when `use_queue` is false.
    pub fn acquire_queue(&self, use_queue: bool) {
        if !use_queue {
            return;
        }
        while self
            .lock_upload
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            std::thread::sleep(Duration::from_millis(200));
        }
    }

    pub fn release_queue(&self, use_queue: bool) {
        if use_queue {
            self.lock_upload.store(false, Ordering::SeqCst);
        }
    }

    /// Stream `entry` to the client over `primary` (first half) and
    /// `download` (second half) concurrently. `speed_limit_mib` is the
    /// *combined* cap in MiB/s (0 disables it); each half gets half the
    /// budget, matching the reference's `speed / 2` per socket.
    pub fn upload(
        &self,
        entry: &ModEntry,
        primary: &mut TcpStream,
        download: &mut TcpStream,
        speed_limit_mib: u64,
    ) -> Result<u64> {
        let path = self.dir.join(
            Path::new(&entry.path)
                .file_name()
                .unwrap_or_else(|| Path::new(&entry.path).as_os_str()),
        );
        let full_path = if Path::new(&entry.path).is_absolute() || entry.path.contains('/') {
            PathBuf::from(&entry.path)
        } else {
            path
        };

        let half_size = entry.size / 2;
        let per_half_limit = if speed_limit_mib > 0 {
            Some(speed_limit_mib as f64 / 2.0)
        } else {
            None
        };

        let result = std::thread::scope(|scope| {
            let first = &full_path;
            let second = &full_path;
            let h1 = scope.spawn(move || {
                send_half(first, 0, half_size, primary, per_half_limit, "srv")
            });
            let h2 = scope.spawn(move || {
                send_half(second, half_size, entry.size, download, per_half_limit, "dwn")
            });
            (h1.join(), h2.join())
        });

        let (r1, r2) = result;
        let sent_primary = r1.map_err(|_| RelayError::TransferFailed("upload thread panicked".into()))??;
        let sent_download = r2.map_err(|_| RelayError::TransferFailed("upload thread panicked".into()))??;
        let sent = sent_primary + sent_download;
        if sent != entry.size {
            return Err(RelayError::TransferFailed(format!(
                "sent {sent} of {} bytes for {}",
                entry.size, entry.path
            )));
        }
        Ok(sent)
    }
}

fn send_half(
    path: &Path,
    start: u64,
    end: u64,
    writer: &mut TcpStream,
    speed_limit_mib: Option<f64>,
    who: &str,
) -> Result<u64> {
    writer.set_write_timeout(Some(DRAIN_TIMEOUT))?;
    let mut file = File::open(path)?;
    file.seek(SeekFrom::Start(start))?;

    let real_size = end - start;
    let mut total_sent: u64 = 0;
    let start_time = Instant::now();
    let mut buf = vec![0u8; CHUNK_SIZE];

    while total_sent < real_size {
        let want = (real_size - total_sent).min(CHUNK_SIZE as u64) as usize;
        let n = file.read(&mut buf[..want])?;
        if n == 0 {
            break;
        }
        match writer.write_all(&buf[..n]) {
            Ok(()) => {}
            Err(e) if matches!(e.kind(), std::io::ErrorKind::TimedOut | std::io::ErrorKind::WouldBlock) => {
                tracing::debug!(who, "mod chunk drain timed out");
                return Err(RelayError::TransferFailed("ETimeoutError".to_string()));
            }
            Err(e) => {
                tracing::debug!(who, error = %e, "mod chunk write failed");
                return Err(RelayError::TransferFailed("EConnectionError".to_string()));
            }
        }
        total_sent += n as u64;

        if let Some(mib_per_sec) = speed_limit_mib {
            let elapsed = start_time.elapsed().as_secs_f64();
            let expected = total_sent as f64 / (mib_per_sec * 1024.0 * 1024.0);
            if expected > elapsed {
                std::thread::sleep(Duration::from_secs_f64(expected - elapsed));
            }
        }
    }
    tracing::debug!(who, total_sent, "upload half done");
    Ok(total_sent)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write as _;

    #[test]
    fn empty_inventory_reports_dash() {
        let dir = tempdir();
        let inv = ModInventory::scan(&dir).unwrap();
        assert_eq!(inv.list_reply(), "-");
        assert_eq!(inv.total_size(), 0);
    }

    #[test]
    fn scan_picks_up_zip_files_only() {
        let dir = tempdir();
        std::fs::write(dir.join("a.zip"), vec![0u8; 10]).unwrap();
        std::fs::write(dir.join("notes.txt"), b"ignore me").unwrap();
        let inv = ModInventory::scan(&dir).unwrap();
        assert_eq!(inv.mods().len(), 1);
        assert_eq!(inv.total_size(), 10);
        assert!(inv.list_reply().starts_with(&inv.mods()[0].path));
    }

    #[test]
    fn modlist_tag_uses_basename_only() {
        let dir = tempdir();
        std::fs::write(dir.join("map.zip"), vec![0u8; 4]).unwrap();
        let inv = ModInventory::scan(&dir).unwrap();
        assert_eq!(inv.modlist_tag(), "/map.zip;");
    }

    #[test]
    fn queue_lock_round_trips_when_disabled() {
        let dir = tempdir();
        let inv = ModInventory::scan(&dir).unwrap();
        inv.acquire_queue(false);
        inv.release_queue(false);
    }

    fn tempdir() -> PathBuf {
        let mut dir = std::env::temp_dir();
        dir.push(format!("relay-mods-test-{}", rand_suffix()));
        std::fs::create_dir_all(&dir).unwrap();
        dir
    }

    fn rand_suffix() -> u64 {
        use std::time::{SystemTime, UNIX_EPOCH};
        SystemTime::now().duration_since(UNIX_EPOCH).unwrap().as_nanos() as u64
    }

    #[allow(dead_code)]
    fn touch(path: &Path) {
        File::create(path).unwrap().write_all(b"x").unwrap();
    }
}
