use std::path::{Path, PathBuf};

use sha2::{Digest, Sha256};

/// Maximum usable `sun_path` length for this platform, including the NUL.
#[cfg(target_os = "macos")]
pub const SOCKADDR_UN_PATH_MAX: usize = 104;
#[cfg(not(target_os = "macos"))]
pub const SOCKADDR_UN_PATH_MAX: usize = 108;

/// Minimum number of hash characters a derived socket name must keep.
/// Below this the collision risk is unacceptable and spawn fails instead.
const MIN_SOCKET_NAME_CHARS: usize = 8;

#[derive(Debug, thiserror::Error)]
pub enum PathError {
    #[error("home directory not found — set $HOME environment variable")]
    HomeNotFound,

    #[error("socket path for session '{session_id}' cannot fit in {limit} bytes (dir: {dir})")]
    SocketPathTooLong {
        session_id: String,
        dir: String,
        limit: usize,
    },
}

/// Centralized path construction for the `~/.attn/` directory layout.
///
/// Single source of truth for every path under the data root. Use `resolve()`
/// in production code and `from_dir()` in tests.
#[derive(Debug, Clone)]
pub struct AttnPaths {
    data_root: PathBuf,
}

impl AttnPaths {
    /// Resolve the data root: `$ATTN_DATA_ROOT` if set, else `~/.attn`.
    pub fn resolve() -> Result<Self, PathError> {
        if let Some(root) = std::env::var_os("ATTN_DATA_ROOT") {
            return Ok(Self {
                data_root: PathBuf::from(root),
            });
        }
        let home = dirs::home_dir().ok_or(PathError::HomeNotFound)?;
        Ok(Self {
            data_root: home.join(".attn"),
        })
    }

    /// Create paths from an explicit base directory. Use in tests.
    pub fn from_dir(data_root: PathBuf) -> Self {
        Self { data_root }
    }

    /// The base data root directory.
    pub fn data_root(&self) -> &Path {
        &self.data_root
    }

    // --- Top-level files ---

    /// Persistent daemon instance identity token.
    pub fn daemon_id_file(&self) -> PathBuf {
        self.data_root.join("daemon-id")
    }

    /// Embedded store database.
    pub fn store_db(&self) -> PathBuf {
        self.data_root.join("attn.db")
    }

    /// Control socket (hook subprocesses and CLI queries).
    pub fn control_socket(&self) -> PathBuf {
        self.data_root.join("attn.sock")
    }

    /// PID lock file, colocated with the control socket.
    pub fn daemon_pid_file(&self) -> PathBuf {
        self.data_root.join("attn.pid")
    }

    pub fn daemon_log_file(&self) -> PathBuf {
        self.data_root.join("daemon.log")
    }

    pub fn user_config(&self) -> PathBuf {
        self.data_root.join("config.toml")
    }

    // --- Worker tree (per daemon instance) ---

    pub fn workers_dir(&self, instance_id: &str) -> PathBuf {
        self.data_root.join("workers").join(instance_id)
    }

    pub fn worker_registry_dir(&self, instance_id: &str) -> PathBuf {
        self.workers_dir(instance_id).join("registry")
    }

    pub fn worker_registry_file(&self, instance_id: &str, session_id: &str) -> PathBuf {
        self.worker_registry_dir(instance_id)
            .join(format!("{session_id}.json"))
    }

    pub fn worker_sock_dir(&self, instance_id: &str) -> PathBuf {
        self.workers_dir(instance_id).join("sock")
    }

    pub fn worker_quarantine_dir(&self, instance_id: &str) -> PathBuf {
        self.workers_dir(instance_id).join("quarantine")
    }

    pub fn worker_log_dir(&self, instance_id: &str) -> PathBuf {
        self.workers_dir(instance_id).join("log")
    }

    pub fn worker_log_file(&self, instance_id: &str, session_id: &str) -> PathBuf {
        self.worker_log_dir(instance_id)
            .join(format!("{session_id}.log"))
    }

    pub fn worker_captures_dir(&self, instance_id: &str) -> PathBuf {
        self.workers_dir(instance_id).join("captures")
    }

    /// Derive the worker socket path for a session.
    ///
    /// The name is a truncated base32 hash of the session id so that UUID
    /// session ids under deep `$HOME` directories stay inside the platform
    /// `sockaddr_un` limit. Fails if fewer than 8 hash characters fit.
    pub fn worker_socket_path(
        &self,
        instance_id: &str,
        session_id: &str,
    ) -> Result<PathBuf, PathError> {
        let dir = self.worker_sock_dir(instance_id);
        let budget = socket_name_budget(&dir)?;
        if budget < MIN_SOCKET_NAME_CHARS {
            return Err(PathError::SocketPathTooLong {
                session_id: session_id.to_string(),
                dir: dir.display().to_string(),
                limit: SOCKADDR_UN_PATH_MAX,
            });
        }
        let full = socket_hash_base32(session_id);
        let name = &full[..full.len().min(budget)];
        Ok(dir.join(format!("{name}.sock")))
    }

    /// Check that an on-disk socket path matches the derivation rule for a
    /// session id, in either the current base32 form or the legacy
    /// `h-<hex>` form. Validation only — never produces paths.
    pub fn socket_path_matches(
        &self,
        instance_id: &str,
        session_id: &str,
        actual: &Path,
    ) -> bool {
        let dir = self.worker_sock_dir(instance_id);
        if actual.parent() != Some(dir.as_path()) {
            return false;
        }
        let Some(stem) = actual.file_name().and_then(|n| n.to_str()) else {
            return false;
        };
        let Some(stem) = stem.strip_suffix(".sock") else {
            return false;
        };
        if let Some(hexpart) = stem.strip_prefix("h-") {
            // Legacy form: `h-<hex>` over the first hash bytes.
            let full = socket_hash_hex(session_id);
            return !hexpart.is_empty()
                && hexpart.len() >= MIN_SOCKET_NAME_CHARS
                && full.starts_with(hexpart);
        }
        let full = socket_hash_base32(session_id);
        stem.len() >= MIN_SOCKET_NAME_CHARS && full.starts_with(stem)
    }
}

/// How many name characters fit for a socket under `dir`, leaving room for
/// the `/`, the `.sock` suffix, and the trailing NUL.
fn socket_name_budget(dir: &Path) -> Result<usize, PathError> {
    let dir_len = dir.as_os_str().len();
    let overhead = dir_len + 1 + ".sock".len() + 1;
    if overhead >= SOCKADDR_UN_PATH_MAX {
        return Ok(0);
    }
    Ok(SOCKADDR_UN_PATH_MAX - overhead)
}

/// Registry entries only admit session ids from a restricted character set.
pub fn is_valid_session_id(session_id: &str) -> bool {
    !session_id.is_empty()
        && session_id.len() <= 128
        && session_id
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || b == b'.' || b == b'_' || b == b'-')
}

fn session_hash(session_id: &str) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(session_id.as_bytes());
    hasher.finalize().into()
}

/// Current socket-name form: lowercase RFC 4648 base32, no padding.
pub fn socket_hash_base32(session_id: &str) -> String {
    base32_lower(&session_hash(session_id))
}

/// Legacy socket-name form: hex of the full hash (names truncate it).
pub fn socket_hash_hex(session_id: &str) -> String {
    hex::encode(session_hash(session_id))
}

const BASE32_ALPHABET: &[u8; 32] = b"abcdefghijklmnopqrstuvwxyz234567";

fn base32_lower(bytes: &[u8]) -> String {
    let mut out = String::with_capacity(bytes.len().div_ceil(5) * 8);
    let mut acc: u32 = 0;
    let mut bits: u32 = 0;
    for &b in bytes {
        acc = (acc << 8) | u32::from(b);
        bits += 8;
        while bits >= 5 {
            bits -= 5;
            out.push(BASE32_ALPHABET[((acc >> bits) & 0x1f) as usize] as char);
        }
    }
    if bits > 0 {
        out.push(BASE32_ALPHABET[((acc << (5 - bits)) & 0x1f) as usize] as char);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_paths() -> AttnPaths {
        AttnPaths::from_dir(PathBuf::from("/home/user/.attn"))
    }

    const INSTANCE: &str = "0f6b1f2e-9c1d-4a7b-8a52-3f1f2d9ab001";

    #[test]
    fn test_resolve_returns_ok_when_home_set() {
        temp_env::with_var_unset("ATTN_DATA_ROOT", || {
            let paths = AttnPaths::resolve().unwrap();
            assert!(paths.data_root().to_string_lossy().contains(".attn"));
        });
    }

    #[test]
    fn test_resolve_honors_env_override() {
        temp_env::with_var("ATTN_DATA_ROOT", Some("/tmp/attn-test-root"), || {
            let paths = AttnPaths::resolve().unwrap();
            assert_eq!(paths.data_root(), Path::new("/tmp/attn-test-root"));
        });
    }

    #[test]
    fn test_top_level_files() {
        let p = test_paths();
        assert_eq!(
            p.daemon_id_file(),
            PathBuf::from("/home/user/.attn/daemon-id")
        );
        assert_eq!(p.store_db(), PathBuf::from("/home/user/.attn/attn.db"));
        assert_eq!(
            p.control_socket(),
            PathBuf::from("/home/user/.attn/attn.sock")
        );
        assert_eq!(
            p.daemon_pid_file(),
            PathBuf::from("/home/user/.attn/attn.pid")
        );
        assert_eq!(
            p.daemon_log_file(),
            PathBuf::from("/home/user/.attn/daemon.log")
        );
        assert_eq!(
            p.user_config(),
            PathBuf::from("/home/user/.attn/config.toml")
        );
    }

    #[test]
    fn test_worker_tree_layout() {
        let p = test_paths();
        assert_eq!(
            p.worker_registry_file(INSTANCE, "s1"),
            PathBuf::from(format!(
                "/home/user/.attn/workers/{INSTANCE}/registry/s1.json"
            ))
        );
        assert_eq!(
            p.worker_quarantine_dir(INSTANCE),
            PathBuf::from(format!("/home/user/.attn/workers/{INSTANCE}/quarantine"))
        );
        assert_eq!(
            p.worker_log_file(INSTANCE, "s1"),
            PathBuf::from(format!("/home/user/.attn/workers/{INSTANCE}/log/s1.log"))
        );
        assert_eq!(
            p.worker_captures_dir(INSTANCE),
            PathBuf::from(format!("/home/user/.attn/workers/{INSTANCE}/captures"))
        );
    }

    #[test]
    fn test_socket_path_fits_platform_limit() {
        let p = test_paths();
        let sock = p
            .worker_socket_path(INSTANCE, "f81d4fae-7dec-11d0-a765-00a0c91e6bf6")
            .unwrap();
        assert!(sock.as_os_str().len() <= SOCKADDR_UN_PATH_MAX - 1);
        assert!(sock.to_string_lossy().ends_with(".sock"));
    }

    #[test]
    fn test_socket_path_deterministic() {
        let p = test_paths();
        let a = p.worker_socket_path(INSTANCE, "session-a").unwrap();
        let b = p.worker_socket_path(INSTANCE, "session-a").unwrap();
        let c = p.worker_socket_path(INSTANCE, "session-b").unwrap();
        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn test_socket_path_deep_home_still_fits() {
        let deep = PathBuf::from(format!("/Users/{}/.attn", "x".repeat(40)));
        let p = AttnPaths::from_dir(deep);
        let sock = p
            .worker_socket_path(INSTANCE, "f81d4fae-7dec-11d0-a765-00a0c91e6bf6")
            .unwrap();
        assert!(sock.as_os_str().len() <= SOCKADDR_UN_PATH_MAX - 1);
    }

    #[test]
    fn test_socket_path_too_long_errors() {
        let absurd = PathBuf::from(format!("/{}", "d/".repeat(70)));
        let p = AttnPaths::from_dir(absurd);
        let err = p.worker_socket_path(INSTANCE, "s1").unwrap_err();
        assert!(matches!(err, PathError::SocketPathTooLong { .. }));
    }

    #[test]
    fn test_socket_path_matches_current_form() {
        let p = test_paths();
        let sock = p.worker_socket_path(INSTANCE, "s1").unwrap();
        assert!(p.socket_path_matches(INSTANCE, "s1", &sock));
        assert!(!p.socket_path_matches(INSTANCE, "s2", &sock));
    }

    #[test]
    fn test_socket_path_matches_legacy_form() {
        let p = test_paths();
        let legacy = p
            .worker_sock_dir(INSTANCE)
            .join(format!("h-{}.sock", &socket_hash_hex("s1")[..16]));
        assert!(p.socket_path_matches(INSTANCE, "s1", &legacy));
        assert!(!p.socket_path_matches(INSTANCE, "s2", &legacy));
    }

    #[test]
    fn test_socket_path_matches_rejects_foreign_dir() {
        let p = test_paths();
        let full = socket_hash_base32("s1");
        let outside = PathBuf::from(format!("/tmp/{}.sock", &full[..16]));
        assert!(!p.socket_path_matches(INSTANCE, "s1", &outside));
    }

    #[test]
    fn test_socket_path_matches_rejects_short_names() {
        // A too-short prefix must not validate even if it matches the hash.
        let p = test_paths();
        let full = socket_hash_base32("s1");
        let short = p.worker_sock_dir(INSTANCE).join(format!("{}.sock", &full[..4]));
        assert!(!p.socket_path_matches(INSTANCE, "s1", &short));
    }

    #[test]
    fn test_session_id_charset() {
        assert!(is_valid_session_id("abc-123_DEF.9"));
        assert!(is_valid_session_id("f81d4fae-7dec-11d0-a765-00a0c91e6bf6"));
        assert!(!is_valid_session_id(""));
        assert!(!is_valid_session_id("has space"));
        assert!(!is_valid_session_id("has/slash"));
        assert!(!is_valid_session_id("has\0nul"));
        assert!(!is_valid_session_id(&"x".repeat(129)));
    }

    #[test]
    fn test_base32_known_vectors() {
        // RFC 4648 test vectors, lowercased, unpadded.
        assert_eq!(base32_lower(b""), "");
        assert_eq!(base32_lower(b"f"), "my");
        assert_eq!(base32_lower(b"fo"), "mzxq");
        assert_eq!(base32_lower(b"foo"), "mzxw6");
        assert_eq!(base32_lower(b"foob"), "mzxw6yq");
        assert_eq!(base32_lower(b"fooba"), "mzxw6ytb");
        assert_eq!(base32_lower(b"foobar"), "mzxw6ytboi");
    }

    #[test]
    fn test_hash_forms_are_stable() {
        let b32 = socket_hash_base32("s1");
        let hx = socket_hash_hex("s1");
        assert_eq!(b32, socket_hash_base32("s1"));
        assert_eq!(hx.len(), 64);
        assert!(b32.chars().all(|c| BASE32_ALPHABET.contains(&(c as u8))));
    }
}
