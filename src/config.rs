//! Configuration file parser.
//!
//! Parses the same flat `key = value` format used by `koza_sync.conf`.

use std::fs;
use std::path::{Path, PathBuf};

use crate::error::{Result, SyncError};

// Default constants
const TIMEOUT_SECS:    u64 = 20;
const BATCH_SIZE:      usize = 20;
const CREATE_DELAY_MS: u64 = 300;
const BATCH_DELAY_MS:  u64 = 2000;
const SYNC_INTERVAL:   u64 = 3600;

/// Full client configuration.
#[derive(Debug, Clone)]
pub struct Config {
    // ── Koza / Luca backend ───────────────────────────────────────────────────
    /// Base URL of the Koza backend (e.g. `https://koza.example.com/koza`).
    pub koza_base_url: String,
    /// Member / organisation number sent as `orgCode` on login.
    pub koza_member_number: String,
    pub koza_username: String,
    pub koza_password: String,
    /// Bearer-token authentication instead of the cookie session flow.
    pub use_token_auth: bool,
    /// Operator-pasted JSESSIONID value used before any scripted login.
    pub manual_session_cookie: String,
    /// Use an external headless-browser helper to mint the session cookie.
    pub use_headless_auth: bool,
    /// Command invoked by the headless fallback; must print the token on stdout.
    pub headless_helper: String,
    /// Branch applied unconditionally when set.
    pub forced_branch_id: Option<i64>,
    /// Branch preferred when present in the branch list.
    pub default_branch_id: Option<i64>,
    /// Per-request timeout in seconds.
    pub timeout_secs: u64,
    // ── Katana inventory API ──────────────────────────────────────────────────
    pub katana_base_url: String,
    pub katana_api_key: String,
    // ── Sync pacing ───────────────────────────────────────────────────────────
    pub batch_size: usize,
    pub create_delay_ms: u64,
    pub batch_delay_ms: u64,
    /// Seconds between sync runs in daemon mode.
    pub sync_interval: u64,
    // ── Diagnostics / process ─────────────────────────────────────────────────
    /// Raw request/response trail file. Empty disables the trail.
    pub trail_file: String,
    pub pid_file:   PathBuf,
    pub log_syslog: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            koza_base_url:         String::new(),
            koza_member_number:    String::new(),
            koza_username:         String::new(),
            koza_password:         String::new(),
            use_token_auth:        false,
            manual_session_cookie: String::new(),
            use_headless_auth:     false,
            headless_helper:       String::new(),
            forced_branch_id:      None,
            default_branch_id:     None,
            timeout_secs:          TIMEOUT_SECS,
            katana_base_url:       String::new(),
            katana_api_key:        String::new(),
            batch_size:            BATCH_SIZE,
            create_delay_ms:       CREATE_DELAY_MS,
            batch_delay_ms:        BATCH_DELAY_MS,
            sync_interval:         SYNC_INTERVAL,
            trail_file:            String::new(),
            pid_file:              PathBuf::from("/var/run/koza-sync.pid"),
            log_syslog:            true,
        }
    }
}

impl Config {
    /// Whether a usable manual session cookie is configured. Placeholder
    /// values left in shipped config files are treated as unset.
    pub fn manual_cookie(&self) -> Option<&str> {
        let v = self.manual_session_cookie.trim();
        if v.len() > 20 && !v.to_ascii_lowercase().contains("fill_me") {
            Some(v)
        } else {
            None
        }
    }
}

/// Parse `path` as a `koza_sync.conf` key=value configuration file.
pub fn load_config(path: &Path) -> Result<Config> {
    let content = fs::read_to_string(path)
        .map_err(|e| SyncError::Config(format!("cannot read {}: {e}", path.display())))?;
    let mut cfg = Config::default();

    for line in content.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let mut parts = line.splitn(2, '=');
        let key = match parts.next() {
            Some(k) => k.trim().to_ascii_lowercase(),
            None => continue,
        };
        let val = match parts.next() {
            Some(v) => v.trim().to_string(),
            None => continue,
        };
        if val.is_empty() {
            continue;
        }

        match key.as_str() {
            "koza_base_url"         => cfg.koza_base_url         = val,
            "koza_member_number"    => cfg.koza_member_number    = val,
            "koza_username"         => cfg.koza_username         = val,
            "koza_password"         => cfg.koza_password         = val,
            "use_token_auth"        => cfg.use_token_auth        = parse_bool(&val),
            "manual_session_cookie" => cfg.manual_session_cookie = val,
            "use_headless_auth"     => cfg.use_headless_auth     = parse_bool(&val),
            "headless_helper"       => cfg.headless_helper       = val,
            "forced_branch_id"      => cfg.forced_branch_id      = val.parse().ok(),
            "default_branch_id"     => cfg.default_branch_id     = val.parse().ok(),
            "timeout_secs"          => cfg.timeout_secs          = val.parse().unwrap_or(TIMEOUT_SECS),
            "katana_base_url"       => cfg.katana_base_url       = val,
            "katana_api_key"        => cfg.katana_api_key        = val,
            "batch_size"            => cfg.batch_size            = val.parse().unwrap_or(BATCH_SIZE),
            "create_delay_ms"       => cfg.create_delay_ms       = val.parse().unwrap_or(CREATE_DELAY_MS),
            "batch_delay_ms"        => cfg.batch_delay_ms        = val.parse().unwrap_or(BATCH_DELAY_MS),
            "sync_interval"         => cfg.sync_interval         = val.parse().unwrap_or(SYNC_INTERVAL),
            "trail_file"            => cfg.trail_file            = val,
            "pid_file"              => cfg.pid_file              = PathBuf::from(&val),
            "log_syslog"            => cfg.log_syslog            = parse_bool(&val),
            _ => {} // ignore unknown keys
        }
    }

    Ok(cfg)
}

fn parse_bool(val: &str) -> bool {
    val == "true" || val == "1" || val == "yes"
}

/// Validate that required fields are populated.
pub fn validate_config(cfg: &Config) -> Result<()> {
    if cfg.koza_base_url.is_empty() {
        return Err(SyncError::Config("koza_base_url is required".into()));
    }
    if !cfg.use_token_auth
        && cfg.manual_cookie().is_none()
        && !cfg.use_headless_auth
        && (cfg.koza_username.is_empty() || cfg.koza_member_number.is_empty())
    {
        return Err(SyncError::Config(
            "cookie-session mode needs koza_member_number + koza_username \
             (or manual_session_cookie / use_headless_auth)"
                .into(),
        ));
    }
    if cfg.use_headless_auth && cfg.headless_helper.is_empty() {
        return Err(SyncError::Config(
            "use_headless_auth requires headless_helper".into(),
        ));
    }
    if cfg.katana_base_url.is_empty() {
        return Err(SyncError::Config("katana_base_url is required".into()));
    }
    if cfg.batch_size == 0 {
        return Err(SyncError::Config("batch_size must be at least 1".into()));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_conf(content: &str) -> tempfile::NamedTempFile {
        let mut f = tempfile::NamedTempFile::new().unwrap();
        f.write_all(content.as_bytes()).unwrap();
        f
    }

    #[test]
    fn parses_basic_file() {
        let f = write_conf(
            "# comment\n\
             koza_base_url = https://koza.example.com/koza\n\
             koza_member_number = 123456\n\
             koza_username = ws\n\
             koza_password = secret\n\
             katana_base_url = https://api.katanamrp.com/v1\n\
             katana_api_key = key\n\
             forced_branch_id = 42\n\
             batch_size = 5\n\
             log_syslog = no\n",
        );
        let cfg = load_config(f.path()).unwrap();
        assert_eq!(cfg.koza_base_url, "https://koza.example.com/koza");
        assert_eq!(cfg.forced_branch_id, Some(42));
        assert_eq!(cfg.batch_size, 5);
        assert!(!cfg.log_syslog);
        // untouched keys keep defaults
        assert_eq!(cfg.timeout_secs, 20);
        validate_config(&cfg).unwrap();
    }

    #[test]
    fn bad_numeric_falls_back_to_default() {
        let f = write_conf("koza_base_url = http://x\nkoza_member_number = 1\nkoza_username = u\ntimeout_secs = abc\n");
        let cfg = load_config(f.path()).unwrap();
        assert_eq!(cfg.timeout_secs, 20);
    }

    #[test]
    fn missing_base_url_rejected() {
        let cfg = Config::default();
        assert!(validate_config(&cfg).is_err());
    }

    #[test]
    fn placeholder_manual_cookie_is_unset() {
        let mut cfg = Config::default();
        cfg.manual_session_cookie = "FILL_ME_IN_BEFORE_DEPLOYMENT".into();
        assert!(cfg.manual_cookie().is_none());
        cfg.manual_session_cookie = "0123456789ABCDEF0123456789ABCDEF".into();
        assert!(cfg.manual_cookie().is_some());
    }
}
