//! Raw request/response diagnostic trail.
//!
//! Every orchestrated attempt against the backend is mirrored here so a
//! failed sync can be reconstructed after the fact. Strictly best-effort:
//! trail failures are logged at debug and never affect the request path.

use std::path::PathBuf;

use chrono::Utc;
use log::debug;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;

const PREVIEW_LEN: usize = 300;

pub struct Trail {
    path: Option<PathBuf>,
    // Serializes appends so interleaved attempts stay readable.
    lock: Mutex<()>,
}

impl Trail {
    /// `path` empty or `None` disables the trail entirely.
    pub fn new(path: Option<PathBuf>) -> Self {
        Self { path, lock: Mutex::new(()) }
    }

    pub async fn record(&self, tag: &str, endpoint: &str, payload: &str, status: u16, body: &str) {
        let path = match &self.path {
            Some(p) => p.clone(),
            None => return,
        };
        let line = format!(
            "{} | {} | {} | HTTP {} | req: {} | resp: {}\n",
            Utc::now().format("%Y-%m-%dT%H:%M:%S%.3fZ"),
            tag,
            endpoint,
            status,
            preview(payload),
            preview(body),
        );

        let _guard = self.lock.lock().await;
        let result = async {
            let mut file = tokio::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(&path)
                .await?;
            file.write_all(line.as_bytes()).await
        }
        .await;
        if let Err(e) = result {
            debug!("trail append to {} failed: {e}", path.display());
        }
    }
}

fn preview(text: &str) -> String {
    let flat = text.replace(['\r', '\n'], " ");
    if flat.len() <= PREVIEW_LEN {
        flat
    } else {
        let mut cut = PREVIEW_LEN;
        while !flat.is_char_boundary(cut) {
            cut -= 1;
        }
        format!("{}...(truncated)", &flat[..cut])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn preview_truncates_and_flattens() {
        let long = "x".repeat(400);
        let p = preview(&long);
        assert!(p.ends_with("...(truncated)"));
        assert!(p.len() < 400);
        assert_eq!(preview("a\nb\r\nc"), "a b  c");
    }

    #[tokio::test]
    async fn disabled_trail_is_a_noop() {
        let trail = Trail::new(None);
        trail.record("TAG", "Ep.do", "{}", 200, "{}").await;
    }

    #[tokio::test]
    async fn records_are_appended() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("trail.log");
        let trail = Trail::new(Some(path.clone()));
        trail.record("A", "One.do", "{}", 200, "ok").await;
        trail.record("B", "Two.do", "{}", 500, "boom").await;
        let content = std::fs::read_to_string(&path).unwrap();
        assert_eq!(content.lines().count(), 2);
        assert!(content.contains("One.do"));
        assert!(content.contains("HTTP 500"));
    }
}
