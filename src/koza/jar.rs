//! Process-wide cookie jar store.
//!
//! Transient client instances share one cookie jar per backend base URL so
//! that a session obtained by any instance is visible to all of them —
//! without that, every new instance would run its own login flow and the
//! backend would see an authentication storm.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use reqwest::cookie::Jar;

/// Keyed store of shared cookie jars. Cheap to clone via `Arc`.
#[derive(Default)]
pub struct CookieJarStore {
    jars: Mutex<HashMap<String, Arc<Jar>>>,
}

impl CookieJarStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Return the jar for `key`, creating it on first use.
    pub fn get_or_create(&self, key: &str) -> Arc<Jar> {
        let mut jars = self.jars.lock().unwrap();
        Arc::clone(jars.entry(key.to_string()).or_default())
    }

    /// Replace the jar for `key` with a fresh, empty one and return it.
    /// Used by the hard session refresh: the old jar may still be referenced
    /// by in-flight clients, but every rebind after the reset sees clean state.
    pub fn reset(&self, key: &str) -> Arc<Jar> {
        let jar = Arc::new(Jar::default());
        let mut jars = self.jars.lock().unwrap();
        jars.insert(key.to_string(), Arc::clone(&jar));
        jar
    }
}

/// Store key for a backend base URL.
pub fn jar_key(base_url: &str) -> String {
    let trimmed = base_url.trim();
    if trimmed.is_empty() {
        "KozaCookieJar:default".to_string()
    } else {
        format!("KozaCookieJar:{trimmed}")
    }
}
