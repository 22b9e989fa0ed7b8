//! Client for the legacy Koza/Luca accounting backend.
//!
//! The backend is a cookie-session web application with path-style "action"
//! endpoints, inconsistent JSON/HTML responses and no update operations.
//! This module keeps one shared session alive across many transient callers:
//!
//!   - [`session`]   — authentication state machine and branch selection
//!   - [`transport`] — per-request retry/recovery orchestration
//!   - [`classify`]  — pure response classification (HTML, login, branch markers)
//!   - [`client`]    — endpoint wrappers (stock cards, customers, depots)
//!   - [`jar`]       — process-wide cookie jar store shared between instances
//!   - [`trail`]     — raw request/response diagnostic trail

pub mod classify;
pub mod client;
pub mod jar;
pub mod session;
pub mod trail;
pub mod transport;
pub mod types;

/// Action endpoints, relative to the configured base URL.
pub mod endpoints {
    /// Login page / scripted login target.
    pub const LOGIN: &str = "Giris.do";
    /// Token endpoint used in bearer-token mode.
    pub const TOKEN_AUTH: &str = "api/auth/token";
    /// Branches the authenticated user may operate under.
    pub const BRANCHES: &str = "YdlUserResponsibilityOrgSs.do";
    pub const CHANGE_BRANCH: &str = "GuncelleYtkSirketSubeDegistir.do";
    pub const LIST_STOCK_CARDS: &str = "ListeleStkSkart.do";
    pub const CREATE_STOCK_CARD: &str = "EkleStkWsSkart.do";
    pub const LIST_CUSTOMERS: &str = "ListeleFinMusteri.do";
    pub const CREATE_CUSTOMER: &str = "EkleFinMusteriWS.do";
    pub const LIST_DEPOTS: &str = "ListeleStkDepo.do";
    pub const CREATE_DEPOT: &str = "EkleStkWsDepo.do";
}
