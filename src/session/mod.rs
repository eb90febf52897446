pub mod fast_session;

pub use fast_session::{
    DelegatedFastSession, SessionPhase, SessionStatus, EXPIRY_TICK_MS, SESSION_SOFT_TTL_SECS,
};
