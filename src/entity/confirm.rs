/// Terminal outcome of confirmation tracking for one submitted signature.
///
/// `Timeout` and `NotFound` are unresolved states, not failures: the
/// transaction may still land. They direct the user to an explorer and
/// must never be conflated with `Confirmed` or `Failed`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfirmOutcome {
    /// Seen with confirmed or finalized commitment.
    Confirmed { slot: Option<u64> },
    /// Landed on chain carrying an error object. Hard failure, not a retry
    /// candidate. The raw error payload is preserved.
    Failed { error: String },
    /// Observed at least once but never confirmed before the deadline.
    Timeout,
    /// Never observed in history before the deadline; likely dropped at
    /// broadcast. Distinct from merely slow.
    NotFound,
}

/// Progress of background confirmation, published on a watch channel so
/// the UI can render "submitted, confirming" / "confirmed" / "unresolved"
/// as three distinct states.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfirmationState {
    Confirming,
    Done(ConfirmOutcome),
}

impl ConfirmationState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, ConfirmationState::Done(_))
    }
}
