/// Server-assigned identity for one connection lifetime.
///
/// Owned exclusively by the gateway connection; only the frame-handling
/// loop mutates it. `last_sequence` is updated before a DISPATCH payload
/// reaches the sequencer so that resume bookkeeping survives a backlogged
/// consumer.
#[derive(Debug, Default, Clone)]
pub struct Session {
    pub session_id: Option<String>,
    pub last_sequence: Option<u64>,
    pub resumable: bool,
}

impl Session {
    /// Called when a READY dispatch carries a fresh session id.
    pub fn establish(&mut self, session_id: String) {
        self.session_id = Some(session_id);
        self.resumable = true;
    }

    /// Called on INVALID_SESSION: the next connect must re-identify.
    pub fn invalidate(&mut self) {
        self.session_id = None;
        self.last_sequence = None;
        self.resumable = false;
    }

    pub fn observe_sequence(&mut self, sequence: u64) {
        self.last_sequence = Some(sequence);
    }

    /// Resume parameters, present only when a resumable session exists.
    pub fn resume_state(&self) -> Option<(String, u64)> {
        if !self.resumable {
            return None;
        }
        let session_id = self.session_id.clone()?;
        Some((session_id, self.last_sequence.unwrap_or(0)))
    }
}
