// ─────────────────────────────────────────────────────────────────────────────
// logger.rs — pair-scoped logging.
//
// Every engine component logs through a PairLogger so interleaved output
// from many pairs stays attributable.
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct PairLogger {
    prefix: String,
}

impl PairLogger {
    pub fn new(pair_id: &str) -> Self {
        Self { prefix: format!("[{}]", pair_id) }
    }

    pub fn debug(&self, msg: impl AsRef<str>) {
        log::debug!("{} {}", self.prefix, msg.as_ref());
    }

    pub fn info(&self, msg: impl AsRef<str>) {
        log::info!("{} {}", self.prefix, msg.as_ref());
    }

    pub fn warn(&self, msg: impl AsRef<str>) {
        log::warn!("{} {}", self.prefix, msg.as_ref());
    }

    pub fn error(&self, msg: impl AsRef<str>) {
        log::error!("{} {}", self.prefix, msg.as_ref());
    }
}
