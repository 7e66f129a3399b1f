//! # Sync Cursor
//!
//! Fleet-wide incremental fetch watermark (`lastquerypositiontime`). The value is
//! opaque: it is only ever set to what the provider echoed back, never computed
//! locally, and it never moves backwards except through an explicit reset.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncCursor {
    value: i64,
}

impl SyncCursor {
    /// A cursor at 0, meaning "send me a full snapshot".
    pub fn new() -> Self {
        Self::default()
    }

    pub fn current(&self) -> i64 {
        self.value
    }

    /// True until the first provider-issued value has been stored.
    pub fn is_initial(&self) -> bool {
        self.value == 0
    }

    /// Moves the watermark to a provider-issued value.
    ///
    /// Values lower than the current one are ignored. Returns whether the
    /// cursor moved.
    pub fn advance(&mut self, provider_value: i64) -> bool {
        if provider_value <= self.value {
            if provider_value < self.value {
                tracing::warn!(
                    current = self.value,
                    received = provider_value,
                    "Ignoring cursor that would move backwards"
                );
            }
            return false;
        }
        tracing::debug!(from = self.value, to = provider_value, "Cursor advanced");
        self.value = provider_value;
        true
    }

    /// Back to 0: the next cycle behaves like a first cycle.
    pub fn reset(&mut self) {
        tracing::info!(previous = self.value, "Cursor reset for full resync");
        self.value = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn starts_at_zero_and_only_moves_forward() {
        let mut cursor = SyncCursor::new();
        assert!(cursor.is_initial());
        assert!(cursor.advance(173_000));
        assert!(cursor.advance(174_500));
        assert!(!cursor.advance(174_000));
        assert!(!cursor.advance(174_500));
        assert_eq!(cursor.current(), 174_500);
    }

    #[test]
    fn reset_returns_to_full_snapshot() {
        let mut cursor = SyncCursor::new();
        cursor.advance(99);
        cursor.reset();
        assert_eq!(cursor.current(), 0);
        assert!(cursor.is_initial());
    }
}
