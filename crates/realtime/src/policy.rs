use chrono::Duration;

/// Tunables that gate mutation of already-delivered messages and shape
/// notification batching.
#[derive(Debug, Clone)]
pub struct DeliveryPolicy {
    /// How long after creation a message may still be edited.
    pub edit_window: Duration,
    /// How long after creation a message may still be deleted for everyone.
    pub delete_window: Duration,
    /// How long a notification batch waits for further messages before it
    /// flushes.
    pub batch_window: std::time::Duration,
}

impl Default for DeliveryPolicy {
    fn default() -> Self {
        Self {
            edit_window: Duration::minutes(15),
            delete_window: Duration::hours(1),
            batch_window: std::time::Duration::from_secs(2),
        }
    }
}

/// Per-recipient notification preferences.
///
/// Checked when a batch is opened and re-checked at flush, so a preference
/// change while a batch is pending takes effect before anything is emitted.
#[derive(Debug, Clone)]
pub struct NotificationPolicy {
    /// Master switch. When off, nothing is batched or counted.
    pub enabled: bool,
    /// Do-not-disturb: suppress summaries but keep counting unread badges.
    pub dnd: bool,
    /// Whether badge counters still accumulate under DND.
    pub badge_while_dnd: bool,
}

impl Default for NotificationPolicy {
    fn default() -> Self {
        Self {
            enabled: true,
            dnd: false,
            badge_while_dnd: true,
        }
    }
}

impl NotificationPolicy {
    /// A summary may be emitted for this recipient.
    pub fn allows_summary(&self) -> bool {
        self.enabled && !self.dnd
    }

    /// Unread badges may accumulate for this recipient.
    pub fn allows_badge(&self) -> bool {
        self.enabled && (!self.dnd || self.badge_while_dnd)
    }
}
