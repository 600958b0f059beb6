use chrono::{DateTime, Utc};

use crate::packet::Packet;

/// Time-window filter applied when fetching packets back out of a store.
///
/// Bounds are inclusive; `max_count > 0` keeps only the newest N packets by
/// capture time after the window filter.
#[derive(Debug, Clone, Default)]
pub struct FindQuery {
    pub from: Option<DateTime<Utc>>,
    pub to: Option<DateTime<Utc>>,
    pub max_count: usize,
}

impl FindQuery {
    pub fn matches(&self, pkt: &Packet) -> bool {
        if let Some(from) = self.from {
            if pkt.timestamp < from {
                return false;
            }
        }
        if let Some(to) = self.to {
            if pkt.timestamp > to {
                return false;
            }
        }
        true
    }

    /// Apply the `max_count` truncation: newest first, stable on ties.
    pub fn truncate(&self, mut pkts: Vec<Packet>) -> Vec<Packet> {
        if self.max_count > 0 && pkts.len() > self.max_count {
            pkts.sort_by(|a, b| b.timestamp.cmp(&a.timestamp));
            pkts.truncate(self.max_count);
        }
        pkts
    }
}
