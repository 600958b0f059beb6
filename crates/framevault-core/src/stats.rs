use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;

#[derive(Debug, Default)]
struct Source {
    last_packet: Option<DateTime<Utc>>,
    packets: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct SourceSnapshot {
    pub last_packet: Option<DateTime<Utc>>,
    pub packets: u64,
}

/// Per-agent ingest counters.
///
/// The outer mutex only guards insertion into the sources map; updates take
/// the per-source mutex. Snapshots copy the values without holding the map
/// lock across reads, so `/stats` may observe slightly stale counters.
#[derive(Debug, Default)]
pub struct Stats {
    sources: Mutex<HashMap<String, Arc<Mutex<Source>>>>,
}

impl Stats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, agent: &str, last_packet: DateTime<Utc>, count: u64) {
        let source = {
            let mut sources = self.sources.lock();
            sources
                .entry(agent.to_owned())
                .or_insert_with(|| Arc::new(Mutex::new(Source::default())))
                .clone()
        };

        let mut source = source.lock();
        source.last_packet = Some(last_packet);
        source.packets += count;
    }

    pub fn snapshot(&self) -> HashMap<String, SourceSnapshot> {
        let entries: Vec<(String, Arc<Mutex<Source>>)> = {
            let sources = self.sources.lock();
            sources
                .iter()
                .map(|(name, src)| (name.clone(), src.clone()))
                .collect()
        };

        entries
            .into_iter()
            .map(|(name, src)| {
                let src = src.lock();
                (
                    name,
                    SourceSnapshot {
                        last_packet: src.last_packet,
                        packets: src.packets,
                    },
                )
            })
            .collect()
    }
}
