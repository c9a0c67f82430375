use std::collections::HashMap;

use finch_transfer::{ItemId, TransferEvent};

const UNITS: [&str; 4] = ["Bytes", "Kilobytes", "Megabytes", "Gigabytes"];

/// Human-readable size, right-aligned to eight columns: `"     1.5 Kilobytes"`.
pub fn format_size(bytes: f64) -> String {
    let mut size = bytes;
    let mut unit = UNITS[0];
    for (i, name) in UNITS.iter().enumerate() {
        unit = name;
        if size < 1024.0 || i == UNITS.len() - 1 {
            break;
        }
        size /= 1024.0;
    }
    let fixed = format!("{size:.2}");
    format!("{:>8} {unit}", trim_zeros(&fixed))
}

fn trim_zeros(s: &str) -> &str {
    s.trim_end_matches('0').trim_end_matches('.')
}

/// Renders transfer events for the terminal, one line each.
pub struct Printer {
    json: bool,
    labels: HashMap<ItemId, String>,
}

impl Printer {
    pub fn new(json: bool) -> Self {
        Self {
            json,
            labels: HashMap::new(),
        }
    }

    pub fn label(&mut self, id: ItemId, label: impl Into<String>) {
        self.labels.insert(id, label.into());
    }

    pub fn render(&self, event: &TransferEvent) -> String {
        if self.json {
            // TransferEvent only holds plain data.
            return serde_json::to_string(event).unwrap_or_default();
        }

        let id = event.id();
        let name = self
            .labels
            .get(&id)
            .map_or_else(|| format!("#{id}"), Clone::clone);
        match event {
            TransferEvent::Progress { percent, speed, .. } => {
                let speed = format_size(*speed);
                match percent {
                    Some(p) => format!("{name}: {p:>3}% {}/s", speed.trim_start()),
                    None => format!("{name}: {}/s", speed.trim_start()),
                }
            }
            TransferEvent::Completed { .. } => format!("{name}: done"),
            TransferEvent::Failed {
                cancelled: true, ..
            } => format!("{name}: cancelled"),
            TransferEvent::Failed { reason, .. } => format!("{name}: failed: {reason}"),
        }
    }
}

/// Tally of terminal outcomes.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct Summary {
    pub completed: usize,
    pub failed: usize,
    pub cancelled: usize,
    /// Items that could not be queued at all.
    pub rejected: usize,
}

impl Summary {
    pub fn record(&mut self, event: &TransferEvent) {
        match event {
            TransferEvent::Completed { .. } => self.completed += 1,
            TransferEvent::Failed {
                cancelled: true, ..
            } => self.cancelled += 1,
            TransferEvent::Failed { .. } => self.failed += 1,
            TransferEvent::Progress { .. } => {}
        }
    }

    pub fn succeeded(&self) -> bool {
        self.failed == 0 && self.cancelled == 0 && self.rejected == 0
    }
}

impl std::fmt::Display for Summary {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} completed, {} failed, {} cancelled",
            self.completed,
            self.failed + self.rejected,
            self.cancelled
        )
    }
}
