use crate::config::Config;
use std::collections::HashMap;

/// Outcome of destination resolution.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Resolution {
    Permitted {
        destination: String,
        speed_dial_code: Option<String>,
    },
    Denied {
        destination: String,
        reason: String,
    },
}

/// Dialling policy: speed-dial expansion followed by the allow-list.
#[derive(Debug, Clone, Default)]
pub struct DialPlan {
    speed_dial: HashMap<String, String>,
    allowlist: Vec<String>,
}

impl DialPlan {
    pub fn new(speed_dial: HashMap<String, String>, allowlist: Vec<String>) -> Self {
        Self {
            speed_dial,
            allowlist,
        }
    }

    pub fn from_config(config: &Config) -> Self {
        Self::new(config.speed_dial.clone(), config.allowlist.clone())
    }

    /// Exact match against the allow-list. An entry also matches with its
    /// leading `+` stripped, because the dial cannot produce one; the
    /// literal `*` entry permits anything.
    pub fn is_allowed(&self, number: &str) -> bool {
        self.allowlist.iter().any(|entry| {
            entry == "*" || entry == number || entry.trim_start_matches('+') == number
        })
    }

    /// Resolve a dialled buffer: expand an exact speed-dial hit, then hold
    /// the resulting destination against the allow-list.
    pub fn resolve(&self, dialed: &str) -> Resolution {
        let (destination, speed_dial_code) = match self.speed_dial.get(dialed) {
            Some(target) => (target.clone(), Some(dialed.to_string())),
            None => (dialed.to_string(), None),
        };

        if self.is_allowed(&destination) {
            Resolution::Permitted {
                destination,
                speed_dial_code,
            }
        } else {
            Resolution::Denied {
                reason: format!("number {} is not allowed", destination),
                destination,
            }
        }
    }
}
