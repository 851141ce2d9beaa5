use fuzzy_matcher::{skim::SkimMatcherV2, FuzzyMatcher};
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::derived::DERIVED_CHANNELS;

/// Suffix the logger uses for on/off status channels
const STATUS_SUFFIX: &str = "_b";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChannelKind {
    RawNumeric,
    RawStatus,
    Derived,
}

impl fmt::Display for ChannelKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ChannelKind::RawNumeric => write!(f, "raw"),
            ChannelKind::RawStatus => write!(f, "status"),
            ChannelKind::Derived => write!(f, "derived"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Channel {
    pub name: String,
    pub kind: ChannelKind,
}

/// The channels of a loaded dataset, in dataset column order.
#[derive(Debug, Clone, Default)]
pub struct ChannelCatalog {
    channels: Vec<Channel>,
}

impl ChannelCatalog {
    /// Classify `names`: derived channels by name, status channels when listed in
    /// `status_channels` or carrying the `_b` suffix, everything else raw numeric.
    pub fn from_names<S: AsRef<str>>(names: &[S], status_channels: &[String]) -> Self {
        let channels = names
            .iter()
            .map(|name| {
                let name = name.as_ref();
                let kind = if DERIVED_CHANNELS.contains(&name) {
                    ChannelKind::Derived
                } else if status_channels.iter().any(|s| s == name) || name.ends_with(STATUS_SUFFIX) {
                    ChannelKind::RawStatus
                } else {
                    ChannelKind::RawNumeric
                };
                Channel {
                    name: name.to_string(),
                    kind,
                }
            })
            .collect();
        Self { channels }
    }

    pub fn len(&self) -> usize {
        self.channels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.channels.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Channel> {
        self.channels.iter()
    }

    pub fn names(&self) -> Vec<String> {
        self.channels.iter().map(|c| c.name.clone()).collect()
    }

    pub fn get(&self, name: &str) -> Option<&Channel> {
        self.channels.iter().find(|c| c.name == name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.get(name).is_some()
    }

    /// The longest channel name occurring anywhere in `text`, with its byte offset.
    /// Ties keep the channel that comes first in catalog order.
    pub fn longest_match(&self, text: &str) -> Option<(usize, &Channel)> {
        let mut best: Option<(usize, &Channel)> = None;
        for channel in &self.channels {
            if channel.name.is_empty() {
                continue;
            }
            if let Some(pos) = text.find(&channel.name) {
                let longer = best.map_or(true, |(_, current)| channel.name.len() > current.name.len());
                if longer {
                    best = Some((pos, channel));
                }
            }
        }
        best
    }

    /// Channel names ranked by fuzzy similarity to `query`, best first.
    pub fn suggest(&self, query: &str, limit: usize) -> Vec<String> {
        let matcher = SkimMatcherV2::default();
        let mut scored: Vec<(i64, &str)> = self
            .channels
            .iter()
            .filter_map(|c| matcher.fuzzy_match(&c.name, query).map(|score| (score, c.name.as_str())))
            .collect();
        scored.sort_by(|a, b| b.0.cmp(&a.0));
        scored.into_iter().take(limit).map(|(_, name)| name.to_string()).collect()
    }

    /// Channels whose name fuzzily matches `filter`; everything when the filter is empty.
    pub fn filter(&self, filter: &str) -> Vec<&Channel> {
        if filter.trim().is_empty() {
            return self.channels.iter().collect();
        }
        let matcher = SkimMatcherV2::default();
        self.channels
            .iter()
            .filter(|c| matcher.fuzzy_match(&c.name, filter).is_some())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn catalog() -> ChannelCatalog {
        ChannelCatalog::from_names(
            &["T", "outside_T", "HP_W", "heat_1_b", "COP", "well_COP"],
            &["heat_1_b".to_string()],
        )
    }

    #[test]
    fn test_classification() {
        let catalog = catalog();
        assert_eq!(catalog.get("outside_T").unwrap().kind, ChannelKind::RawNumeric);
        assert_eq!(catalog.get("heat_1_b").unwrap().kind, ChannelKind::RawStatus);
        assert_eq!(catalog.get("COP").unwrap().kind, ChannelKind::Derived);
        assert_eq!(catalog.len(), 6);
    }

    #[test]
    fn test_status_suffix_without_config() {
        let catalog = ChannelCatalog::from_names(&["zone_3_b"], &[]);
        assert_eq!(catalog.get("zone_3_b").unwrap().kind, ChannelKind::RawStatus);
    }

    #[test]
    fn test_longest_match_prefers_longer_name() {
        let catalog = catalog();
        let (pos, channel) = catalog.longest_match("outside_T").unwrap();
        assert_eq!(channel.name, "outside_T");
        assert_eq!(pos, 0);

        let (pos, channel) = catalog.longest_match("2*well_COP").unwrap();
        assert_eq!(channel.name, "well_COP");
        assert_eq!(pos, 2);
    }

    #[test]
    fn test_longest_match_none() {
        assert!(catalog().longest_match("1000").is_none());
    }

    #[test]
    fn test_suggest() {
        let suggestions = catalog().suggest("outsid", 3);
        assert_eq!(suggestions.first().map(String::as_str), Some("outside_T"));
    }

    #[test]
    fn test_filter() {
        let catalog = catalog();
        assert_eq!(catalog.filter("").len(), 6);
        let names: Vec<&str> = catalog.filter("cop").iter().map(|c| c.name.as_str()).collect();
        assert!(names.contains(&"COP"));
        assert!(names.contains(&"well_COP"));
    }
}
