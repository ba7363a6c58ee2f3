use serde::Serialize;
use tracing::warn;

/// Prefix that turns an exclusion entry into a whole-category opt-out.
pub const CATEGORY_PREFIX: &str = "category:";

#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
pub struct Feature {
    pub id: &'static str,
    pub category: &'static str,
    pub description: &'static str,
}

pub const FEATURES: &[Feature] = &[
    Feature {
        id: "scheduled-backups",
        category: "automation",
        description: "Nightly database and volume backup job",
    },
    Feature {
        id: "update-notifier",
        category: "automation",
        description: "Weekly check for newer container images",
    },
    Feature {
        id: "health-monitor",
        category: "automation",
        description: "Periodic health probe that restarts unhealthy services",
    },
    Feature {
        id: "log-rotation",
        category: "maintenance",
        description: "Rotation policy for the shared log directory",
    },
    Feature {
        id: "metrics-exporter",
        category: "monitoring",
        description: "Prometheus exporter container and scrape config",
    },
    Feature {
        id: "sample-content",
        category: "content",
        description: "Seed data for a first look at the application",
    },
];

pub fn find_feature(id: &str) -> Option<&'static Feature> {
    FEATURES.iter().find(|f| f.id == id)
}

pub fn category_of(id: &str) -> Option<&'static str> {
    find_feature(id).map(|f| f.category)
}

/// All categories, sorted and deduplicated.
pub fn categories() -> Vec<&'static str> {
    let mut cats: Vec<&'static str> = FEATURES.iter().map(|f| f.category).collect();
    cats.sort_unstable();
    cats.dedup();
    cats
}

/// True if `feature_id` is listed literally or its category is listed as
/// `category:<name>`. Unknown feature ids are never excluded by category.
pub fn is_excluded(feature_id: &str, exclude: &[String]) -> bool {
    let category = category_of(feature_id);
    exclude.iter().map(|e| e.trim()).any(|entry| {
        entry == feature_id
            || entry
                .strip_prefix(CATEGORY_PREFIX)
                .is_some_and(|cat| Some(cat) == category)
    })
}

/// An exclusion entry that does not name any registered feature or category.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnknownExclusion {
    pub entry: String,
    pub suggestion: Option<String>,
}

impl std::fmt::Display for UnknownExclusion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.suggestion {
            Some(ref s) => write!(f, "'{}' (did you mean '{s}'?)", self.entry),
            None => write!(f, "'{}'", self.entry),
        }
    }
}

/// The operator's opt-out list, as loaded from config.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExclusionList {
    entries: Vec<String>,
}

impl ExclusionList {
    pub fn new(entries: &[String]) -> Self {
        Self {
            entries: entries.iter().map(|e| e.trim().to_owned()).collect(),
        }
    }

    pub fn entries(&self) -> &[String] {
        &self.entries
    }

    pub fn is_excluded(&self, feature_id: &str) -> bool {
        is_excluded(feature_id, &self.entries)
    }

    pub fn unknown_entries(&self) -> Vec<UnknownExclusion> {
        let cats = categories();
        self.entries
            .iter()
            .filter(|entry| match entry.strip_prefix(CATEGORY_PREFIX) {
                Some(cat) => !cats.contains(&cat),
                None => find_feature(entry).is_none(),
            })
            .map(|entry| UnknownExclusion {
                entry: entry.clone(),
                suggestion: suggest(entry, &cats),
            })
            .collect()
    }

    /// Log a warning for each entry that matches nothing. A typo must never
    /// abort provisioning, so this only reports.
    pub fn warn_unknown(&self) -> usize {
        let unknown = self.unknown_entries();
        for u in &unknown {
            warn!("exclude_features entry {u} matches no known feature or category; ignoring");
        }
        unknown.len()
    }
}

fn suggest(entry: &str, cats: &[&'static str]) -> Option<String> {
    if let Some(cat) = entry.strip_prefix(CATEGORY_PREFIX) {
        return closest(cat, cats.iter().copied()).map(|c| format!("{CATEGORY_PREFIX}{c}"));
    }
    if cats.contains(&entry) {
        return Some(format!("{CATEGORY_PREFIX}{entry}"));
    }
    closest(entry, FEATURES.iter().map(|f| f.id)).map(str::to_owned)
}

fn closest<'a>(needle: &str, candidates: impl Iterator<Item = &'a str>) -> Option<&'a str> {
    candidates
        .map(|c| (common_prefix_len(needle, c), c))
        .filter(|(n, _)| *n >= 4)
        .max_by_key(|(n, _)| *n)
        .map(|(_, c)| c)
}

fn common_prefix_len(a: &str, b: &str) -> usize {
    a.bytes().zip(b.bytes()).take_while(|(x, y)| x == y).count()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn list(entries: &[&str]) -> Vec<String> {
        entries.iter().map(|e| (*e).to_owned()).collect()
    }

    #[test]
    fn feature_ids_are_unique() {
        let mut ids: Vec<&str> = FEATURES.iter().map(|f| f.id).collect();
        ids.sort_unstable();
        ids.dedup();
        assert_eq!(ids.len(), FEATURES.len());
    }

    #[test]
    fn literal_id_excludes_only_that_feature() {
        let exclude = list(&["update-notifier"]);
        assert!(is_excluded("update-notifier", &exclude));
        assert!(!is_excluded("scheduled-backups", &exclude));
        assert!(!is_excluded("metrics-exporter", &exclude));
    }

    #[test]
    fn category_excludes_every_member_and_nothing_else() {
        let exclude = list(&["category:automation"]);
        for f in FEATURES {
            assert_eq!(
                is_excluded(f.id, &exclude),
                f.category == "automation",
                "feature {}",
                f.id
            );
        }
    }

    #[test]
    fn empty_list_excludes_nothing() {
        for f in FEATURES {
            assert!(!is_excluded(f.id, &[]));
        }
    }

    #[test]
    fn whitespace_around_entries_is_ignored() {
        let exclude = list(&["  category:monitoring "]);
        assert!(is_excluded("metrics-exporter", &exclude));
    }

    #[test]
    fn category_lookup() {
        assert_eq!(category_of("log-rotation"), Some("maintenance"));
        assert_eq!(category_of("nope"), None);
        assert!(categories().contains(&"automation"));
    }

    #[test]
    fn unknown_entries_are_reported_not_fatal() {
        let ex = ExclusionList::new(&list(&[
            "metrics-exporter",
            "metrics-exporters",
            "category:automaton",
            "category:content",
            "automation",
        ]));
        let unknown = ex.unknown_entries();
        let names: Vec<&str> = unknown.iter().map(|u| u.entry.as_str()).collect();
        assert_eq!(
            names,
            vec!["metrics-exporters", "category:automaton", "automation"]
        );
        assert_eq!(unknown[0].suggestion.as_deref(), Some("metrics-exporter"));
        assert_eq!(
            unknown[1].suggestion.as_deref(),
            Some("category:automation")
        );
        assert_eq!(
            unknown[2].suggestion.as_deref(),
            Some("category:automation")
        );
        assert_eq!(ex.warn_unknown(), 3);
        assert!(ex.is_excluded("metrics-exporter"));
        assert!(ex.is_excluded("sample-content"));
    }

    #[test]
    fn unknown_display_includes_suggestion() {
        let u = UnknownExclusion {
            entry: "log-rotate".to_owned(),
            suggestion: Some("log-rotation".to_owned()),
        };
        assert!(u.to_string().contains("did you mean 'log-rotation'"));
    }
}
