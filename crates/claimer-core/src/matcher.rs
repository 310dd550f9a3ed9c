use crate::config::SessionConfig;
use crate::model::{Clue, TimeWindow};

/// Normalized filter criteria derived from a [`SessionConfig`].
///
/// Keywords are stored lowercased with blanks removed so that matching does
/// not reallocate them for every item.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ClueFilter {
    include: Vec<String>,
    exclude: Vec<String>,
    window: Option<TimeWindow>,
}

fn normalize_keywords(keywords: &[String]) -> Vec<String> {
    keywords
        .iter()
        .map(|k| k.trim().to_lowercase())
        .filter(|k| !k.is_empty())
        .collect()
}

impl ClueFilter {
    pub fn new(include: &[String], exclude: &[String], window: Option<TimeWindow>) -> Self {
        Self {
            include: normalize_keywords(include),
            exclude: normalize_keywords(exclude),
            window: window.filter(|w| !w.is_unbounded()),
        }
    }

    pub fn from_config(cfg: &SessionConfig) -> Self {
        let window = cfg.time_window_applies().then_some(cfg.time_window);
        Self::new(&cfg.include_keywords, &cfg.exclude_keywords, window)
    }

    pub fn has_time_window(&self) -> bool {
        self.window.is_some()
    }
}

/// Decide whether `item` is claimable under `filter`.
pub fn matches(item: &Clue, filter: &ClueFilter) -> bool {
    let text = item.searchable_text().to_lowercase();

    if !filter.include.is_empty() && !filter.include.iter().any(|k| text.contains(k.as_str())) {
        return false;
    }
    if filter.exclude.iter().any(|k| text.contains(k.as_str())) {
        return false;
    }

    match (&filter.window, item.dispatch_time) {
        (None, _) => true,
        (Some(_), None) => false,
        (Some(window), Some(at)) => window.contains(at),
    }
}
