use std::time::Duration;

use anyhow::anyhow;
use chrono::NaiveDateTime;

use clue_claimer_core::settings::Settings;
use clue_claimer_core::{FilterIds, Identity, SessionConfig, TaskType, TimeWindow, parse_timestamp};
use clue_claimer_engine::TaskLabels;

use crate::cli::RunArgs;

fn pick_list(flag: &[String], file: Vec<String>) -> Vec<String> {
    if flag.is_empty() { file } else { flag.to_vec() }
}

/// Layer command-line flags (and their env fallbacks) over the settings file.
pub(crate) fn merge_run_args(
    cookie: Option<&str>,
    base_url: Option<&str>,
    args: &RunArgs,
    file: Settings,
) -> Settings {
    Settings {
        base_url: base_url.map(str::to_string).or(file.base_url),
        cookie: cookie.map(str::to_string).or(file.cookie),
        task_type: args.task_type.or(file.task_type),
        step: args.step.clone().or(file.step),
        subject: args.subject.clone().or(file.subject),
        clue_type: args.clue_type.clone().or(file.clue_type),
        claim_limit: args.limit.or(file.claim_limit),
        interval_ms: args
            .interval
            .map(|d| u64::try_from(d.as_millis()).unwrap_or(u64::MAX))
            .or(file.interval_ms),
        max_pages: args.max_pages.or(file.max_pages),
        concurrency: args.concurrency.map(usize::from).or(file.concurrency),
        include_keywords: pick_list(&args.include_keywords, file.include_keywords),
        exclude_keywords: pick_list(&args.exclude_keywords, file.exclude_keywords),
        start_time: args.start_time.clone().or(file.start_time),
        end_time: args.end_time.clone().or(file.end_time),
    }
}

fn is_numeric(selector: Option<&str>) -> bool {
    selector.is_none_or(|s| s.trim().parse::<u32>().is_ok())
}

/// Whether any filter selector is a label name that has to be looked up.
pub(crate) fn needs_labels(settings: &Settings) -> bool {
    !(is_numeric(settings.step.as_deref())
        && is_numeric(settings.subject.as_deref())
        && is_numeric(settings.clue_type.as_deref()))
}

fn resolve_filter(
    labels: Option<&TaskLabels>,
    group: &str,
    selector: Option<&str>,
    default: u32,
) -> anyhow::Result<u32> {
    let Some(selector) = selector.map(str::trim) else {
        return Ok(default);
    };
    if let Ok(id) = selector.parse::<u32>() {
        return Ok(id);
    }
    let labels = labels.ok_or_else(|| anyhow!("{group} label {selector:?} cannot be resolved"))?;
    labels.resolve(group, selector).ok_or_else(|| {
        let known: Vec<&str> = labels
            .group(group)
            .map(|g| g.list.iter().map(|o| o.name.as_str()).collect())
            .unwrap_or_default();
        anyhow!("unknown {group} label {selector:?} (known: {})", known.join(", "))
    })
}

fn parse_bound(raw: Option<&str>, name: &str) -> anyhow::Result<Option<NaiveDateTime>> {
    raw.map(|raw| parse_timestamp(raw).ok_or_else(|| anyhow!("invalid {name} time {raw:?}")))
        .transpose()
}

/// Build the session configuration from merged settings.
///
/// `labels` is only consulted for selectors that are not numeric ids.
pub(crate) fn session_config(
    settings: &Settings,
    labels: Option<&TaskLabels>,
) -> anyhow::Result<SessionConfig> {
    let cookie = settings
        .cookie
        .as_deref()
        .ok_or_else(|| anyhow!("no cookie given (use --cookie or CLAIMER_COOKIE)"))?;
    let task_type = settings.task_type.unwrap_or(TaskType::Audit);

    let mut cfg = SessionConfig::new(task_type, Identity::new(cookie));
    let defaults = FilterIds::default();
    cfg.filter_ids = FilterIds {
        step: resolve_filter(labels, TaskLabels::STEP, settings.step.as_deref(), defaults.step)?,
        subject: resolve_filter(
            labels,
            TaskLabels::SUBJECT,
            settings.subject.as_deref(),
            defaults.subject,
        )?,
        clue_type: resolve_filter(
            labels,
            TaskLabels::CLUE_TYPE,
            settings.clue_type.as_deref(),
            defaults.clue_type,
        )?,
    };
    if let Some(limit) = settings.claim_limit {
        cfg.claim_limit = limit;
    }
    if let Some(ms) = settings.interval_ms {
        cfg.poll_interval = Duration::from_millis(ms);
    }
    if let Some(max_pages) = settings.max_pages {
        cfg.max_pages = max_pages;
    }
    if let Some(concurrency) = settings.concurrency {
        cfg.concurrency = concurrency;
    }
    cfg.include_keywords = settings.include_keywords.clone();
    cfg.exclude_keywords = settings.exclude_keywords.clone();
    cfg.time_window = TimeWindow {
        start: parse_bound(settings.start_time.as_deref(), "start")?,
        end: parse_bound(settings.end_time.as_deref(), "end")?,
    };

    cfg.validate()?;
    Ok(cfg)
}
