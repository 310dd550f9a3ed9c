mod cli;
mod options;
mod shutdown;
mod ui;

use std::io::IsTerminal;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use reqwest::Url;
use tokio::sync::broadcast::error::RecvError;
use tracing_subscriber::EnvFilter;

use clue_claimer_core::settings::{Settings, default_settings_path, load_settings, save_settings};
use clue_claimer_core::{Identity, SessionConfig, TaskType};
use clue_claimer_engine::{HttpQueue, SessionController, SessionEvent, StopReason};

use crate::cli::{Cli, Command, RunArgs};
use crate::options::{merge_run_args, needs_labels, session_config};
use crate::shutdown::{StopSignal, spawn_ctrl_c_handler};
use crate::ui::{Ui, describe_stop, format_claim_line};

const DEFAULT_LOG_FILTER: &str = "clue_claimer=info,clue_claimer_engine=warn";

fn init_tracing() {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_FILTER));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn settings_path(cli: &Cli) -> Option<PathBuf> {
    cli.settings
        .clone()
        .or_else(|| match default_settings_path() {
            Ok(path) => Some(path),
            Err(err) => {
                tracing::warn!(error = %err, "no default settings location");
                None
            }
        })
}

fn read_settings(cli: &Cli, path: Option<&PathBuf>) -> anyhow::Result<Settings> {
    let Some(path) = path else {
        return Ok(Settings::default());
    };
    match load_settings(path)? {
        Some(settings) => {
            tracing::debug!(path = %path.display(), "loaded settings");
            Ok(settings)
        }
        None if cli.settings.is_some() => {
            anyhow::bail!("settings file {} does not exist", path.display())
        }
        None => Ok(Settings::default()),
    }
}

fn build_controller(base_url: Option<&str>) -> anyhow::Result<SessionController> {
    let raw = base_url.unwrap_or(HttpQueue::DEFAULT_BASE_URL);
    let url = Url::parse(raw).with_context(|| format!("invalid base URL {raw:?}"))?;
    let queue = HttpQueue::new(url)?;
    Ok(SessionController::new(Arc::new(queue)))
}

fn identity_from(cli: &Cli, file: &Settings) -> anyhow::Result<Identity> {
    let cookie = cli
        .cookie
        .as_deref()
        .or(file.cookie.as_deref())
        .context("no cookie given (use --cookie or CLAIMER_COOKIE)")?;
    Ok(Identity::new(cookie))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing();

    let path = settings_path(&cli);
    let file = read_settings(&cli, path.as_ref())?;
    let base_url = cli
        .base_url
        .as_ref()
        .map(Url::to_string)
        .or_else(|| file.base_url.clone());

    match &cli.command {
        Command::Whoami { json } => {
            let identity = identity_from(&cli, &file)?;
            let controller = build_controller(base_url.as_deref())?;
            let resp = controller.user_info(&identity).await;
            if *json {
                println!("{}", serde_json::to_string_pretty(&resp)?);
                return Ok(());
            }
            if resp.errno != 0 {
                anyhow::bail!("user info lookup failed ({}): {}", resp.errno, resp.errmsg);
            }
            println!("{}", resp.data.user_name);
            if !resp.data.role_names.is_empty() {
                println!("roles: {}", resp.data.role_names.join(", "));
            }
            Ok(())
        }
        Command::Labels { task_type, json } => {
            let identity = identity_from(&cli, &file)?;
            let task_type = task_type.or(file.task_type).unwrap_or(TaskType::Audit);
            let controller = build_controller(base_url.as_deref())?;
            let resp = controller.task_labels(task_type, &identity).await;
            if *json {
                println!("{}", serde_json::to_string_pretty(&resp)?);
                return Ok(());
            }
            if resp.errno != 0 {
                anyhow::bail!("label lookup failed ({}): {}", resp.errno, resp.errmsg);
            }
            for group in &resp.data.filter {
                println!("{} [{}]", group.name, group.id);
                for option in &group.list {
                    println!("  {:>6}  {}", option.id, option.name);
                }
            }
            Ok(())
        }
        Command::Run(args) => {
            let settings = merge_run_args(cli.cookie.as_deref(), base_url.as_deref(), args, file);
            if args.save {
                let path = path
                    .as_ref()
                    .context("no settings path to save to (use --settings)")?;
                save_settings(path, &settings)?;
                eprintln!("saved settings to {}", path.display());
            }

            let controller = build_controller(settings.base_url.as_deref())?;
            let labels = if needs_labels(&settings) {
                let identity = identity_from(&cli, &settings)?;
                let task_type = settings.task_type.unwrap_or(TaskType::Audit);
                let resp = controller.task_labels(task_type, &identity).await;
                if resp.errno != 0 {
                    anyhow::bail!("label lookup failed ({}): {}", resp.errno, resp.errmsg);
                }
                Some(resp.data)
            } else {
                None
            };
            let cfg = session_config(&settings, labels.as_ref())?;
            run_session(&controller, cfg, args).await
        }
    }
}

async fn run_session(
    controller: &SessionController,
    cfg: SessionConfig,
    args: &RunArgs,
) -> anyhow::Result<()> {
    let progress_enabled = !args.no_progress && std::io::stdout().is_terminal();
    let claim_limit = cfg.claim_limit;

    let startup = format!(
        "clue-claimer {} task={} filters={}/{}/{} limit={} interval={} concurrency={}",
        env!("CARGO_PKG_VERSION"),
        cfg.task_type,
        cfg.filter_ids.step,
        cfg.filter_ids.subject,
        cfg.filter_ids.clue_type,
        claim_limit,
        humantime::format_duration(cfg.poll_interval),
        cfg.concurrency,
    );

    let mut events = controller.subscribe();
    let mut stop_rx = spawn_ctrl_c_handler();
    let mut signals_open = true;
    controller.start(cfg)?;

    let ui = progress_enabled.then(|| Ui::new(claim_limit));
    let report = |msg: &str| match &ui {
        Some(ui) => ui.println(msg),
        None => eprintln!("{msg}"),
    };
    report(&startup);

    let mut ticker = tokio::time::interval(Duration::from_millis(250));
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    let mut immediate_exit = false;
    let mut outcome: Option<(StopReason, u32)> = None;

    loop {
        tokio::select! {
            sig = stop_rx.recv(), if signals_open => {
                match sig {
                    Some(StopSignal::Graceful) => {
                        let msg = "Stop requested, waiting for in-flight claims (press CTRL+C again to exit immediately).";
                        match &ui {
                            Some(ui) => ui.set_stop_message(msg),
                            None => eprintln!("{msg}"),
                        }
                        controller.stop();
                    }
                    Some(StopSignal::Immediate) => {
                        match &ui {
                            Some(ui) => ui.set_stop_message("Stop requested again, exiting immediately."),
                            None => eprintln!("Stop requested again, exiting immediately."),
                        }
                        immediate_exit = true;
                        break;
                    }
                    None => signals_open = false,
                }
            }
            _ = ticker.tick(), if ui.is_some() => {
                if let Some(ui) = &ui {
                    ui.tick(&controller.status());
                }
            }
            evt = events.recv() => {
                let evt = match evt {
                    Ok(v) => v,
                    Err(RecvError::Lagged(skipped)) => {
                        tracing::debug!(skipped, "event stream lagged");
                        continue;
                    }
                    Err(RecvError::Closed) => break,
                };

                match evt {
                    SessionEvent::Started { .. } | SessionEvent::StopRequested => {}
                    SessionEvent::PageFetched { cycle, page, items, matched } => {
                        tracing::debug!(cycle, page, items, matched, "page fetched");
                        if let Some(ui) = &ui {
                            ui.set_status(format!(
                                "Cycle {cycle}, page {page}: {matched}/{items} matching"
                            ));
                        }
                    }
                    SessionEvent::PollFailed { message } => report(&message),
                    SessionEvent::ClaimFinished { outcome, successful_claims } => {
                        if let Some(ui) = &ui {
                            ui.set_claims(successful_claims);
                        }
                        report(&format_claim_line(&outcome, successful_claims, claim_limit));
                    }
                    SessionEvent::LimitReached => {
                        if let Some(ui) = &ui {
                            ui.set_stop_message("Claim limit reached, finishing up.");
                        }
                    }
                    SessionEvent::Stopped { reason, successful_claims } => {
                        outcome = Some((reason, successful_claims));
                        break;
                    }
                }
            }
        }
    }

    if let Some(ui) = &ui {
        ui.freeze();
    }
    if immediate_exit {
        std::process::exit(130);
    }

    let (reason, successful) = match outcome {
        Some(v) => v,
        None => {
            controller.wait_idle().await;
            let status = controller.status();
            (StopReason::Requested, status.successful_claims)
        }
    };
    println!("{}", describe_stop(&reason, successful));
    if let StopReason::Fatal { message } = reason {
        anyhow::bail!("session failed: {message}");
    }
    Ok(())
}
