use std::io::Write;

use indicatif::{MultiProgress, ProgressBar, ProgressDrawTarget, ProgressStyle};

use clue_claimer_engine::{ClaimOutcome, StatusSnapshot, StopReason};

fn style(template: &str) -> ProgressStyle {
    ProgressStyle::with_template(template).unwrap_or_else(|_| ProgressStyle::default_bar())
}

/// Terminal view of a running session: a claims-vs-limit bar plus a status
/// line and a stop line.
pub(crate) struct Ui {
    mp: MultiProgress,
    claims_pb: ProgressBar,
    status_pb: ProgressBar,
    stop_pb: ProgressBar,
}

impl Ui {
    pub(crate) fn new(claim_limit: u32) -> Self {
        let mp = MultiProgress::new();
        mp.set_draw_target(ProgressDrawTarget::stdout());
        mp.set_move_cursor(true);

        let claims_pb = mp.add(ProgressBar::new(u64::from(claim_limit)));
        claims_pb.set_style(
            style("{prefix} {bar:30.green/blue} {pos}/{len} {msg}\u{1b}[0K").progress_chars("#--"),
        );
        claims_pb.set_prefix("Claimed");

        let status_pb = mp.add(ProgressBar::new(0));
        status_pb.set_style(style("{msg}\u{1b}[0K"));
        status_pb.set_message("Polling...");

        let stop_pb = mp.add(ProgressBar::new(0));
        stop_pb.set_style(style("{msg}\u{1b}[0K"));
        stop_pb.set_message(" ");

        Self {
            mp,
            claims_pb,
            status_pb,
            stop_pb,
        }
    }

    pub(crate) fn println(&self, msg: &str) {
        let _ = self.mp.println(msg);
    }

    pub(crate) fn set_claims(&self, successful: u32) {
        self.claims_pb.set_position(u64::from(successful));
    }

    pub(crate) fn set_status(&self, msg: String) {
        self.status_pb.set_message(msg);
    }

    pub(crate) fn set_stop_message(&self, msg: &str) {
        self.stop_pb.set_message(msg.to_string());
    }

    pub(crate) fn tick(&self, status: &StatusSnapshot) {
        self.claims_pb.set_position(u64::from(status.successful_claims));
        self.claims_pb
            .set_message(format!("({} in flight)", status.in_flight));
    }

    pub(crate) fn freeze(&self) {
        self.mp.set_move_cursor(false);
        self.claims_pb.abandon();
        self.status_pb.abandon();
        self.stop_pb.abandon();
        let _ = std::io::stdout().write_all(b"\n");
    }
}

pub(crate) fn format_claim_line(outcome: &ClaimOutcome, successful: u32, limit: u32) -> String {
    if outcome.success {
        format!("claimed item {} ({successful}/{limit})", outcome.item_id)
    } else {
        let err = outcome.error.as_deref().unwrap_or("unknown error");
        format!("item {} not claimed: {err}", outcome.item_id)
    }
}

pub(crate) fn describe_stop(reason: &StopReason, successful: u32) -> String {
    match reason {
        StopReason::Requested => format!("Stopped on request after {successful} claim(s)."),
        StopReason::LimitReached => format!("Claim limit reached: {successful} claim(s)."),
        StopReason::Fatal { message } => {
            format!("Stopped after {successful} claim(s): {message}")
        }
    }
}
