use tokio::sync::mpsc;

/// What a Ctrl-C press asks for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum StopSignal {
    /// Stop polling and let in-flight claims settle.
    Graceful,
    /// Exit without waiting.
    Immediate,
}

fn signal_for_press(presses: u32) -> StopSignal {
    if presses <= 1 {
        StopSignal::Graceful
    } else {
        StopSignal::Immediate
    }
}

/// Forward Ctrl-C presses as [`StopSignal`]s. The channel closes after the
/// second press or when signal registration fails.
pub(crate) fn spawn_ctrl_c_handler() -> mpsc::UnboundedReceiver<StopSignal> {
    let (tx, rx) = mpsc::unbounded_channel();
    tokio::spawn(async move {
        let mut presses = 0u32;
        while tokio::signal::ctrl_c().await.is_ok() {
            presses += 1;
            let signal = signal_for_press(presses);
            if tx.send(signal).is_err() || signal == StopSignal::Immediate {
                return;
            }
        }
    });
    rx
}
