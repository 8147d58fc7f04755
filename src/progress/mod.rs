use crate::session::TransferStats;
use anyhow::Result;
use indicatif::{HumanBytes, ProgressBar, ProgressDrawTarget, ProgressStyle};
use std::time::Duration;

const BAR_TEMPLATE: &str = "{msg} [{bar:40.cyan/blue}] {bytes}/{total_bytes} ({bytes_per_sec}, {eta})";
const SPINNER_TEMPLATE: &str = "{spinner:.green} {msg} {bytes} ({bytes_per_sec})";

/// Progress display on stderr. A known total gets a bar, an unknown one a
/// spinner.
pub fn transfer_bar(label: &str, total: Option<u64>, hidden: bool) -> Result<ProgressBar> {
    let bar = match total {
        Some(len) => ProgressBar::new(len).with_style(
            ProgressStyle::with_template(BAR_TEMPLATE)?.progress_chars("=> "),
        ),
        None => ProgressBar::new_spinner().with_style(ProgressStyle::with_template(SPINNER_TEMPLATE)?),
    };
    if hidden {
        bar.set_draw_target(ProgressDrawTarget::hidden());
    } else {
        bar.enable_steady_tick(Duration::from_millis(120));
    }
    bar.set_message(label.to_string());
    Ok(bar)
}

/// One-line human summary of a finished transfer.
pub fn summary_line(stats: &TransferStats) -> String {
    format!(
        "{} in {} chunks, {:.2}s, {} polls, blake3 {}",
        HumanBytes(stats.bytes),
        stats.chunks,
        stats.elapsed_secs,
        stats.polls,
        stats.digest
    )
}
