use crate::protocol::{DEFAULT_REGION_SIZE, MIN_REGION_SIZE};
use crate::wait::{Backoff, CancelToken, Poller};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::time::Duration;

#[derive(Parser, Debug)]
#[command(name = "shmcp")]
#[command(about = "Copy a file to another process through shared memory", long_about = None)]
#[command(version)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Channel size in bytes: 1 flags byte plus the payload area (both peers must agree)
    #[arg(long, global = true, default_value_t = DEFAULT_REGION_SIZE, value_parser = parse_region_size)]
    pub size: usize,

    /// Discriminator mixed into the channel key (both peers must agree)
    #[arg(long, global = true, default_value_t = 1, value_parser = clap::value_parser!(u8).range(1..))]
    pub proj_id: u8,

    /// Sleep between two looks at the flags, e.g. "1s" or "20ms"
    #[arg(long, global = true, default_value = "1s", value_parser = humantime::parse_duration)]
    pub poll_interval: Duration,

    /// Double the poll interval after every miss, up to this value
    #[arg(long, global = true, value_parser = humantime::parse_duration)]
    pub max_poll_interval: Option<Duration>,

    /// Give up when the peer makes no progress for this long (default: wait forever)
    #[arg(long, global = true, value_parser = humantime::parse_duration)]
    pub timeout: Option<Duration>,

    /// Disable the progress bar
    #[arg(long, global = true)]
    pub no_progress: bool,

    /// Print summaries as JSON
    #[arg(long, global = true)]
    pub json: bool,

    /// Verbose output
    #[arg(long, short = 'v', global = true)]
    pub verbose: bool,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Send a file; its path also names the channel
    Send {
        /// File to send
        path: PathBuf,
    },

    /// Receive a file from a waiting or future sender
    Receive {
        /// Path the sender was given (only used to find the channel)
        key_path: PathBuf,

        /// Output path (or write to stdout if omitted)
        #[arg(long, short = 'o')]
        output: Option<PathBuf>,
    },

    /// Show the flags of an existing channel
    Status {
        /// Path the channel was derived from
        key_path: PathBuf,
    },

    /// Remove a channel left behind by a dead peer
    Remove {
        /// Path the channel was derived from
        key_path: PathBuf,
    },
}

impl Cli {
    pub fn try_parse_args() -> Result<Self, clap::Error> {
        Self::try_parse()
    }

    /// Wait policy from the polling options.
    pub fn poller(&self, cancel: CancelToken) -> Poller {
        let backoff = match self.max_poll_interval {
            Some(max) if max > self.poll_interval => Backoff::Exponential { max },
            _ => Backoff::Fixed,
        };
        Poller::new(self.poll_interval)
            .with_backoff(backoff)
            .with_timeout(self.timeout)
            .with_cancel(cancel)
    }
}

fn parse_region_size(s: &str) -> Result<usize, String> {
    let size: usize = s.parse().map_err(|e| format!("{e}"))?;
    if size < MIN_REGION_SIZE {
        return Err(format!("must be at least {MIN_REGION_SIZE} bytes"));
    }
    Ok(size)
}
