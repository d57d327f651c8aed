use std::path::PathBuf;
use std::time::Duration;

use clap::{Args, Parser, Subcommand};

use crate::logging::{LogConfig, LogLevel};

#[derive(Parser, Debug)]
#[command(
    name = "callroom",
    about = "Peer-to-peer video calls negotiated through a shared signaling store",
    version
)]
pub struct Cli {
    #[command(flatten)]
    pub logging: LoggingArgs,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Args, Debug, Clone)]
pub struct LoggingArgs {
    #[arg(
        long = "log-level",
        value_enum,
        global = true,
        env = "CALLROOM_LOG_LEVEL",
        default_value_t = LogLevel::Warn,
        help = "Minimum log level (error, warn, info, debug, trace)"
    )]
    pub level: LogLevel,

    #[arg(
        long = "log-file",
        value_name = "PATH",
        global = true,
        env = "CALLROOM_LOG_FILE",
        help = "Write structured logs to the specified file"
    )]
    pub file: Option<PathBuf>,
}

impl LoggingArgs {
    pub fn to_config(&self) -> LogConfig {
        LogConfig {
            level: self.level,
            file: self.file.clone(),
        }
    }
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Run a requester and an interpreter against an in-process store and connect them
    Loopback(LoopbackArgs),
}

#[derive(Args, Debug, Clone)]
pub struct LoopbackArgs {
    #[arg(long, default_value = "appt-loopback", help = "Appointment the call belongs to")]
    pub session: String,

    #[arg(long, default_value = "requester", help = "Participant who booked the call")]
    pub requester: String,

    #[arg(long, default_value = "interpreter", help = "Participant answering the call")]
    pub interpreter: String,

    #[arg(
        long = "join-delay-ms",
        default_value_t = 2000,
        help = "How long the interpreter waits before joining"
    )]
    pub join_delay_ms: u64,

    #[arg(
        long = "duration-secs",
        default_value_t = 5,
        help = "How long to stay connected before hanging up"
    )]
    pub duration_secs: u64,

    #[arg(long, help = "Join without a camera")]
    pub audio_only: bool,

    #[arg(long, help = "Share a synthetic screen while connected")]
    pub screen_share: bool,
}

impl LoopbackArgs {
    pub fn join_delay(&self) -> Duration {
        Duration::from_millis(self.join_delay_ms)
    }

    pub fn duration(&self) -> Duration {
        Duration::from_secs(self.duration_secs)
    }
}
