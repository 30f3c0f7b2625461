//! Command-line surface for the subscriber binary.

use std::path::PathBuf;

use clap::{Args, Parser};

use crate::config::PRIMARY_CONFIG_PATH;
use crate::logging::{LogConfig, LogLevel};

#[derive(Parser, Debug)]
#[command(
    name = "physaci-sub",
    about = "Subscribe this node with the physaCI registrar",
    version
)]
pub struct Cli {
    /// Primary configuration file
    #[arg(
        long,
        env = "PHYSACI_SUB_CONFIG",
        default_value = PRIMARY_CONFIG_PATH,
        value_name = "PATH"
    )]
    pub config: PathBuf,

    #[command(flatten)]
    pub logging: LoggingArgs,
}

#[derive(Args, Debug, Clone)]
pub struct LoggingArgs {
    /// Minimum log level (error, warn, info, debug, trace)
    #[arg(
        long = "log-level",
        value_enum,
        env = "PHYSACI_SUB_LOG_LEVEL",
        default_value_t = LogLevel::Info
    )]
    pub level: LogLevel,

    /// Append logs to this file instead of stderr
    #[arg(long = "log-file", env = "PHYSACI_SUB_LOG_FILE", value_name = "PATH")]
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

pub fn parse() -> Cli {
    Cli::parse()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_point_at_the_system_config() {
        let cli = Cli::try_parse_from(["physaci-sub"]).expect("bare invocation parses");
        assert_eq!(cli.config, PathBuf::from(PRIMARY_CONFIG_PATH));
        assert_eq!(cli.logging.level, LogLevel::Info);
        assert!(cli.logging.file.is_none());
    }

    #[test]
    fn flags_override_defaults() {
        let cli = Cli::try_parse_from([
            "physaci-sub",
            "--config",
            "/tmp/conf.ini",
            "--log-level",
            "debug",
            "--log-file",
            "/tmp/sub.log",
        ])
        .expect("flags parse");
        assert_eq!(cli.config, PathBuf::from("/tmp/conf.ini"));
        assert_eq!(cli.logging.level, LogLevel::Debug);
        assert_eq!(cli.logging.file, Some(PathBuf::from("/tmp/sub.log")));
    }
}
