use std::{fs::File, path::PathBuf};

use anyhow::Error;
use clap::{Parser, ValueEnum};
use log::LevelFilter;
use log4rs::{
    append::console::{ConsoleAppender, Target},
    config::{Appender, Config, Root},
    encode::pattern::PatternEncoder,
};
use race_detection::Flags;
use racegrind::{Runtime, Scenario};

#[derive(ValueEnum, Clone, Copy, Debug)]
enum LogLevel {
    Off,
    Error,
    Warn,
    Info,
    Debug,
    Trace,
}

impl From<LogLevel> for LevelFilter {
    fn from(level: LogLevel) -> Self {
        match level {
            LogLevel::Off => LevelFilter::Off,
            LogLevel::Error => LevelFilter::Error,
            LogLevel::Warn => LevelFilter::Warn,
            LogLevel::Info => LevelFilter::Info,
            LogLevel::Debug => LevelFilter::Debug,
            LogLevel::Trace => LevelFilter::Trace,
        }
    }
}

#[derive(Parser)]
struct Cli {
    /// JSON file with detector flags
    #[arg(long)]
    flags: Option<PathBuf>,

    /// Overrides the history size of the flags file
    #[arg(long)]
    history_size: Option<u32>,

    #[arg(long, value_enum, default_value = "warn")]
    log_level: LogLevel,

    #[arg(value_enum)]
    scenario: Scenario,
}

fn init_logging(level: LevelFilter) -> Result<(), Error> {
    let stderr = ConsoleAppender::builder()
        .target(Target::Stderr)
        .encoder(Box::new(PatternEncoder::new("{h({l:<5})} [{T}] {t} - {m}{n}")))
        .build();
    let config = Config::builder()
        .appender(Appender::builder().build("stderr", Box::new(stderr)))
        .build(Root::builder().appender("stderr").build(level))?;
    log4rs::init_config(config)?;
    Ok(())
}

fn main() -> Result<(), Error> {
    let args = Cli::parse();
    init_logging(args.log_level.into())?;

    let mut flags = match args.flags {
        Some(path) => Flags::from_json(File::open(path)?)?,
        None => Flags::default(),
    };
    if let Some(history_size) = args.history_size {
        flags.history_size = history_size;
    }

    let runtime = Runtime::builder().flags(flags).build()?;
    args.scenario.run(&runtime)?;
    let reported = runtime.shutdown()?;

    println!("{:?}: {reported} race(s) reported", args.scenario);
    Ok(())
}
