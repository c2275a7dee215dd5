use std::process;

use anyhow::{self, format_err};
use clap::Parser;
use log::LevelFilter;
use log4rs::append::console::ConsoleAppender;
use log4rs::append::file::FileAppender;
use log4rs::config::{Appender, Config, Logger, Root};
use log4rs::encode::pattern::PatternEncoder;

use npdm::interfaces::cli::{log_heading, Cli};
use npdm::interfaces::input::Input;
use npdm::interfaces::InputHandle;
use npdm::io::read_npdm_yaml;

/// Configures the `npdm-output` logger for the main output and the root logger for diagnostics.
fn init_logging(cli: &Cli) -> Result<(), anyhow::Error> {
    let level = match cli.verbose {
        0 => LevelFilter::Warn,
        1 => LevelFilter::Info,
        2 => LevelFilter::Debug,
        _ => LevelFilter::Trace,
    };
    let mut output_appenders = vec!["output_console".to_string()];
    let mut builder = Config::builder()
        .appender(
            Appender::builder().build(
                "output_console",
                Box::new(
                    ConsoleAppender::builder()
                        .encoder(Box::new(PatternEncoder::new("{m}{n}")))
                        .build(),
                ),
            ),
        )
        .appender(
            Appender::builder().build(
                "diagnostic_console",
                Box::new(
                    ConsoleAppender::builder()
                        .target(log4rs::append::console::Target::Stderr)
                        .encoder(Box::new(PatternEncoder::new("{d(%H:%M:%S)} {h({l:<5})} {t} - {m}{n}")))
                        .build(),
                ),
            ),
        );
    if let Some(output) = cli.output.as_ref() {
        let file = FileAppender::builder()
            .append(false)
            .encoder(Box::new(PatternEncoder::new("{m}{n}")))
            .build(output)
            .map_err(|err| format_err!("Unable to open `{}`: {err}", output.display()))?;
        builder = builder.appender(Appender::builder().build("output_file", Box::new(file)));
        output_appenders.push("output_file".to_string());
    }
    let config = builder
        .logger(
            Logger::builder()
                .appenders(output_appenders)
                .additive(false)
                .build("npdm-output", LevelFilter::Info),
        )
        .build(Root::builder().appender("diagnostic_console").build(level))
        .map_err(|err| format_err!(err))?;
    log4rs::init_config(config).map_err(|err| format_err!(err))?;
    Ok(())
}

fn run(cli: &Cli) -> Result<(), anyhow::Error> {
    init_logging(cli)?;
    log_heading();
    let input = match cli.config.as_ref() {
        Some(config) => read_npdm_yaml::<Input, _>(config)?,
        None => Input::default(),
    };
    input.handle()
}

fn main() {
    let cli = Cli::parse();
    if let Err(err) = run(&cli) {
        log::error!("{err:#}");
        eprintln!("Error: {err:#}");
        process::exit(1);
    }
}
