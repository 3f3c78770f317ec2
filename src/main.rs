#[macro_use]
extern crate log;
#[macro_use]
extern crate clap;

use clap::{App, Arg};
use nix::sys::signal::{sigaction, SaFlags, SigAction, SigHandler, SigSet, Signal};
use simplelog::{CombinedLogger, Config, SharedLogger, TermLogger, WriteLogger};
use std::fs::File;
use std::path::Path;

mod bucket_status;
mod console_output;
mod digest;
mod error;
mod input;
mod migrate;
mod posix_store;
mod rate;
mod status_store;
mod store;
mod synced_dir;
mod transfer;
mod transfer_info;
mod viewer;

use crate::console_output::ConsoleProgressOutput;
use crate::error::{MigError, MigResult};
use crate::input::Input;
use crate::migrate::Migrator;

fn init_logs(f: &Path, level: simplelog::LevelFilter) -> MigResult<()> {
    if !f.exists() {
        File::create(f)?;
    }
    let mut loggers: Vec<Box<dyn SharedLogger>> = vec![];
    if let Some(term_logger) = TermLogger::new(level, Config::default()) {
        loggers.push(term_logger);
    }
    loggers.push(WriteLogger::new(level, Config::default(), File::create(f)?));
    let _ = CombinedLogger::init(loggers);

    Ok(())
}

fn verbosity_level(occurrences: u64) -> simplelog::LevelFilter {
    match occurrences {
        0 => simplelog::LevelFilter::Info,
        1 => simplelog::LevelFilter::Debug,
        _ => simplelog::LevelFilter::Trace,
    }
}

#[test]
fn test_verbosity_level() {
    assert_eq!(verbosity_level(0), simplelog::LevelFilter::Info);
    assert_eq!(verbosity_level(1), simplelog::LevelFilter::Debug);
    assert_eq!(verbosity_level(5), simplelog::LevelFilter::Trace);
}

extern "C" fn handle_sigint(_: i32) {
    println!("Interrupted by SIGINT... stopping.");
    viewer::cleanup_registered();
    // in-flight transfers are not rolled back; a re-run resumes them
    std::process::exit(0);
}

/*
    main takes in a required config flag:
    c: path to the JSON migration config (endpoints, bucket mappings,
    worker count, block size)
    Optional flags select a logfile name under the home directory and
    raise the log verbosity.
*/
fn main() -> MigResult<()> {
    let matches = App::new("Bucket Forklift")
        .author(crate_authors!())
        .about("Resumable object store bucket migration program")
        .version(crate_version!())
        .arg(
            Arg::with_name("config")
                .help("The path of the JSON file holding the migration configuration: source, \
                destination and status endpoints, bucket mappings, and tuning options")
                .long("config")
                .short("c")
                .takes_value(true)
                .value_name("CONFIGFILE")
                .number_of_values(1)
                .required(true),
        ).arg(
            Arg::with_name("logfile")
                .default_value("forklift.log")
                .help("Logs debug statements to the named file in the home directory")
                .long("logfile")
                .short("l")
                .takes_value(true)
                .required(false),
        ).arg(
            Arg::with_name("v")
                .short("v")
                .multiple(true)
                .help("Sets the level of verbosity"),
        ).get_matches();

    let level = verbosity_level(matches.occurrences_of("v"));
    let logfile = matches.value_of("logfile").unwrap();
    let path = match dirs::home_dir() {
        Some(path) => path.join(logfile),
        None => {
            eprintln!("Home directory not found");
            return Err(MigError::CLIError("Home directory not found".to_string()));
        }
    };
    init_logs(&path, level)?;
    debug!("Log path: {:?}", logfile);
    info!("Logs made");

    let config_path = matches.value_of("config").unwrap();
    let config_text = std::fs::read_to_string(config_path)?;
    let input = Input::new(&config_text)?;
    debug!("Configuration loaded from {}", config_path);

    let action =
        SigAction::new(SigHandler::Handler(handle_sigint), SaFlags::empty(), SigSet::empty());
    unsafe {
        if let Err(e) = sigaction(Signal::SIGINT, &action) {
            warn!("could not install the SIGINT handler: {}", e);
        }
    }

    let migrator = Migrator::new(input, Box::new(ConsoleProgressOutput::new()));
    let failures = migrator.run()?;
    if failures > 0 {
        error!("{} objects could not be migrated", failures);
        std::process::exit(1);
    }
    Ok(())
}
