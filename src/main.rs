use clap::Parser;
use log::debug;

use brandy::commands;
use brandy::errors::ErrorKind;
use brandy::host::{Host, LineRead};
use brandy::interp::{Interpreter, Outcome};
use brandy::workspace::{DEFAULT_SIZE, MIN_SIZE};

/// BBC BASIC V interpreter
#[derive(Parser, Debug)]
#[command(about, long_about = None)]
struct Args {
    /// BASIC program to load and run
    file: Option<String>,

    /// Workspace size in bytes; k and m suffixes are accepted
    #[arg(short = 's', long = "size")]
    size: Option<String>,

    /// Colon-separated search path for LOAD and INSTALL
    #[arg(short = 'p', long = "path")]
    path: Option<String>,

    /// Load a program without running it
    #[arg(short = 'l', long = "load")]
    load: Option<String>,

    /// Statement to execute after startup
    #[arg(short = 'c', long = "command")]
    command: Option<String>,

    /// Exit once the program (or startup command) has finished
    #[arg(short = 'q', long = "quit", default_value_t = false)]
    quit: bool,

    /// Diagnostic verbosity (-v, -vv)
    #[arg(short = 'v', long = "verbose", action = clap::ArgAction::Count)]
    verbose: u8,
}

fn parse_size(text: &str) -> Option<usize> {
    let lower = text.to_ascii_lowercase();
    let (digits, mult) = if let Some(d) = lower.strip_suffix('m') {
        (d, 1024 * 1024)
    } else if let Some(d) = lower.strip_suffix('k') {
        (d, 1024)
    } else {
        (lower.as_str(), 1)
    };
    digits.parse::<usize>().ok().map(|n| (n * mult).max(MIN_SIZE))
}

/// Print an error report the way the command prompt does.
fn report(ip: &mut Interpreter, err: brandy::errors::BasicError) {
    if err.kind == ErrorKind::None {
        // The quiet transfer used by EDIT and friends.
        return;
    }
    let text = err.report();
    ip.error_slot = Some(err);
    ip.print_line(&text);
}

fn main() -> std::process::ExitCode {
    let args = Args::parse();
    stderrlog::new()
        .verbosity(args.verbose as usize)
        .init()
        .ok();

    let size = args
        .size
        .as_deref()
        .and_then(parse_size)
        .unwrap_or(DEFAULT_SIZE);
    let mut ip = match Interpreter::new(size, Host::std()) {
        Ok(ip) => ip,
        Err(e) => {
            eprintln!("{e}");
            return std::process::ExitCode::FAILURE;
        }
    };
    if let Some(path) = args.path {
        ip.filepath = path;
    }
    debug!("workspace {} bytes", ip.ws.size());

    // A file argument loads and runs; -load only loads.
    let mut failed = false;
    if let Some(file) = &args.load {
        if let Err(e) = commands::load_and_maybe_run(&mut ip, file, false) {
            report(&mut ip, e);
            failed = true;
        }
    }
    if let Some(file) = &args.file {
        if let Err(e) = commands::load_and_maybe_run(&mut ip, file, true) {
            report(&mut ip, e);
            failed = true;
        }
    }
    if let Some(command) = &args.command {
        match ip.process_line(command) {
            Ok(Outcome::Quit) => return exit_code(failed),
            Ok(Outcome::Continue) => {}
            Err(e) => {
                report(&mut ip, e);
                failed = true;
            }
        }
    }
    if args.quit || (args.file.is_some() && args.command.is_none()) {
        return exit_code(failed);
    }

    let free = ip.ws.himem - ip.ws.top;
    ip.print_line("BBC BASIC V interpreter");
    ip.print_line(&format!("{free} bytes free"));
    ip.print_line("");

    loop {
        let line = match ip.host.keyboard.read_line_edit(">", "") {
            Ok(LineRead::Line(line)) => line,
            Ok(LineRead::Escape) => continue,
            Ok(LineRead::Eof) => break,
            Err(e) => {
                report(&mut ip, e);
                continue;
            }
        };
        match ip.process_line(&line) {
            Ok(Outcome::Continue) => {}
            Ok(Outcome::Quit) => break,
            Err(e) => report(&mut ip, e),
        }
    }
    exit_code(failed)
}

fn exit_code(failed: bool) -> std::process::ExitCode {
    if failed {
        std::process::ExitCode::FAILURE
    } else {
        std::process::ExitCode::SUCCESS
    }
}
