//! `shepherd`: the daemon supervisor binary (spec.md §1, §6).
//!
//! Grounded on the top-level `main.rs` of the codebase this crate is
//! grounded on for the init order — parse args, init logging, build the
//! runtime, run it to completion, translate its result to an exit code —
//! generalized to shepherd's own runtime (a `Reactor` instead of that
//! codebase's OpAMP-driven supervisor loop).

use std::path::PathBuf;

use shepherd::cli::Cli;
use shepherd::config::loader::ConfigLoader;
use shepherd::config::from_exec_args;
use shepherd::logging::Logging;
use shepherd::reactor::Reactor;
use shepherd::roster::Roster;
use shepherd::ShepherdError;

fn main() {
    if let Err(e) = Logging::try_init() {
        eprintln!("shepherd: {e}");
        std::process::exit(1);
    }

    // spec.md §7 "Uncaught internal errors": no best-effort continuation
    // past an invariant violation the reactor itself didn't anticipate —
    // log it at critical level with its backtrace and go down hard
    // rather than keep serving the control socket from undefined state.
    std::panic::set_hook(Box::new(|info| {
        tracing::error!(panic = %info, backtrace = %std::backtrace::Backtrace::force_capture(), "uncaught internal error");
    }));

    let result = std::panic::catch_unwind(run);
    std::process::exit(match result {
        Ok(Ok(())) => 0,
        Ok(Err(e)) => {
            tracing::error!(error = %e, "fatal startup error");
            1
        }
        Err(_) => 1,
    });
}

fn run() -> Result<(), ShepherdError> {
    let cli = Cli::init();

    if cli.print_debug_info {
        println!("shepherd {}", env!("CARGO_PKG_VERSION"));
        println!("socket: {}", cli.socket);
        return Ok(());
    }

    let config_path = cli.config.as_ref().map(PathBuf::from);

    let mut specs = match &config_path {
        Some(path) => ConfigLoader::new(path).load()?,
        None => Default::default(),
    };
    // `--exec` entries are merged in on top of (and override) anything
    // loaded from `--config`, so ad-hoc daemons can sit alongside a file
    // based roster (spec.md §6 "Simplified roster").
    specs.extend(from_exec_args(&cli.execs));

    if specs.is_empty() {
        return Err(ShepherdError::NoDaemonsConfigured);
    }

    let roster = Roster::new(specs);
    let reactor = Reactor::new(roster, PathBuf::from(&cli.socket), config_path)?;

    reactor.run();
    Ok(())
}
