//! `shepherdctl`: a thin client that sends one request to a running
//! `shepherd`'s control socket and prints the reply (spec.md §4.6, §6).
//! Included as a minimal companion to the daemon binary even though a
//! full-featured operator client is out of scope — spec.md §4.6 still
//! requires *something* speak the control protocol for the testable
//! properties in §8 to be observable end to end.

use std::io::{BufRead, BufReader, Write};
use std::os::unix::net::UnixStream;

use shepherd::cli::{ClientCli, ClientCommand};
use shepherd::control::{Request, Response};

fn main() {
    let cli = ClientCli::init();
    let request = match cli.command {
        ClientCommand::Reload => Request::Reload,
        ClientCommand::Ps => Request::Ps,
        ClientCommand::Start { daemon } => Request::Start { daemon },
        ClientCommand::Stop { daemon } => Request::Stop { daemon },
        ClientCommand::Restart { daemon } => Request::Restart { daemon },
        ClientCommand::CancelRestart { daemon } => Request::CancelRestart { daemon },
        ClientCommand::ListCommands { daemon } => Request::ListCommands { daemon },
        ClientCommand::AdminCommand {
            daemon,
            admin_command,
        } => Request::AdminCommand {
            daemon,
            admin_command,
        },
    };

    let line = serde_json::to_string(&request).expect("Request always serializes");

    let mut stream = match UnixStream::connect(&cli.socket) {
        Ok(s) => s,
        Err(e) => {
            eprintln!("shepherdctl: cannot connect to {}: {e}", cli.socket);
            std::process::exit(1);
        }
    };

    if let Err(e) = writeln!(stream, "{line}") {
        eprintln!("shepherdctl: write failed: {e}");
        std::process::exit(1);
    }

    let mut reply = String::new();
    let mut reader = BufReader::new(stream);
    if let Err(e) = reader.read_line(&mut reply) {
        eprintln!("shepherdctl: read failed: {e}");
        std::process::exit(1);
    }

    match serde_json::from_str::<Response>(&reply) {
        Ok(Response::Error { message }) => {
            eprintln!("shepherdctl: {message}");
            std::process::exit(1);
        }
        Ok(response) => {
            println!("{}", serde_json::to_string(&response).unwrap());
        }
        Err(e) => {
            eprintln!("shepherdctl: malformed reply: {e}");
            std::process::exit(1);
        }
    }
}
