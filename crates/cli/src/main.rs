use std::io::{self, BufRead, Write};

use clap::Parser;
use relay::{Config, Server};

#[derive(Parser)]
#[command(
    name = "relay-server",
    about = "Standalone relay server for a driving-simulation multiplayer game"
)]
struct Args {
    /// Path to the server's YAML configuration file.
    #[arg(long, short, default_value = "config.yaml")]
    config: String,
}

fn main() {
    tracing_subscriber::fmt::init();

    let args = Args::parse();
    let config = match Config::load(&args.config) {
        Ok(config) => config,
        Err(e) => {
            tracing::warn!(path = %args.config, error = %e, "using default configuration");
            Config::default()
        }
    };

    let mut server = match Server::new(config) {
        Ok(server) => server,
        Err(e) => {
            eprintln!("Failed to build server: {e}");
            return;
        }
    };

    if let Err(e) = server.start() {
        eprintln!("Failed to start server: {e}");
        return;
    }

    run_console(&server);

    server.stop();
}

/// Blocking console REPL: reads one line at a time from stdin, dispatches
/// it to the operator command surface, and prints the reply. Mirrors the
/// reference's `console.start()` task.
fn run_console(server: &Server) {
    let console = server.console();
    let stdin = io::stdin();
    println!("Relay server running. Type 'help' for a list of commands, 'stop' to shut down.");

    for line in stdin.lock().lines() {
        let Ok(line) = line else { break };
        let mut parts = line.trim().split_whitespace();
        let Some(command) = parts.next() else { continue };
        let args: Vec<&str> = parts.collect();

        let reply = match command {
            "stop" | "exit" | "quit" => break,
            "list" => console.list(),
            "kick" => console.kick(&args),
            "tps" => console.tps(),
            "rl" => console.rate_limit(&args),
            "plugins" => console.plugins(&args),
            "help" => "Commands: list, kick <nick>|:<id> [reason], tps, rl ..., plugins ..., stop".to_string(),
            other => format!("Unknown command: {other}"),
        };

        println!("{reply}");
        let _ = io::stdout().flush();
    }
}
