//! # Flight Inspector
//!
//! Decodes a recorded row stream and prints the resolved tree as JSON.
//!
//! ## Usage
//!
//! ```bash
//! flight_inspect response.flight --rows --config decoder.toml
//! ```

use std::process::ExitCode;
use std::time::Duration;

use flight::client::{LoadFuture, ResponseStats};
use flight::{DecoderConfig, Module, ModuleLoader, ModuleRegistry, Response, RowParser};

/// Resolves every locator to a module holding its own name.
struct EchoLoader;

impl ModuleLoader for EchoLoader {
    fn load(&self, locator: &str) -> LoadFuture {
        let module = Module::new(locator.to_owned());
        Box::pin(std::future::ready(Ok(module)))
    }
}

struct Options {
    path: String,
    show_rows: bool,
    config: Option<String>,
    timeout_ms: u64,
}

fn parse_args() -> Option<Options> {
    let args: Vec<String> = std::env::args().collect();
    let mut options = Options {
        path: String::new(),
        show_rows: false,
        config: None,
        timeout_ms: 5_000,
    };

    let mut i = 1;
    while i < args.len() {
        match args[i].as_str() {
            "--rows" | "-r" => options.show_rows = true,
            "--config" | "-c" => {
                if i + 1 < args.len() {
                    options.config = Some(args[i + 1].clone());
                    i += 1;
                }
            }
            "--timeout-ms" | "-t" => {
                if i + 1 < args.len() {
                    options.timeout_ms = args[i + 1].parse().unwrap_or(5_000);
                    i += 1;
                }
            }
            "--help" | "-h" => return None,
            path => options.path = path.to_owned(),
        }
        i += 1;
    }

    if options.path.is_empty() {
        None
    } else {
        Some(options)
    }
}

fn print_usage() {
    println!("Usage: flight_inspect <stream_file> [OPTIONS]");
    println!();
    println!("Options:");
    println!("  -r, --rows               List every row before the tree");
    println!("  -c, --config <FILE>      Decoder configuration (TOML)");
    println!("  -t, --timeout-ms <MS>    Wait for module loads (default: 5000)");
}

fn print_rows(bytes: &[u8], config: &DecoderConfig) {
    let mut parser = RowParser::with_max_row_length(config.max_row_length);
    let mut rows = Vec::new();
    if let Err(e) = parser.feed(bytes, &mut rows) {
        println!("  (row listing stopped: {e})");
    }

    println!("┌─ ROWS ─────────────────────────────────────────────────────────┐");
    for row in &rows {
        let preview: String = String::from_utf8_lossy(&row.payload).chars().take(48).collect();
        println!("│ {:>6}  {:<16} {:>8} B  {}", row.id, format!("{:?}", row.kind), row.payload.len(), preview);
    }
    println!("└────────────────────────────────────────────────────────────────┘");
    println!();
}

fn print_stats(stats: &ResponseStats) {
    println!("┌─ RESPONSE ─────────────────────────────────────────────────────┐");
    println!("│ Rows:               {}", stats.rows);
    println!("│ Bytes:              {}", stats.bytes);
    println!("│ Ids:                {}", stats.ids);
    println!("│ Pending:            {}", stats.pending);
    println!("└────────────────────────────────────────────────────────────────┘");
    println!();
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> ExitCode {
    println!("╔══════════════════════════════════════════════════════════════════╗");
    println!("║         FLIGHT INSPECTOR                                         ║");
    println!("╚══════════════════════════════════════════════════════════════════╝");
    println!();

    let Some(options) = parse_args() else {
        print_usage();
        return ExitCode::from(2);
    };

    let config = match &options.config {
        Some(path) => match DecoderConfig::from_toml_file(path) {
            Ok(config) => config,
            Err(e) => {
                println!("Error: {e}");
                return ExitCode::FAILURE;
            }
        },
        None => DecoderConfig::default(),
    };

    println!("Loading stream: {}", options.path);
    let bytes = match std::fs::read(&options.path) {
        Ok(bytes) => bytes,
        Err(e) => {
            println!("Error: Could not open file: {e}");
            return ExitCode::FAILURE;
        }
    };
    println!();

    if options.show_rows {
        print_rows(&bytes, &config);
    }

    let response = Response::with_config(ModuleRegistry::new(EchoLoader), config);
    if let Err(e) = response.read_from(bytes.as_slice()).await {
        println!("Error: {e}");
    }

    let root = response.root();
    let timeout = Duration::from_millis(options.timeout_ms);
    let outcome = tokio::time::timeout(timeout, root.settled()).await;
    print_stats(&response.stats());

    match outcome {
        Ok(Ok(value)) => {
            let json = value.expand();
            println!("{}", serde_json::to_string_pretty(&json).unwrap_or_else(|_| json.to_string()));
            ExitCode::SUCCESS
        }
        Ok(Err(e)) => {
            println!("Root rejected: {e}");
            if let Some(digest) = e.digest() {
                println!("Digest:        {digest}");
            }
            ExitCode::FAILURE
        }
        Err(_) => {
            println!("Root still pending after {} ms", options.timeout_ms);
            ExitCode::FAILURE
        }
    }
}
