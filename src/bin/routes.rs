//! CLI tool for inspecting a rule file
//!
//! Usage:
//!   rproxy-routes check [--config <file>]
//!   rproxy-routes list [--json]
//!   rproxy-routes resolve <host> <path>

use anyhow::Result;
use clap::{Parser, Subcommand};
use rproxy::{load_rules, CertificateIndex, FallbackPolicy, MatchResult, RoutingTable};
use std::path::PathBuf;

/// Inspect RProxy rule files
#[derive(Parser, Debug)]
#[command(name = "rproxy-routes")]
#[command(author = "RProxy Contributors")]
#[command(version = "1.0.0")]
#[command(about = "Check, list and resolve RProxy routing rules")]
struct Args {
    /// Rule file (JSON or YAML)
    #[arg(short = 'c', long, env = "PROXY_CONFIG", default_value = "config.yaml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Compile the rules and load every certificate
    Check {
        /// Fallback certificate policy: first, none or a server name
        #[arg(long, default_value = "first")]
        default_cert: FallbackPolicy,
    },

    /// Print rules in match order
    List {
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },

    /// Show where a request would be forwarded
    Resolve {
        /// Host header value, as a client would send it
        host: String,

        /// Request path, optionally with a query
        #[arg(default_value = "/")]
        path: String,
    },
}

fn main() -> Result<()> {
    let args = Args::parse();
    let rules = load_rules(&args.config)?;

    match args.command {
        Commands::Check { default_cert } => {
            let table = RoutingTable::build(&rules)?;
            let locations: usize = table.routes().iter().map(|r| r.locations.len()).sum();
            println!(
                "{}: {} rule(s), {} location(s)",
                args.config.display(),
                table.routes().len(),
                locations
            );

            match CertificateIndex::build(&rules, &default_cert)? {
                Some(index) => {
                    for entry in index.entries() {
                        println!("  certificate {} for {}", entry.cert_path.display(), entry.server_names.join(", "));
                    }
                    println!("TLS enabled, fallback certificate: {}", index.policy());
                }
                None => println!("TLS disabled, no rule sets tls: true"),
            }
        }

        Commands::List { json } => {
            if rules.is_empty() {
                println!("No rules found");
                return Ok(());
            }

            if json {
                println!("{}", serde_json::to_string_pretty(&rules)?);
            } else {
                for (index, rule) in rules.iter().enumerate() {
                    println!(
                        "#{} {}{}",
                        index,
                        rule.server_names.join(" "),
                        if rule.tls { " [tls]" } else { "" }
                    );
                    for location in &rule.locations {
                        println!("    {:<24} -> {}", location.path, location.endpoint);
                    }
                }
            }
        }

        Commands::Resolve { host, path } => {
            let table = RoutingTable::build(&rules)?;
            let (path_only, query) = match path.split_once('?') {
                Some((p, q)) => (p, Some(q)),
                None => (path.as_str(), None),
            };

            match table.resolve(&host, path_only) {
                MatchResult::Forward {
                    endpoint,
                    server_name,
                    location,
                } => {
                    println!("server name: {}", server_name);
                    println!("location:    {}", location);
                    println!("target:      {}", endpoint.target_uri(path_only, query)?);
                }
                MatchResult::Unmatched => {
                    eprintln!("No route for host {} path {}", host, path_only);
                    std::process::exit(1);
                }
            }
        }
    }

    Ok(())
}
