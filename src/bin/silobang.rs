//! Admin CLI: a thin direct caller of [`silobang::Engine`]. Subcommands
//! mirror the abstract operations the core exposes; there is no HTTP layer
//! here.

use std::io::{self, Write};
use std::path::PathBuf;

use clap::{Arg, ArgMatches, Command};
use rusqlite::types::Value as SqlValue;
use silobang::engine::Engine;
use silobang::{EngineConfig, SiloError};

fn cli() -> ArgMatches {
    Command::new("silobang")
        .about("content-addressed asset store: admin CLI")
        .arg(
            Arg::new("working_dir")
                .long("dir")
                .global(true)
                .default_value(".")
                .help("working directory root"),
        )
        .subcommand(
            Command::new("topic")
                .about("manage topics")
                .subcommand(Command::new("create").arg(Arg::new("name").required(true)))
                .subcommand(Command::new("list")),
        )
        .subcommand(
            Command::new("upload")
                .about("upload a file to a topic")
                .arg(Arg::new("topic").required(true))
                .arg(Arg::new("file").required(true))
                .arg(Arg::new("parent").long("parent")),
        )
        .subcommand(
            Command::new("cat")
                .about("write an asset's bytes to stdout")
                .arg(Arg::new("digest").required(true)),
        )
        .subcommand(
            Command::new("metadata")
                .about("read or write an asset's metadata")
                .subcommand(Command::new("get").arg(Arg::new("digest").required(true)))
                .subcommand(
                    Command::new("set")
                        .arg(Arg::new("digest").required(true))
                        .arg(Arg::new("key").required(true))
                        .arg(Arg::new("value").required(true)),
                )
                .subcommand(
                    Command::new("delete")
                        .arg(Arg::new("digest").required(true))
                        .arg(Arg::new("key").required(true)),
                ),
        )
        .subcommand(
            Command::new("verify")
                .about("replay chain heads, optionally re-hashing payloads")
                .arg(Arg::new("topic").long("topic"))
                .arg(Arg::new("full").long("full").num_args(0)),
        )
        .subcommand(
            Command::new("query")
                .about("run a named-parameter SQL template across topics")
                .arg(Arg::new("sql").required(true))
                .arg(Arg::new("param").long("param").action(clap::ArgAction::Append)),
        )
        .get_matches()
}

fn open_engine(args: &ArgMatches) -> Engine {
    let dir: &String = args.get_one("working_dir").expect("has default");
    Engine::open(PathBuf::from(dir), EngineConfig::default()).unwrap_or_else(|e| {
        eprintln!("failed to open working directory: {e}");
        std::process::exit(1);
    })
}

fn report_error(e: SiloError) -> ! {
    eprintln!("error [{}]: {e}", e.kind());
    std::process::exit(1);
}

fn main() {
    silobang::logging::init_stderr_only();
    let args = cli();
    let engine = open_engine(&args);

    match args.subcommand() {
        Some(("topic", sub)) => match sub.subcommand() {
            Some(("create", m)) => {
                let name: &String = m.get_one("name").unwrap();
                if let Err(e) = engine.create_topic(name) {
                    report_error(e);
                }
                println!("created topic {name}");
            }
            Some(("list", _)) => match engine.list_topics() {
                Ok(statuses) => {
                    for status in statuses {
                        let health = if status.healthy { "healthy" } else { "unhealthy" };
                        println!("{}\t{}", status.name, health);
                    }
                }
                Err(e) => report_error(e),
            },
            _ => eprintln!("usage: silobang topic <create|list>"),
        },
        Some(("upload", m)) => {
            let topic: &String = m.get_one("topic").unwrap();
            let file: &String = m.get_one("file").unwrap();
            let parent: Option<&String> = m.get_one("parent");
            let payload = std::fs::read(file).unwrap_or_else(|e| {
                eprintln!("could not read {file}: {e}");
                std::process::exit(1);
            });
            let filename = std::path::Path::new(file).file_name().and_then(|n| n.to_str());
            match engine.upload_to(topic, &payload, parent.map(String::as_str), filename) {
                Ok(result) => {
                    if result.skipped {
                        println!(
                            "skipped (duplicate of existing asset in topic {}): {}",
                            result.existing_topic.unwrap_or_default(),
                            result.digest
                        );
                    } else {
                        println!("{}", result.digest);
                    }
                }
                Err(e) => report_error(e),
            }
        }
        Some(("cat", m)) => {
            let digest: &String = m.get_one("digest").unwrap();
            match engine.read_asset(digest) {
                Ok(bytes) => {
                    io::stdout().write_all(&bytes).expect("write to stdout");
                }
                Err(e) => report_error(e),
            }
        }
        Some(("metadata", sub)) => match sub.subcommand() {
            Some(("get", m)) => {
                let digest: &String = m.get_one("digest").unwrap();
                match engine.get_metadata(digest) {
                    Ok(Some(json)) => println!("{json}"),
                    Ok(None) => println!("{{}}"),
                    Err(e) => report_error(e),
                }
            }
            Some(("set", m)) => {
                let digest: &String = m.get_one("digest").unwrap();
                let key: &String = m.get_one("key").unwrap();
                let value: &String = m.get_one("value").unwrap();
                if let Err(e) = engine.set_metadata(digest, key, value, "silobang-cli", env!("CARGO_PKG_VERSION")) {
                    report_error(e);
                }
            }
            Some(("delete", m)) => {
                let digest: &String = m.get_one("digest").unwrap();
                let key: &String = m.get_one("key").unwrap();
                if let Err(e) = engine.delete_metadata(digest, key, "silobang-cli", env!("CARGO_PKG_VERSION")) {
                    report_error(e);
                }
            }
            _ => eprintln!("usage: silobang metadata <get|set|delete>"),
        },
        Some(("verify", m)) => {
            let topic: Option<&String> = m.get_one("topic");
            let full = m.get_flag("full");
            let topics = topic.map(|t| vec![t.clone()]);

            use indicatif::{ProgressBar, ProgressStyle};
            let pb = ProgressBar::new_spinner();
            pb.set_style(
                ProgressStyle::default_spinner()
                    .template("{spinner:.green} {msg}")
                    .unwrap(),
            );

            match engine.verify(topics.as_deref(), full, |name, ev| {
                pb.set_message(format!("{name}/{}: {} entries", ev.container, ev.entries_done));
                pb.tick();
                silobang::verifier::Control::Continue
            }) {
                Ok(results) => {
                    pb.finish_and_clear();
                    let mut failed = false;
                    for (name, result) in results {
                        match result {
                            Ok(()) => println!("{name}: ok"),
                            Err(e) => {
                                println!("{name}: FAILED: {e}");
                                failed = true;
                            }
                        }
                    }
                    if failed {
                        std::process::exit(1);
                    }
                }
                Err(e) => report_error(e),
            }
        }
        Some(("query", m)) => {
            let sql: &String = m.get_one("sql").unwrap();
            let mut params = std::collections::HashMap::new();
            if let Some(pairs) = m.get_many::<String>("param") {
                for pair in pairs {
                    if let Some((k, v)) = pair.split_once('=') {
                        params.insert(k.to_string(), SqlValue::Text(v.to_string()));
                    }
                }
            }
            match engine.run_query(sql, &params, None) {
                Ok(rows) => {
                    for row in rows {
                        println!("{row:?}");
                    }
                }
                Err(e) => report_error(e),
            }
        }
        _ => {
            let _ = io::stderr().write_all(b"usage: silobang <topic|upload|cat|metadata|verify|query>\n");
        }
    }
}

