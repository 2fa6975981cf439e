//! zonekv - LSM-Tree Key-Value Storage Engine
//! Interactive shell over a store on a file-backed zoned device.

use std::io::{self, BufRead, Write};

use zonekv::{Config, ZoneKv};

fn main() {
    env_logger::init();

    let dir = std::env::args().nth(1).unwrap_or_else(|| "./data".to_string());

    println!();
    println!("  ╔═══════════════════════════════════════════╗");
    println!("  ║             zonekv Storage Engine         ║");
    println!("  ║      LSM key-value store on zoned media   ║");
    println!("  ╚═══════════════════════════════════════════╝");
    println!();
    println!("  Commands:");
    println!("    set <key> <value>  - Store a key-value pair");
    println!("    get <key>          - Retrieve a value by key");
    println!("    del <key>          - Delete a key");
    println!("    scan               - List all key-value pairs");
    println!("    flush              - Write MemTables to sorted files");
    println!("    compact            - Compact the whole key space");
    println!("    prop <name>        - Show a property, e.g. zonekv.stats");
    println!("    info               - Show engine statistics");
    println!("    exit               - Shutdown engine");
    println!();

    let db = match ZoneKv::open(Config::new(&dir)) {
        Ok(db) => db,
        Err(err) => {
            eprintln!("[ERROR] Failed to open {}: {}", dir, err);
            std::process::exit(1);
        }
    };

    let stdin = io::stdin();
    let mut stdout = io::stdout();

    loop {
        print!("zonekv> ");
        if stdout.flush().is_err() {
            break;
        }

        let mut line = String::new();
        match stdin.lock().read_line(&mut line) {
            Ok(0) | Err(_) => break,
            Ok(_) => {}
        }

        let parts: Vec<&str> = line.split_whitespace().collect();
        if parts.is_empty() {
            continue;
        }

        match parts[0].to_lowercase().as_str() {
            "set" | "put" => {
                if parts.len() < 3 {
                    println!("  Usage: set <key> <value>");
                    continue;
                }
                let key = parts[1].as_bytes().to_vec();
                let value = parts[2..].join(" ").into_bytes();
                match db.insert(key, value) {
                    Ok(()) => println!("  OK"),
                    Err(e) => println!("  ERROR: {}", e),
                }
            }
            "get" => {
                if parts.len() < 2 {
                    println!("  Usage: get <key>");
                    continue;
                }
                match db.get(parts[1].as_bytes()) {
                    Ok(Some(value)) => match String::from_utf8(value) {
                        Ok(s) => println!("  \"{}\"", s),
                        Err(_) => println!("  <binary data>"),
                    },
                    Ok(None) => println!("  (nil)"),
                    Err(e) => println!("  ERROR: {}", e),
                }
            }
            "del" | "delete" => {
                if parts.len() < 2 {
                    println!("  Usage: del <key>");
                    continue;
                }
                match db.remove(parts[1].as_bytes().to_vec()) {
                    Ok(()) => println!("  OK (deleted)"),
                    Err(e) => println!("  ERROR: {}", e),
                }
            }
            "scan" | "list" => match db.scan() {
                Ok(entries) if entries.is_empty() => println!("  (empty)"),
                Ok(entries) => {
                    for (key, value) in &entries {
                        let k = String::from_utf8_lossy(key);
                        let v = String::from_utf8_lossy(value);
                        println!("  {} -> {}", k, v);
                    }
                    println!("  ({} entries)", entries.len());
                }
                Err(e) => println!("  ERROR: {}", e),
            },
            "flush" => match db.flush(true, true, false) {
                Ok(()) => println!("  OK"),
                Err(e) => println!("  ERROR: {}", e),
            },
            "compact" => match db.compact() {
                Ok(()) => println!("  OK"),
                Err(e) => println!("  ERROR: {}", e),
            },
            "prop" => {
                if parts.len() < 2 {
                    println!("  Usage: prop <name>");
                    continue;
                }
                match db.get_property(parts[1]) {
                    Some(value) => println!("{}", value),
                    None => println!("  (unknown property)"),
                }
            }
            "info" | "stats" => {
                if let Some(stats) = db.get_property("zonekv.stats") {
                    println!("{}", stats);
                }
                println!("{}", db.metrics().report());
            }
            "exit" | "quit" | "q" => {
                println!("  Shutting down zonekv...");
                break;
            }
            _ => {
                println!("  Unknown command: '{}'. Type 'exit' to quit.", parts[0]);
            }
        }
    }

    if let Err(e) = db.close() {
        eprintln!("[ERROR] Close failed: {}", e);
    }
}
