//! Simple decoder to inspect Ren'Py save files.

use std::collections::BTreeMap;

use renpy_save::{decode_pickle_global, Metadata, Node, SaveArchive, State};

fn main() {
    let path = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "1-1-LT1.save".to_string());

    println!("Reading: {}", path);

    let mut archive = SaveArchive::open(&path).expect("Failed to open archive");
    println!("Entries: {}", archive.entry_names().join(", "));

    let log = archive.log_bytes().expect("Failed to read log entry");
    println!("Log size: {} bytes", log.len());

    let decoded = decode_pickle_global(&log).expect("Failed to decode");

    println!("\n=== Log Info ===");
    println!("Protocol: {}", decoded.protocol);
    println!("Nodes: {}", decoded.graph.len());

    let mut lists = 0;
    let mut dicts = 0;
    let mut sets = 0;
    let mut types: BTreeMap<String, (usize, usize)> = BTreeMap::new();
    for (_, node) in decoded.graph.iter() {
        match node {
            Node::Sequence(_) => lists += 1,
            Node::Mapping(_) => dicts += 1,
            Node::Set(_) => sets += 1,
            Node::Instance(inst) => {
                let entry = types.entry(inst.ty.to_string()).or_default();
                entry.0 += 1;
                if !matches!(inst.state, State::None) {
                    entry.1 += 1;
                }
            }
        }
    }
    println!("  lists: {}", lists);
    println!("  dicts: {}", dicts);
    println!("  sets: {}", sets);

    let mut by_count: Vec<_> = types.into_iter().collect();
    by_count.sort_by(|a, b| b.1 .0.cmp(&a.1 .0));

    println!("\n=== Top 20 Types ===");
    for (name, (count, with_state)) in by_count.iter().take(20) {
        println!("  {:>7} {} ({} with state)", count, name, with_state);
    }
    if by_count.len() > 20 {
        println!("  ... and {} more types", by_count.len() - 20);
    }

    match archive.metadata().expect("Failed to read metadata") {
        Some(Metadata::Json(value)) => {
            println!("\n=== Metadata ===");
            println!("{}", serde_json::to_string_pretty(&value).expect("Failed to format metadata"));
        }
        Some(Metadata::Raw(text)) => {
            println!("\n=== Metadata (not JSON) ===");
            println!("{text}");
        }
        None => {}
    }
}
