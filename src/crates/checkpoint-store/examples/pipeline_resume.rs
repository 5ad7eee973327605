//! Resumable pipeline driver
//!
//! Runs a three-stage pipeline against a checkpoint store. Stages that already
//! have a verified checkpoint are skipped, so running the example twice only
//! does the work once.
//!
//! ```text
//! cargo run -p checkpoint-store --example pipeline_resume -- /tmp/pipeline
//! ```

use checkpoint_store::{CheckpointMetadata, CheckpointStore, StageCheckpointer, StoreConfig};
use serde::{Deserialize, Serialize};
use serde_json::json;

#[derive(Debug, Serialize, Deserialize)]
struct Parsed {
    messages: Vec<String>,
}

#[derive(Debug, Serialize, Deserialize)]
struct Threaded {
    threads: Vec<Vec<usize>>,
}

#[derive(Debug, Serialize, Deserialize)]
struct Analysis {
    thread_count: usize,
    longest_thread: usize,
}

fn parse<S: StageCheckpointer>(store: &mut S) -> checkpoint_store::Result<Parsed> {
    if let Some(parsed) = store.load_typed::<Parsed>("parse")? {
        println!("parse: resumed from checkpoint");
        return Ok(parsed);
    }
    let parsed = Parsed {
        messages: ["hello", "re: hello", "schedule", "re: schedule", "re: re: schedule"]
            .iter()
            .map(|s| s.to_string())
            .collect(),
    };
    let metadata = CheckpointMetadata::new().with_entry("message_count", json!(parsed.messages.len()));
    store.save_typed("parse", &parsed, Some(metadata))?;
    println!("parse: computed and checkpointed");
    Ok(parsed)
}

fn thread<S: StageCheckpointer>(store: &mut S, parsed: &Parsed) -> checkpoint_store::Result<Threaded> {
    if let Some(threaded) = store.load_typed::<Threaded>("thread")? {
        println!("thread: resumed from checkpoint");
        return Ok(threaded);
    }
    let mut threads: Vec<(String, Vec<usize>)> = Vec::new();
    for (i, message) in parsed.messages.iter().enumerate() {
        let subject = message.trim_start_matches("re: ").to_string();
        match threads.iter_mut().find(|(s, _)| *s == subject) {
            Some((_, members)) => members.push(i),
            None => threads.push((subject, vec![i])),
        }
    }
    let threaded = Threaded {
        threads: threads.into_iter().map(|(_, members)| members).collect(),
    };
    store.save_typed("thread", &threaded, None)?;
    println!("thread: computed and checkpointed");
    Ok(threaded)
}

fn analyze<S: StageCheckpointer>(store: &mut S, threaded: &Threaded) -> checkpoint_store::Result<Analysis> {
    if let Some(analysis) = store.load_typed::<Analysis>("analyze")? {
        println!("analyze: resumed from checkpoint");
        return Ok(analysis);
    }
    let analysis = Analysis {
        thread_count: threaded.threads.len(),
        longest_thread: threaded.threads.iter().map(Vec::len).max().unwrap_or(0),
    };
    store.save_typed("analyze", &analysis, None)?;
    println!("analyze: computed and checkpointed");
    Ok(analysis)
}

fn main() -> checkpoint_store::Result<()> {
    let base = std::env::args()
        .nth(1)
        .unwrap_or_else(|| std::env::temp_dir().join("checkpoint-pipeline").display().to_string());
    let mut store = CheckpointStore::open(StoreConfig::new(base))?;

    let parsed = parse(&mut store)?;
    let threaded = thread(&mut store, &parsed)?;
    let analysis = analyze(&mut store, &threaded)?;
    println!("{analysis:?}");

    for stage in ["parse", "thread", "analyze"] {
        let status = store.stage_status(stage)?;
        println!(
            "{stage}: {} checkpoint(s), chain complete: {}",
            status.checkpoint_count, status.chain_complete
        );
    }
    Ok(())
}
