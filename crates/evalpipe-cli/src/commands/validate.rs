//! The `evalpipe validate` command.

use std::path::PathBuf;

use anyhow::Result;

pub fn execute(dataset: PathBuf) -> Result<()> {
    let records = evalpipe_client::read_jsonl(&dataset)?;
    println!("Dataset: {} ({} examples)", dataset.display(), records.len());

    let mut warnings = 0;
    for (i, record) in records.iter().enumerate() {
        if record.inputs.is_empty() {
            println!("  [{}] WARNING: empty inputs", i + 1);
            warnings += 1;
        }
        if record.outputs.is_none() {
            println!("  [{}] WARNING: no reference outputs", i + 1);
            warnings += 1;
        }
    }

    if warnings == 0 {
        println!("Dataset valid.");
    } else {
        println!("\n{warnings} warning(s) found.");
    }

    Ok(())
}
