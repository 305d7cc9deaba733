//! The `evalpipe init` command.

use std::path::Path;

use anyhow::Result;

pub fn execute() -> Result<()> {
    if Path::new("evalpipe.toml").exists() {
        println!("evalpipe.toml already exists, skipping.");
    } else {
        std::fs::write("evalpipe.toml", SAMPLE_CONFIG)?;
        println!("Created evalpipe.toml");
    }

    std::fs::create_dir_all("datasets")?;
    let example_path = Path::new("datasets/example.jsonl");
    if example_path.exists() {
        println!("datasets/example.jsonl already exists, skipping.");
    } else {
        std::fs::write(example_path, EXAMPLE_DATASET)?;
        println!("Created datasets/example.jsonl");
    }

    println!("\nNext steps:");
    println!("  1. Run: evalpipe validate --dataset datasets/example.jsonl");
    println!("  2. Run: evalpipe run --command 'cat' --evaluator exact_match --summary exact_match_rate");

    Ok(())
}

const SAMPLE_CONFIG: &str = r#"# evalpipe configuration

dataset = "datasets/example.jsonl"
experiment_prefix = "experiment"
max_concurrency = 4
timeout_secs = 60

[metadata]
owner = "${USER}"
"#;

const EXAMPLE_DATASET: &str = r#"{"inputs": {"question": "What is 2 + 2?"}, "outputs": {"question": "What is 2 + 2?"}}
{"inputs": {"question": "What is the capital of France?"}, "outputs": {"question": "What is the capital of France?"}}
{"inputs": {"question": "Name a prime number."}, "outputs": {"question": "Name a prime number."}}
"#;
