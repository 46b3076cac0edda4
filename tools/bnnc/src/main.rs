use std::fs;
use std::path::PathBuf;

use bnn_rs::{convert_graph, Graph, OptLevel};

fn main() {
    if let Err(err) = run() {
        eprintln!("error: {err}");
        std::process::exit(1);
    }
}

fn run() -> Result<(), String> {
    let mut args = std::env::args().skip(1);
    let Some(cmd) = args.next() else {
        print_help();
        return Ok(());
    };

    match cmd.as_str() {
        "--help" | "-h" | "help" => {
            print_help();
            Ok(())
        }
        "version" | "--version" | "-V" => {
            println!("bnnc 0.1.0");
            Ok(())
        }
        "compile" => run_compile(args.collect()),
        other => Err(format!("unknown command '{other}'")),
    }
}

fn run_compile(raw_args: Vec<String>) -> Result<(), String> {
    let mut input: Option<PathBuf> = None;
    let mut output: Option<PathBuf> = None;
    let mut level = OptLevel::Strict;
    let mut expected_list: Option<PathBuf> = None;

    let mut i = 0usize;
    while i < raw_args.len() {
        match raw_args[i].as_str() {
            "--in" => {
                i += 1;
                input = raw_args.get(i).map(PathBuf::from);
            }
            "--out" => {
                i += 1;
                output = raw_args.get(i).map(PathBuf::from);
            }
            "--level" => {
                i += 1;
                let value = raw_args
                    .get(i)
                    .ok_or_else(|| "missing value for --level".to_string())?;
                level = value.parse().map_err(|err| format!("{err}"))?;
            }
            "--expected-list" => {
                i += 1;
                expected_list = raw_args.get(i).map(PathBuf::from);
            }
            flag => return Err(format!("unknown compile flag '{flag}'")),
        }
        i += 1;
    }

    let input = input.ok_or_else(|| "missing required --in".to_string())?;
    let output = output.ok_or_else(|| "missing required --out".to_string())?;

    let expected = match expected_list {
        Some(path) => read_expected_list(&path)?,
        None => Vec::new(),
    };

    let source = fs::read_to_string(&input)
        .map_err(|e| format!("failed to read graph {}: {e}", input.display()))?;
    let graph: Graph = serde_json::from_str(&source)
        .map_err(|e| format!("failed to decode graph {}: {e}", input.display()))?;

    let binary_conv_outputs = convert_graph(&graph, &output, level, &expected)
        .map_err(|err| format!("conversion failed: {err}"))?;

    println!("compiled {} -> {}", input.display(), output.display());
    if !binary_conv_outputs.is_empty() {
        println!("binary convolutions: {}", binary_conv_outputs.join(", "));
    }
    Ok(())
}

/// Reads the expected-binary-convolution list: one tensor name per line,
/// blank lines ignored.
fn read_expected_list(path: &PathBuf) -> Result<Vec<String>, String> {
    let text = fs::read_to_string(path)
        .map_err(|e| format!("failed to read expected list {}: {e}", path.display()))?;
    Ok(text
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .map(str::to_string)
        .collect())
}

fn print_help() {
    println!("bnnc 0.1.0");
    println!("Usage:");
    println!("  bnnc compile --in <graph.json> --out <model.bnn> [--level strict|moderate|aggressive] [--expected-list <file>]");
    println!("  bnnc version");
}
