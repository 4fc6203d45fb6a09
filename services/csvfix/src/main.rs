//! Csvfix Service - Repairs the line-split Ambiti Territoriali CSV export
//!
//! The upstream export breaks records across multiple physical lines when a
//! field contains a literal newline. This service:
//! - Analyzes the file structure against the header's field count
//! - Re-joins broken lines until a record reaches the expected field count
//! - Uses region names as record-boundary markers when two records end up
//!   glued into one buffer
//! - Writes the reconstructed file only when something was actually broken
//!
//! The reassembly is a heuristic, not a CSV parser: fields are counted by
//! naive comma split and record boundaries are assumed to start with one of
//! the 20 region names. Use --verify to re-check the output with a real
//! quoted-field-aware parser.

use anyhow::{Context, Result};
use clap::Parser;
use encoding_rs::UTF_8;
use regex::Regex;
use std::fs;
use std::path::{Path, PathBuf};

#[derive(Parser, Debug)]
#[command(name = "csvfix", about = "Repairs the line-split Ambiti Territoriali CSV export")]
struct Args {
    /// Path to the broken CSV export
    #[arg(long)]
    input: Option<PathBuf>,

    /// Path for the repaired file
    #[arg(long)]
    output: Option<PathBuf>,

    /// Repair even when the analysis finds no broken lines
    #[arg(long, default_value = "false")]
    force: bool,

    /// Re-check the repaired file with a quoted-field-aware CSV parser
    #[arg(long, default_value = "false")]
    verify: bool,
}

const DEFAULT_INPUT: &str = "Ambiti_Territoriali_Completi.csv";
const DEFAULT_OUTPUT: &str = "Ambiti_Territoriali_Fixed.csv";

/// The 20 Italian regions, uppercased the way the export writes them.
/// A region name immediately followed by a comma marks the start of a record.
const REGIONS: &[&str] = &[
    "ABRUZZO",
    "BASILICATA",
    "CALABRIA",
    "CAMPANIA",
    "EMILIA-ROMAGNA",
    "FRIULI-VENEZIA GIULIA",
    "LAZIO",
    "LIGURIA",
    "LOMBARDIA",
    "MARCHE",
    "MOLISE",
    "PIEMONTE",
    "PUGLIA",
    "SARDEGNA",
    "SICILIA",
    "TOSCANA",
    "TRENTINO-ALTO ADIGE",
    "UMBRIA",
    "VALLE D'AOSTA",
    "VENETO",
];

/// Alternation of all region markers. Region names contain only letters,
/// hyphens, spaces and one apostrophe, so no escaping is needed.
fn region_marker_pattern() -> Result<Regex> {
    Regex::new(&format!("({}),", REGIONS.join("|"))).context("Invalid region marker pattern")
}

#[derive(Debug, Clone)]
struct Config {
    input: PathBuf,
    output: PathBuf,
}

impl Config {
    fn resolve(args: &Args) -> Self {
        let input = args.input.clone().unwrap_or_else(|| {
            PathBuf::from(std::env::var("AMBITI_CSV").unwrap_or_else(|_| DEFAULT_INPUT.to_string()))
        });
        let output = args.output.clone().unwrap_or_else(|| {
            PathBuf::from(
                std::env::var("AMBITI_CSV_FIXED").unwrap_or_else(|_| DEFAULT_OUTPUT.to_string()),
            )
        });
        Self { input, output }
    }
}

/// Read the raw export. The upstream tool sometimes emits a UTF-8 BOM;
/// encoding_rs strips it and replaces invalid sequences instead of failing.
fn read_decoded(path: &Path) -> Result<String> {
    let bytes =
        fs::read(path).with_context(|| format!("Failed to read {}", path.display()))?;
    let (text, _, had_errors) = UTF_8.decode(&bytes);
    if had_errors {
        println!("⚠ Invalid UTF-8 sequences replaced during decode");
    }
    Ok(text.into_owned())
}

// =============================================================================
// Structure analyzer - decides whether the repair pass runs at all
// =============================================================================

#[derive(Debug)]
struct CsvAnalysis {
    total_lines: usize,
    expected_cols: usize,
    broken_lines: usize,
    header: String,
}

/// Naive field count: a comma split with no quoting rules, matching what
/// the repair pass uses
fn field_count(line: &str) -> usize {
    line.split(',').count()
}

/// One pass over the raw lines: header shape, a short preview, and the
/// count of non-empty body lines whose field count disagrees with the
/// header. Pure diagnostic, the content is not modified.
fn analyze_structure(content: &str) -> CsvAnalysis {
    let lines: Vec<&str> = content.split('\n').collect();
    let header = lines.first().map(|l| l.trim()).unwrap_or("").to_string();
    let expected_cols = field_count(&header);

    println!("📋 Header: {}", header);
    println!("Expected columns: {}", expected_cols);
    println!("Total lines: {}", lines.len());

    println!("\nFirst 10 lines:");
    for (i, line) in lines.iter().take(10).enumerate() {
        let cols = field_count(line.trim());
        let status = if cols == expected_cols {
            "✓".to_string()
        } else {
            format!("✗ ({} cols)", cols)
        };
        let preview: String = line.trim().chars().take(80).collect();
        println!("  {:2}: {} {}...", i, status, preview);
    }

    let broken_lines = lines[1..]
        .iter()
        .filter(|line| !line.trim().is_empty() && field_count(line.trim()) != expected_cols)
        .count();

    println!(
        "\n⚠ Broken lines: {}/{}",
        broken_lines,
        lines.len().saturating_sub(1)
    );

    CsvAnalysis {
        total_lines: lines.len(),
        expected_cols,
        broken_lines,
        header,
    }
}

// =============================================================================
// Line-reassembly repairer
// =============================================================================

#[derive(Debug)]
struct RepairedCsv {
    /// Header plus every reconstructed record, in input order
    lines: Vec<String>,
    original_lines: usize,
}

impl RepairedCsv {
    fn record_count(&self) -> usize {
        self.lines.len().saturating_sub(1)
    }
}

/// Re-join split records. Non-empty lines are concatenated into a buffer
/// with no separator until the buffer's comma-split field count reaches the
/// header's. A buffer holding two region markers is two glued records: the
/// second marker starts the next buffer. A leftover buffer at the end is
/// flushed as-is, field count unchecked.
fn repair_lines(content: &str) -> Result<RepairedCsv> {
    let lines: Vec<&str> = content.split('\n').collect();
    let header = lines.first().copied().unwrap_or("");
    let expected_cols = field_count(header);

    let marker = region_marker_pattern()?;

    let mut fixed_lines: Vec<String> = vec![header.to_string()];
    let mut current = String::new();

    for line in lines.iter().skip(1) {
        if line.trim().is_empty() {
            continue;
        }
        current.push_str(line);

        if field_count(&current) >= expected_cols {
            let matches: Vec<_> = marker.find_iter(&current).collect();
            if matches.len() > 1 {
                // Two records glued together: cut at the second marker
                let split_point = matches[1].start();
                let complete = current[..split_point].trim().to_string();
                let rest = current[split_point..].trim().to_string();
                fixed_lines.push(complete);
                current = rest;
            } else {
                fixed_lines.push(current.trim().to_string());
                current.clear();
            }
        }
        // Below the expected count the buffer carries over to the next line
    }

    if !current.trim().is_empty() {
        fixed_lines.push(current.trim().to_string());
    }

    Ok(RepairedCsv {
        lines: fixed_lines,
        original_lines: lines.len(),
    })
}

// =============================================================================
// Verify pass - a real CSV parser, quoting rules included
// =============================================================================

/// Re-parse repaired content with the csv crate and count records whose
/// field count still disagrees with the header width
fn verify_content(content: &str, expected_cols: usize) -> Result<(usize, usize)> {
    let mut reader = csv::ReaderBuilder::new()
        .flexible(true)
        .from_reader(content.as_bytes());

    let mut records = 0;
    let mut mismatched = 0;
    for result in reader.records() {
        let record = result.context("CSV parse error in repaired file")?;
        records += 1;
        if record.len() != expected_cols {
            mismatched += 1;
        }
    }
    Ok((records, mismatched))
}

fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let args = Args::parse();
    let config = Config::resolve(&args);

    println!("=== Ambiti Territoriali Csvfix ===");
    println!("🔍 Analyzing: {}", config.input.display());

    // Read failures are the one fatal path the caller reports itself
    let content = match read_decoded(&config.input) {
        Ok(content) => content,
        Err(e) => {
            eprintln!("✗ Analysis failed: {:#}", e);
            std::process::exit(1);
        }
    };

    let analysis = analyze_structure(&content);

    if analysis.broken_lines == 0 && !args.force {
        println!("\n✓ The file already looks correct!");
        return Ok(());
    }

    println!("\n🔧 Repairing file: {}", config.input.display());
    println!("📋 Header: {}", analysis.header);
    println!("Expected columns: {}", analysis.expected_cols);

    let repaired = repair_lines(&content)?;

    fs::write(&config.output, repaired.lines.join("\n"))
        .with_context(|| format!("Failed to write {}", config.output.display()))?;

    println!("✓ Repaired file saved as: {}", config.output.display());
    println!("Original lines: {}", repaired.original_lines);
    println!("Repaired lines: {}", repaired.lines.len());
    println!("\n✓ Processed {} records", repaired.record_count());

    if args.verify {
        println!("\n🔍 Verifying with a quoted-field-aware parser...");
        let fixed = read_decoded(&config.output)?;
        let (records, mismatched) = verify_content(&fixed, analysis.expected_cols)?;
        if mismatched == 0 {
            println!("✓ All {} records match the header width", records);
        } else {
            println!("⚠ {} of {} records still off-width", mismatched, records);
        }
    }

    Ok(())
}

// =============================================================================
// TESTS
// =============================================================================
