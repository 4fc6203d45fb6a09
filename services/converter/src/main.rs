//! Converter Service - Turns the Ambiti Territoriali workbook into the site dataset
//!
//! Responsibilities:
//! - Load every sheet of the source workbook and combine them into one table
//! - Report structure statistics (columns, nulls, distributions)
//! - Rename source columns to the canonical names the site expects
//! - Group rows by (Regione, Provincia, Ente, Comune capofila)
//! - Emit data_new.json with a metadata envelope
//!
//! CRITICAL: This service must be DETERMINISTIC
//! Same workbook + same converter version = same output (modulo createdAt)

use anyhow::{Context, Result};
use calamine::{open_workbook_auto, Data, Range, Reader};
use chrono::{SecondsFormat, Utc};
use clap::Parser;
use serde::Serialize;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::fs;
use std::path::{Path, PathBuf};

#[derive(Parser, Debug)]
#[command(name = "converter", about = "Converts the Ambiti Territoriali workbook into site JSON")]
struct Args {
    /// Path to the source workbook (.xlsx)
    #[arg(long)]
    input: Option<PathBuf>,

    /// Path for the JSON output
    #[arg(long)]
    output: Option<PathBuf>,

    /// Dry run - analyze and convert, don't write the JSON file
    #[arg(long, default_value = "false")]
    dry_run: bool,
}

const DEFAULT_INPUT: &str =
    "911_Estrazione-Ambiti-con-competenze-territoriali-_11-settembre-2025.xlsx";
const DEFAULT_OUTPUT: &str = "data_new.json";

/// Synthetic column tagging each row with the sheet it came from
const SHEET_COLUMN: &str = "FoglioOrigine";

/// Source column -> canonical name used by the site.
/// "Indirizzo Ambito " really does end with a space in the workbook;
/// the match must be exact.
const COLUMN_MAPPING: &[(&str, &str)] = &[
    ("REGIONE", "Regione"),
    ("Nominativo Ambito TERRITORIALE", "Ente"),
    ("Indirizzo Ambito ", "Indirizzo_Ente"),
    ("ProvinciaAmbito", "Provincia"),
    ("Comune capofila Ambito Territoriale", "Comune_Ambito"),
    ("Comune Competenza Territoriale", "Comune_Competenza"),
    ("CAP di Competenza Territoriale", "CAP"),
    ("Cod Competenza Territoriale", "Codice"),
];

#[derive(Debug, Clone)]
struct Config {
    input: PathBuf,
    output: PathBuf,
}

impl Config {
    fn resolve(args: &Args) -> Self {
        let input = args.input.clone().unwrap_or_else(|| {
            PathBuf::from(std::env::var("AMBITI_XLSX").unwrap_or_else(|_| DEFAULT_INPUT.to_string()))
        });
        let output = args.output.clone().unwrap_or_else(|| {
            PathBuf::from(std::env::var("AMBITI_JSON").unwrap_or_else(|_| DEFAULT_OUTPUT.to_string()))
        });
        Self { input, output }
    }
}

// =============================================================================
// Combined table model
// =============================================================================

/// One row of the combined table: column name -> cell text.
/// Missing and empty cells are both stored as empty strings.
type Row = HashMap<String, String>;

/// All sheets concatenated into one flat table
#[derive(Debug, Default)]
struct CombinedTable {
    /// Column order as first seen across sheets, sheet column last
    columns: Vec<String>,
    rows: Vec<Row>,
}

/// Raw cells of a single sheet, already stringified
#[derive(Debug)]
struct SheetData {
    name: String,
    columns: Vec<String>,
    rows: Vec<Vec<String>>,
}

/// Render a cell the way the site expects it: numeric cells lose the
/// spurious trailing ".0" (CAP values arrive as floats), empty cells
/// become "".
fn cell_to_string(cell: &Data) -> String {
    match cell {
        Data::Empty => String::new(),
        Data::String(s) => s.trim().to_string(),
        Data::Float(f) if f.is_finite() && f.fract() == 0.0 => format!("{}", *f as i64),
        Data::Float(f) => f.to_string(),
        Data::Int(i) => i.to_string(),
        other => format!("{}", other),
    }
}

/// Extract headers and data rows from a worksheet range
fn sheet_from_range(name: &str, range: &Range<Data>) -> SheetData {
    let mut rows_iter = range.rows();
    let columns: Vec<String> = rows_iter
        .next()
        .map(|r| r.iter().map(cell_to_string).collect())
        .unwrap_or_default();
    let rows: Vec<Vec<String>> = rows_iter
        .map(|r| r.iter().map(cell_to_string).collect())
        .collect();
    SheetData {
        name: name.to_string(),
        columns,
        rows,
    }
}

/// Load every sheet of the workbook in sheet order
fn load_workbook_sheets(path: &Path) -> Result<Vec<SheetData>> {
    println!("🔍 Analyzing file: {}", path.display());

    let mut workbook = open_workbook_auto(path)
        .with_context(|| format!("Failed to open workbook {}", path.display()))?;

    let sheet_names = workbook.sheet_names().to_vec();
    if sheet_names.is_empty() {
        anyhow::bail!("Workbook has no sheets");
    }

    println!("Sheets in file: {}", sheet_names.len());
    println!("Sheet names: {:?}", sheet_names);

    let mut sheets = Vec::new();
    for sheet_name in &sheet_names {
        println!("\n📋 Reading sheet: '{}'", sheet_name);
        let range = workbook
            .worksheet_range(sheet_name)
            .with_context(|| format!("Failed to read sheet '{}'", sheet_name))?;

        let sheet = sheet_from_range(sheet_name, &range);
        println!("  Rows: {}", sheet.rows.len());
        println!("  Columns: {:?}", sheet.columns);
        sheets.push(sheet);
    }

    Ok(sheets)
}

/// Concatenate sheets into one flat table, preserving sheet order and row
/// order within each sheet. Every row is tagged with its sheet name under
/// the FoglioOrigine column.
fn combine_sheets(sheets: Vec<SheetData>) -> CombinedTable {
    let mut columns: Vec<String> = Vec::new();
    let mut rows: Vec<Row> = Vec::new();

    for sheet in &sheets {
        for col in &sheet.columns {
            if !col.is_empty() && !columns.contains(col) {
                columns.push(col.clone());
            }
        }
        for raw in &sheet.rows {
            let mut row = Row::new();
            for (idx, col) in sheet.columns.iter().enumerate() {
                if col.is_empty() {
                    continue;
                }
                row.insert(col.clone(), raw.get(idx).cloned().unwrap_or_default());
            }
            row.insert(SHEET_COLUMN.to_string(), sheet.name.clone());
            rows.push(row);
        }
    }

    columns.push(SHEET_COLUMN.to_string());
    CombinedTable { columns, rows }
}

// =============================================================================
// Statistics reporter - diagnostic only, nothing here feeds the conversion
// =============================================================================

/// Cell text for a column, empty string when the column is absent
fn field<'a>(row: &'a Row, name: &str) -> &'a str {
    row.get(name).map(String::as_str).unwrap_or("")
}

/// Distinct values of a column with their frequencies, count-descending
/// then name-ascending so the report is deterministic
fn value_counts(table: &CombinedTable, column: &str) -> Vec<(String, usize)> {
    let mut counts: HashMap<&str, usize> = HashMap::new();
    for row in &table.rows {
        *counts.entry(field(row, column)).or_insert(0) += 1;
    }
    let mut entries: Vec<(String, usize)> = counts
        .into_iter()
        .map(|(v, c)| (v.to_string(), c))
        .collect();
    entries.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
    entries
}

/// First column whose name contains "regione" or "direzione"
fn find_region_column(table: &CombinedTable) -> Option<&String> {
    table.columns.iter().find(|col| {
        let lower = col.to_lowercase();
        lower.contains("regione") || lower.contains("direzione")
    })
}

fn print_table_stats(table: &CombinedTable) {
    println!("\n🔗 Combined table:");
    println!("  Total rows: {}", table.rows.len());
    println!("  Columns: {}", table.columns.len());

    println!("\nColumns present:");
    for (i, col) in table.columns.iter().enumerate() {
        println!("  {:2}. {}", i + 1, col);
    }

    println!("\n📈 Per-column statistics:");
    for col in &table.columns {
        if col == SHEET_COLUMN {
            continue;
        }
        let mut null_count = 0;
        let mut unique: HashSet<&str> = HashSet::new();
        for row in &table.rows {
            let value = field(row, col);
            if value.is_empty() {
                null_count += 1;
            } else {
                unique.insert(value);
            }
        }
        println!("  • {}: {} unique values, {} null", col, unique.len(), null_count);
    }

    if let Some(region_col) = find_region_column(table) {
        println!("\n🗺️ Distribution by {}:", region_col);
        for (value, count) in value_counts(table, region_col) {
            println!("  • {}: {} records", value, count);
        }
    }

    println!("\n📊 Distribution by sheet:");
    for (sheet, count) in value_counts(table, SHEET_COLUMN) {
        println!("  • {}: {} records", sheet, count);
    }
}

// =============================================================================
// Column renamer
// =============================================================================

/// Apply the fixed source -> canonical mapping. Unmapped columns pass
/// through unchanged; a mapped column that is absent is a no-op.
fn rename_columns(table: &mut CombinedTable) {
    for (from, to) in COLUMN_MAPPING {
        let Some(pos) = table.columns.iter().position(|c| c == from) else {
            continue;
        };
        table.columns[pos] = (*to).to_string();
        for row in &mut table.rows {
            if let Some(value) = row.remove(*from) {
                row.insert((*to).to_string(), value);
            }
        }
        println!("  • {} → {}", from, to);
    }
}

// =============================================================================
// Grouper / record builder
// =============================================================================

/// Managing-entity details, taken from the first row of each group
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
struct DettaglioEnte {
    ente: String,
    indirizzo: String,
    comune_capofila: String,
    provincia: String,
}

/// One comune served by an ambito, with its postal and competency codes
#[derive(Debug, Clone, PartialEq, Serialize)]
struct DettaglioComune {
    comune: String,
    cap: String,
    codice: String,
}

/// One ambito territoriale: the managing entity plus every comune in its
/// catchment
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct AmbitoRecord {
    regione: String,
    provincia: String,
    numero_comuni: usize,
    dettaglio_ente: DettaglioEnte,
    comuni_competenza: Vec<String>,
    dettagli_comuni: Vec<DettaglioComune>,
}

/// Grouping key: (Regione, Provincia, Ente, Comune_Ambito). Rows with a
/// missing field group under the empty string so no input row is dropped.
type GroupKey = (String, String, String, String);

/// Fold the combined table into one record per ambito. BTreeMap iteration
/// gives the key's natural sort order, so output order is deterministic.
fn group_records(table: &CombinedTable) -> Vec<AmbitoRecord> {
    let mut groups: BTreeMap<GroupKey, Vec<&Row>> = BTreeMap::new();
    for row in &table.rows {
        let key = (
            field(row, "Regione").to_string(),
            field(row, "Provincia").to_string(),
            field(row, "Ente").to_string(),
            field(row, "Comune_Ambito").to_string(),
        );
        groups.entry(key).or_default().push(row);
    }

    let mut records = Vec::with_capacity(groups.len());
    for ((regione, provincia, ente, comune_capofila), rows) in &groups {
        // Distinct comuni in first-seen order
        let mut comuni_competenza: Vec<String> = Vec::new();
        for row in rows {
            let comune = field(row, "Comune_Competenza");
            if !comuni_competenza.iter().any(|c| c == comune) {
                comuni_competenza.push(comune.to_string());
            }
        }
        let numero_comuni = comuni_competenza.len();

        // The ente-level fields repeat across the group; the first row is
        // the representative
        let primo = rows[0];
        let dettaglio_ente = DettaglioEnte {
            ente: ente.clone(),
            indirizzo: field(primo, "Indirizzo_Ente").to_string(),
            comune_capofila: comune_capofila.clone(),
            provincia: provincia.clone(),
        };

        // Detail list, deduplicated by full equality. Linear scan against
        // the accumulated list; groups are tens of rows, not thousands.
        let mut dettagli_comuni: Vec<DettaglioComune> = Vec::new();
        for row in rows {
            let dettaglio = DettaglioComune {
                comune: field(row, "Comune_Competenza").to_string(),
                cap: field(row, "CAP").to_string(),
                codice: field(row, "Codice").to_string(),
            };
            if !dettagli_comuni.contains(&dettaglio) {
                dettagli_comuni.push(dettaglio);
            }
        }

        println!(
            "✓ Processed: {} ({}) - {} - {} comuni",
            regione, provincia, ente, numero_comuni
        );

        records.push(AmbitoRecord {
            regione: regione.clone(),
            provincia: provincia.clone(),
            numero_comuni,
            dettaglio_ente,
            comuni_competenza,
            dettagli_comuni,
        });
    }

    records
}

// =============================================================================
// Document assembler & writer
// =============================================================================

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct Metadata {
    title: String,
    description: String,
    version: String,
    created_at: String,
    record_count: usize,
    source_file: String,
    total_records: usize,
    regions_included: Vec<String>,
}

#[derive(Debug, Serialize)]
struct Document {
    metadata: Metadata,
    ambiti_territoriali: Vec<AmbitoRecord>,
}

/// Wrap the records in the metadata envelope the site consumes
fn build_document(
    table: &CombinedTable,
    records: Vec<AmbitoRecord>,
    source_file: &str,
) -> Document {
    // Distinct regions in first-seen order
    let mut regions: Vec<String> = Vec::new();
    for row in &table.rows {
        let regione = field(row, "Regione");
        if !regions.iter().any(|r| r == regione) {
            regions.push(regione.to_string());
        }
    }

    Document {
        metadata: Metadata {
            title: "Ambiti Territoriali Italiani - Dataset Completo".to_string(),
            description:
                "Dati completi degli ambiti territoriali con enti gestori e comuni di competenza"
                    .to_string(),
            version: "2.0.0".to_string(),
            created_at: Utc::now().to_rfc3339_opts(SecondsFormat::Micros, true),
            record_count: records.len(),
            source_file: source_file.to_string(),
            total_records: table.rows.len(),
            regions_included: regions,
        },
        ambiti_territoriali: records,
    }
}

/// Serialize with human-readable indentation, non-ASCII preserved literally
fn write_document(doc: &Document, path: &Path) -> Result<()> {
    let json = serde_json::to_string_pretty(doc).context("Failed to serialize document")?;
    fs::write(path, json).with_context(|| format!("Failed to write {}", path.display()))?;
    Ok(())
}

fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let args = Args::parse();
    let config = Config::resolve(&args);

    println!("=== Ambiti Territoriali Converter ===");
    println!("Input: {}", config.input.display());
    println!("Output: {}", config.output.display());
    println!("Mode: {}", if args.dry_run { "dry-run" } else { "live" });

    // Load failures are the one fatal path the caller reports itself
    let sheets = match load_workbook_sheets(&config.input) {
        Ok(sheets) => sheets,
        Err(e) => {
            eprintln!("✗ Analysis failed: {:#}", e);
            std::process::exit(1);
        }
    };

    let mut table = combine_sheets(sheets);
    print_table_stats(&table);

    println!("\n🔄 Converting to JSON format...");
    println!("Renamed columns:");
    rename_columns(&mut table);

    let records = group_records(&table);

    let source_file = config
        .input
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_else(|| config.input.display().to_string());
    let doc = build_document(&table, records, &source_file);

    if args.dry_run {
        println!("\nDry run - JSON not written");
        println!("Would write {} ambiti territoriali", doc.metadata.record_count);
        return Ok(());
    }

    // Write failures propagate: nothing below here catches them
    write_document(&doc, &config.output)?;

    println!("\n✓ JSON file saved: {}", config.output.display());
    println!("Records processed: {} ambiti territoriali", doc.metadata.record_count);
    println!("Source rows: {}", doc.metadata.total_records);
    println!("\n=== Conversion Complete ===");
    println!("Ready for site integration");

    Ok(())
}

// =============================================================================
// TESTS
// =============================================================================
