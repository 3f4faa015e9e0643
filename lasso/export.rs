//! Persistence of a finished `Solution`.
//!
//! Export is an explicit call made by the caller after solving. The whole solution
//! goes to one TOML file that `load` reads back; the tabular parts are also written
//! as CSV for downstream plotting.

use crate::solution::Solution;
use csv::WriterBuilder;
use std::fs;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ExportError {
    #[error("I/O error while exporting: {0}")]
    Io(#[from] std::io::Error),
    #[error("Failed to serialize the solution to TOML: {0}")]
    TomlSerialize(#[from] toml::ser::Error),
    #[error("Failed to parse a solution TOML file: {0}")]
    TomlParse(#[from] toml::de::Error),
    #[error("Failed to write CSV output: {0}")]
    Csv(#[from] csv::Error),
}

/// Destination directory and a file-name prefix for every artifact.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExportSink {
    pub directory: PathBuf,
    pub prefix: String,
}

impl ExportSink {
    pub fn new(directory: impl Into<PathBuf>, prefix: impl Into<String>) -> Self {
        Self {
            directory: directory.into(),
            prefix: prefix.into(),
        }
    }

    fn file(&self, name: &str) -> PathBuf {
        self.directory.join(format!("{}{}", self.prefix, name))
    }
}

/// Writes `solution` to `sink` and returns the paths written, TOML first.
pub fn export(solution: &Solution, sink: &ExportSink) -> Result<Vec<PathBuf>, ExportError> {
    fs::create_dir_all(&sink.directory)?;
    let mut written = Vec::new();

    let toml_path = sink.file("solution.toml");
    let toml_string = toml::to_string_pretty(solution)?;
    let mut file = BufWriter::new(fs::File::create(&toml_path)?);
    file.write_all(toml_string.as_bytes())?;
    file.flush()?;
    written.push(toml_path);

    if let Some(path) = &solution.path {
        let target = sink.file("path.csv");
        let mut header = vec!["lambda".to_string(), "relative_lambda".to_string()];
        header.extend(solution.labels.iter().cloned());
        header.push("converged".to_string());
        let rows = path.points.iter().map(|p| {
            let mut row = vec![format!("{:.12e}", p.lambda), format!("{:.12e}", p.relative_lambda)];
            row.extend(p.beta.iter().map(|b| format!("{b:.12e}")));
            row.push(p.converged.to_string());
            row
        });
        write_table(&target, &header, rows)?;
        written.push(target);
    }

    if let Some(cv) = &solution.cv {
        let target = sink.file("cv.csv");
        let header = ["lambda", "relative_lambda", "mean_error", "standard_error", "selected"]
            .map(String::from);
        let rows = (0..cv.lambdas.len()).map(|i| {
            vec![
                format!("{:.12e}", cv.lambdas[i]),
                format!("{:.12e}", cv.relative_lambdas[i]),
                format!("{:.12e}", cv.mean_error[i]),
                format!("{:.12e}", cv.standard_error[i]),
                (i == cv.selected_index).to_string(),
            ]
        });
        write_table(&target, &header, rows)?;
        written.push(target);
    }

    if let Some(stability) = &solution.stability {
        let target = sink.file("stability.csv");
        let header = ["label", "frequency", "selected"].map(String::from);
        let rows = solution.labels.iter().enumerate().map(|(j, label)| {
            vec![
                label.clone(),
                format!("{:.6}", stability.frequencies[j]),
                stability.selected.contains(&j).to_string(),
            ]
        });
        write_table(&target, &header, rows)?;
        written.push(target);

        if let (Some(lambdas), Some(frequencies)) =
            (&stability.path_lambdas, &stability.path_frequencies)
        {
            let target = sink.file("stability-path.csv");
            let mut header = vec!["lambda".to_string()];
            header.extend(solution.labels.iter().cloned());
            let rows = lambdas.iter().zip(frequencies.rows()).map(|(lambda, row)| {
                let mut record = vec![format!("{lambda:.12e}")];
                record.extend(row.iter().map(|f| format!("{f:.6}")));
                record
            });
            write_table(&target, &header, rows)?;
            written.push(target);
        }
    }

    for path in &written {
        log::info!("Wrote {}", path.display());
    }
    Ok(written)
}

/// Reads back a solution written by `export`.
pub fn load(path: &Path) -> Result<Solution, ExportError> {
    let toml_string = fs::read_to_string(path)?;
    let solution = toml::from_str(&toml_string)?;
    Ok(solution)
}

fn write_table<I>(path: &Path, header: &[String], rows: I) -> Result<(), ExportError>
where
    I: Iterator<Item = Vec<String>>,
{
    let mut writer = WriterBuilder::new().has_headers(true).from_path(path)?;
    writer.write_record(header)?;
    for row in rows {
        writer.write_record(&row)?;
    }
    writer.flush()?;
    Ok(())
}
