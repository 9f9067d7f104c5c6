// 📤 Sink Writer - publishes final snapshots as delimited text files
//
// Every table is serialized to a hidden staging file first. Files are renamed
// into place only after all of them were written. Staged files are removed on
// any failure, including a rename that fails partway through.

use crate::checkpoint::Snapshot;
use crate::config::{delimiter_byte, OutputEncoding, SinkOptions};
use crate::error::{PipelineError, SinkError};
use crate::report::TransformReport;
use serde::Serialize;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

pub const REPORT_FILE: &str = "relatorio_execucao.json";

// ============================================================================
// ENCODING
// ============================================================================

/// Latin-1 has no code points above U+00FF; those become '?'
pub fn encode_latin1(text: &str) -> Vec<u8> {
    text.chars()
        .map(|c| if (c as u32) <= 0xFF { c as u32 as u8 } else { b'?' })
        .collect()
}

/// Re-delimit a snapshot payload and apply header/encoding options
pub fn render(snapshot: &Snapshot, options: &SinkOptions, delimiter: u8) -> Result<Vec<u8>, SinkError> {
    let mut reader = csv::ReaderBuilder::new()
        .has_headers(false)
        .from_reader(snapshot.payload.as_bytes());
    let mut writer = csv::WriterBuilder::new()
        .delimiter(delimiter)
        .from_writer(Vec::new());

    for (idx, record) in reader.records().enumerate() {
        let record = record?;
        if idx == 0 && !options.header {
            continue;
        }
        writer.write_record(&record)?;
    }

    let bytes = writer.into_inner().map_err(|e| SinkError::Buffer {
        table: snapshot.table.clone(),
        source: e.into_error(),
    })?;

    Ok(match options.encoding {
        OutputEncoding::Utf8 => bytes,
        OutputEncoding::Latin1 => encode_latin1(&String::from_utf8(bytes)?),
    })
}

// ============================================================================
// CSV SINK
// ============================================================================

pub struct CsvSink {
    dir: PathBuf,
    options: SinkOptions,
    delimiter: u8,
}

impl CsvSink {
    pub fn new<P: AsRef<Path>>(dir: P, options: SinkOptions) -> Result<Self, PipelineError> {
        let delimiter = delimiter_byte(options.delimiter)?;
        Ok(CsvSink {
            dir: dir.as_ref().to_path_buf(),
            options,
            delimiter,
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn path_for(&self, table: &str) -> PathBuf {
        self.dir.join(format!("{}.csv", table))
    }

    fn staging_path(&self, file_name: &str) -> PathBuf {
        self.dir.join(format!(".{}.tmp", file_name))
    }

    /// Publish every snapshot plus the run report
    pub fn publish<R: Serialize>(
        &self,
        snapshots: &[Snapshot],
        report: &R,
    ) -> Result<Vec<PathBuf>, SinkError> {
        fs::create_dir_all(&self.dir).map_err(|source| SinkError::Io {
            path: self.dir.clone(),
            source,
        })?;

        let mut staged: Vec<(PathBuf, PathBuf)> = Vec::new();
        if let Err(err) = self.stage_all(snapshots, report, &mut staged) {
            warn!(error = %err, "sink staging failed, discarding staged files");
            discard(&staged);
            return Err(err);
        }

        let mut published = Vec::with_capacity(staged.len());
        for (idx, (tmp, target)) in staged.iter().enumerate() {
            if let Err(source) = fs::rename(tmp, target) {
                warn!(
                    target = %target.display(),
                    published = published.len(),
                    "rename failed, discarding remaining staged files"
                );
                discard(&staged[idx..]);
                return Err(SinkError::Io {
                    path: target.clone(),
                    source,
                });
            }
            published.push(target.clone());
        }

        info!(dir = %self.dir.display(), files = published.len(), "outputs published");
        Ok(published)
    }

    fn stage_all<R: Serialize>(
        &self,
        snapshots: &[Snapshot],
        report: &R,
        staged: &mut Vec<(PathBuf, PathBuf)>,
    ) -> Result<(), SinkError> {
        for snapshot in snapshots {
            let bytes = render(snapshot, &self.options, self.delimiter)?;
            let target = self.path_for(&snapshot.table);
            let tmp = self.staging_path(&format!("{}.csv", snapshot.table));
            write_file(&tmp, &bytes)?;
            staged.push((tmp, target));
        }

        let json = serde_json::to_vec_pretty(report)?;
        let tmp = self.staging_path(REPORT_FILE);
        write_file(&tmp, &json)?;
        staged.push((tmp, self.dir.join(REPORT_FILE)));
        Ok(())
    }
}

fn discard(staged: &[(PathBuf, PathBuf)]) {
    for (tmp, _) in staged {
        let _ = fs::remove_file(tmp);
    }
}

fn write_file(path: &Path, bytes: &[u8]) -> Result<(), SinkError> {
    fs::write(path, bytes).map_err(|source| SinkError::Io {
        path: path.to_path_buf(),
        source,
    })
}

/// Load a report written by a previous run
pub fn read_report(path: &Path) -> Result<TransformReport, SinkError> {
    let text = fs::read_to_string(path).map_err(|source| SinkError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    Ok(serde_json::from_str(&text)?)
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::checkpoint::TableRow;

    #[derive(Serialize)]
    struct Row {
        cod_agencia: i64,
        nome: String,
    }

    impl TableRow for Row {
        const COLUMNS: &'static [&'static str] = &["cod_agencia", "nome"];
    }

    fn snapshot() -> Snapshot {
        Snapshot::from_records(
            "agencias_tratado",
            &[
                Row {
                    cod_agencia: 1,
                    nome: "São Paulo; Centro".to_string(),
                },
                Row {
                    cod_agencia: 2,
                    nome: "Łódź".to_string(),
                },
            ],
        )
        .unwrap()
    }

    #[test]
    fn test_render_with_delimiter_and_no_header() {
        let options = SinkOptions {
            delimiter: ';',
            encoding: OutputEncoding::Utf8,
            header: false,
        };
        let bytes = render(&snapshot(), &options, b';').unwrap();
        let text = String::from_utf8(bytes).unwrap();

        assert_eq!(text, "1;\"São Paulo; Centro\"\n2;Łódź\n");
    }

    #[test]
    fn test_render_latin1() {
        let options = SinkOptions {
            delimiter: ',',
            encoding: OutputEncoding::Latin1,
            header: true,
        };
        let bytes = render(&snapshot(), &options, b',').unwrap();

        // 'ã' is a single byte in Latin-1; 'Ł' has no Latin-1 form
        assert!(bytes.contains(&0xE3));
        assert!(bytes.starts_with(b"cod_agencia,nome\n"));
        assert!(bytes.windows(3).any(|w| w == b"?\xF3d"));
    }

    #[test]
    fn test_publish_writes_tables_and_report() {
        let dir = tempfile::tempdir().unwrap();
        let sink = CsvSink::new(dir.path().join("out"), SinkOptions::default()).unwrap();
        let report = TransformReport::new("run-1", "2024-01-31");

        let paths = sink.publish(&[snapshot()], &report).unwrap();

        assert_eq!(paths.len(), 2);
        let text = fs::read_to_string(sink.path_for("agencias_tratado")).unwrap();
        assert!(text.starts_with("cod_agencia,nome\n"));
        let loaded = read_report(&sink.dir().join(REPORT_FILE)).unwrap();
        assert_eq!(loaded.run_id, "run-1");

        let leftovers: Vec<_> = fs::read_dir(sink.dir())
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().ends_with(".tmp"))
            .collect();
        assert!(leftovers.is_empty());
    }

    #[test]
    fn test_publish_failure_leaves_no_outputs() {
        let dir = tempfile::tempdir().unwrap();
        let sink = CsvSink::new(dir.path(), SinkOptions::default()).unwrap();
        // A directory squatting on the report staging path makes the write fail
        fs::create_dir(dir.path().join(format!(".{}.tmp", REPORT_FILE))).unwrap();
        let report = TransformReport::new("run-1", "2024-01-31");

        let result = sink.publish(&[snapshot()], &report);

        assert!(result.is_err());
        assert!(!sink.path_for("agencias_tratado").exists());
        assert!(!dir.path().join(".agencias_tratado.csv.tmp").exists());
    }

    #[test]
    fn test_failed_rename_removes_staged_files() {
        let dir = tempfile::tempdir().unwrap();
        let sink = CsvSink::new(dir.path(), SinkOptions::default()).unwrap();
        // A non-empty directory on the report path makes its rename fail
        let blocker = dir.path().join(REPORT_FILE);
        fs::create_dir(&blocker).unwrap();
        fs::write(blocker.join("keep"), b"x").unwrap();
        let report = TransformReport::new("run-1", "2024-01-31");

        let result = sink.publish(&[snapshot()], &report);

        assert!(matches!(result, Err(SinkError::Io { .. })));
        let leftovers: Vec<_> = fs::read_dir(dir.path())
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().ends_with(".tmp"))
            .collect();
        assert!(leftovers.is_empty());
    }

    #[test]
    fn test_multibyte_delimiter_rejected() {
        let options = SinkOptions {
            delimiter: '§',
            ..SinkOptions::default()
        };
        assert!(CsvSink::new("out", options).is_err());
    }
}
