use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::PathBuf;

use anyhow::Context;
use cloudbench_core::prelude::IterationResult;

use crate::report::ReportCollector;

/// Write every iteration result to a file as one JSON object per line.
///
/// Lines are written in the order results reach the consumer, which is not globally ordered by
/// timestamp.
pub struct JsonlResultCollector {
    path: PathBuf,
    writer: BufWriter<File>,
    written: usize,
    failed: bool,
}

impl JsonlResultCollector {
    pub fn new(path: PathBuf) -> anyhow::Result<Self> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).with_context(|| {
                    format!("Failed to create directory for results file {}", path.display())
                })?;
            }
        }

        let file = std::fs::OpenOptions::new()
            .append(true)
            .create(true)
            .open(&path)
            .with_context(|| format!("Failed to open results file {}", path.display()))?;

        Ok(Self {
            path,
            writer: BufWriter::new(file),
            written: 0,
            failed: false,
        })
    }

    fn write_result(&mut self, result: &IterationResult) -> anyhow::Result<()> {
        serde_json::to_writer(&mut self.writer, result)?;
        self.writer.write_all(b"\n")?;
        Ok(())
    }
}

impl ReportCollector for JsonlResultCollector {
    fn add_iteration(&mut self, result: &IterationResult) {
        if self.failed {
            return;
        }

        match self.write_result(result) {
            Ok(()) => self.written += 1,
            Err(e) => {
                // Only log once, a broken file would otherwise flood the log.
                log::error!("Failed to write result to {}: {:?}", self.path.display(), e);
                self.failed = true;
            }
        }
    }

    fn finalize(&mut self) {
        if let Err(e) = self.writer.flush() {
            log::error!("Failed to flush results file {}: {:?}", self.path.display(), e);
            return;
        }

        log::info!("Wrote {} results to {}", self.written, self.path.display());
    }
}

#[cfg(test)]
mod tests {
    use std::io::BufRead;

    use cloudbench_core::prelude::Output;
    use tempfile::TempDir;

    use super::*;

    #[test]
    fn writes_one_line_per_result() {
        let dir = TempDir::new().expect("failed to create temp dir");
        let path = dir.path().join("nested").join("results.jsonl");

        let mut collector = JsonlResultCollector::new(path.clone()).unwrap();
        for index in 0..3 {
            collector.add_iteration(&IterationResult {
                index,
                timestamp: index as f64,
                duration: 0.5,
                idle_duration: 0.0,
                error: None,
                atomic_actions: Vec::new(),
                output: Output::default(),
            });
        }
        collector.finalize();

        let file = File::open(path).unwrap();
        let lines = std::io::BufReader::new(file)
            .lines()
            .map(|l| l.unwrap())
            .collect::<Vec<_>>();
        assert_eq!(3, lines.len());

        let first: IterationResult = serde_json::from_str(&lines[0]).unwrap();
        assert_eq!(0, first.index);
        assert_eq!(0.5, first.duration);
    }
}
