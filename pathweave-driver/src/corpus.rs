// SPDX-License-Identifier: Apache-2.0

//! Seed input and generated-test output files.

use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::Path;

use anyhow::Context;
use pathweave::TestCase;

/// Newline-delimited seeds: each non-empty line not starting with `#` is the
/// payload of one seed test.
pub fn read_seeds(path: &Path) -> anyhow::Result<Vec<TestCase>> {
    let f = std::fs::File::open(path)
        .with_context(|| format!("open seeds file {}", path.display()))?;
    let mut seeds = Vec::new();
    for (lineno, line) in BufReader::new(f).lines().enumerate() {
        let line = line?;
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        seeds.push(TestCase::seed(format!("seed-{}", lineno + 1), line));
    }
    Ok(seeds)
}

/// Appends `tests` as JSON lines, creating the file if needed.
pub fn append_tests(path: &Path, tests: &[TestCase]) -> anyhow::Result<()> {
    let f = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .with_context(|| format!("open tests output {}", path.display()))?;
    let mut w = BufWriter::new(f);
    for test in tests {
        serde_json::to_writer(&mut w, test)?;
        writeln!(w)?;
    }
    w.flush()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use pathweave::PathCondition;
    use pretty_assertions::assert_eq;

    #[test]
    fn seeds_skip_blank_and_comment_lines() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("seeds.txt");
        std::fs::write(&path, "# initial inputs\nx=1\n\n  y=2  \n").unwrap();
        let seeds = read_seeds(&path).unwrap();
        assert_eq!(
            seeds,
            vec![TestCase::seed("seed-2", "x=1"), TestCase::seed("seed-4", "y=2")]
        );
    }

    #[test]
    fn missing_seeds_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        assert!(read_seeds(&dir.path().join("nope.txt")).is_err());
    }

    #[test]
    fn tests_are_appended_as_json_lines() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tests.jsonl");
        let generated = TestCase {
            id: "g1".to_string(),
            payload: "x=-1".to_string(),
            generating_condition: Some(PathCondition::new(vec!["x <= 0".to_string()])),
            depth: 1,
        };
        append_tests(&path, &[generated.clone()]).unwrap();
        append_tests(&path, &[TestCase::seed("s", "x=1")]).unwrap();

        let text = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines.len(), 2);
        let first: TestCase = serde_json::from_str(lines[0]).unwrap();
        assert_eq!(first, generated);
        assert!(!lines[1].contains("generating_condition"));
    }
}
