//! External tagger invoked as a subprocess.
//!
//! ## Protocol
//! The command is run as `command [args…] <dictionary-file> <input-file>`:
//! - `dictionary-file`: `term_id<TAB>name` lines ([`Dictionary::render`]),
//!   written once per distinct dictionary under `work_dir`.
//! - `input-file`: the text to tag.
//!
//! The tagger prints one `term_id<TAB>from<TAB>to` line per hit on stdout,
//! then a final [`END_MARKER`] line. A run that exits 0 and ends with the
//! marker is complete, even with no hit lines. A run that exits non-zero, or
//! whose output stops before the marker, is retried with linear backoff.
//! Both output streams are drained concurrently while the child runs so a
//! chatty stderr can never fill its pipe and stall the child.

use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};

use sha2::{Digest, Sha256};
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::Command;
use tracing::{debug, warn};

use super::{Dictionary, TermHit};
use crate::error::AppError;
use crate::store::RetryPolicy;

/// Last line of every complete tagger run.
pub const END_MARKER: &str = "#done";

#[derive(Debug, Clone)]
pub struct ProcessTaggerConfig {
    pub command: String,
    pub args: Vec<String>,
    /// Scratch directory for dictionary and input files.
    pub work_dir: PathBuf,
    pub retry: RetryPolicy,
}

#[derive(Debug, Clone)]
pub struct ProcessTagger {
    config: ProcessTaggerConfig,
}

impl ProcessTagger {
    pub fn new(config: ProcessTaggerConfig) -> Self {
        Self { config }
    }

    pub async fn tag(&self, text: &str, dictionary: &Dictionary) -> Result<Vec<TermHit>, AppError> {
        tokio::fs::create_dir_all(&self.config.work_dir).await.map_err(|e| {
            AppError::Tagger(format!("cannot create {}: {e}", self.config.work_dir.display()))
        })?;

        let dict_path = self
            .config
            .work_dir
            .join(format!("dictionary-{}.tsv", &dictionary.fingerprint()[..16]));
        if !tokio::fs::try_exists(&dict_path).await.unwrap_or(false) {
            tokio::fs::write(&dict_path, dictionary.render()).await.map_err(|e| {
                AppError::Tagger(format!("write dictionary {}: {e}", dict_path.display()))
            })?;
            debug!(path = %dict_path.display(), terms = dictionary.len(), "dictionary file written");
        }

        let input_path = self
            .config
            .work_dir
            .join(format!("input-{}.txt", &sha256_hex(text)[..16]));
        tokio::fs::write(&input_path, text).await.map_err(|e| {
            AppError::Tagger(format!("write input {}: {e}", input_path.display()))
        })?;

        let result = self.run_with_retry(&dict_path, &input_path).await;
        if let Err(e) = tokio::fs::remove_file(&input_path).await {
            debug!(path = %input_path.display(), "cannot remove tagger input: {e}");
        }
        let stdout = result?;

        Ok(parse_hits(&stdout))
    }

    async fn run_with_retry(&self, dict_path: &Path, input_path: &Path) -> Result<String, AppError> {
        let retry = self.config.retry;
        let mut last = String::new();
        for attempt in 1..=retry.attempts() {
            let (stdout, stderr, status) = self.run_once(dict_path, input_path).await?;
            if status.success() && is_complete(&stdout) {
                return Ok(stdout);
            }
            last = if status.success() {
                format!("output ended without '{END_MARKER}': {}", stderr.trim())
            } else {
                format!("exited with {status}: {}", stderr.trim())
            };
            if attempt < retry.attempts() {
                let delay = retry.delay_after(attempt);
                warn!(
                    command = %self.config.command,
                    attempt,
                    ?delay,
                    "tagger run incomplete, retrying: {last}"
                );
                tokio::time::sleep(delay).await;
            }
        }
        Err(AppError::Tagger(format!(
            "'{}' incomplete after {} attempts, {last}",
            self.config.command,
            retry.attempts()
        )))
    }

    /// Spawn the child once and collect both streams and the exit status.
    async fn run_once(&self, dict_path: &Path, input_path: &Path) -> Result<(String, String, ExitStatus), AppError> {
        let mut child = Command::new(&self.config.command)
            .args(&self.config.args)
            .arg(dict_path)
            .arg(input_path)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| AppError::Tagger(format!("spawn '{}': {e}", self.config.command)))?;

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| AppError::Tagger("child stdout not captured".into()))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| AppError::Tagger("child stderr not captured".into()))?;

        let (out, err, status) = tokio::join!(drain(stdout), drain(stderr), child.wait());
        let status = status.map_err(|e| AppError::Tagger(format!("wait '{}': {e}", self.config.command)))?;
        Ok((out?, err?, status))
    }
}

async fn drain<R: AsyncRead + Unpin>(mut reader: R) -> Result<String, AppError> {
    let mut buf = Vec::new();
    reader
        .read_to_end(&mut buf)
        .await
        .map_err(|e| AppError::Tagger(format!("read tagger output: {e}")))?;
    Ok(String::from_utf8_lossy(&buf).into_owned())
}

fn is_complete(stdout: &str) -> bool {
    stdout.lines().map(str::trim).filter(|l| !l.is_empty()).last() == Some(END_MARKER)
}

/// Parse `term_id<TAB>from<TAB>to` lines; anything else is ignored.
fn parse_hits(stdout: &str) -> Vec<TermHit> {
    let mut hits = Vec::new();
    for line in stdout.lines() {
        if line.trim() == END_MARKER {
            continue;
        }
        let cols: Vec<&str> = line.split('\t').map(str::trim).collect();
        let parsed = match cols.as_slice() {
            [term, from, to] => match (term.parse(), from.parse(), to.parse()) {
                (Ok(term_id), Ok(from), Ok(to)) => Some(TermHit { term_id, from, to }),
                _ => None,
            },
            _ => None,
        };
        match parsed {
            Some(hit) => hits.push(hit),
            None if line.trim().is_empty() => {}
            None => debug!(line, "tagger output line ignored"),
        }
    }
    hits
}

fn sha256_hex(content: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(content.as_bytes());
    hex::encode(hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tagger::DictionaryEntry;
    use std::time::Duration;
    use tempfile::TempDir;

    fn dict() -> Dictionary {
        Dictionary::new(vec![DictionaryEntry {
            term_id: 7,
            name: "lung".into(),
            concept_id: 70,
        }])
    }

    fn tagger(tmp: &TempDir, script: &str) -> ProcessTagger {
        ProcessTagger::new(ProcessTaggerConfig {
            command: "sh".into(),
            args: vec!["-c".into(), script.into(), "tagger".into()],
            work_dir: tmp.path().join("tagger"),
            retry: RetryPolicy {
                max_attempts: 3,
                backoff: Duration::from_millis(5),
            },
        })
    }

    #[test]
    fn parses_hit_lines_and_ignores_noise() {
        let hits = parse_hits("7\t0\t4\nwarning: x\n\n8\t10\t14\n9\tbad\t1\n#done\n");
        assert_eq!(
            hits,
            vec![
                TermHit { term_id: 7, from: 0, to: 4 },
                TermHit { term_id: 8, from: 10, to: 14 },
            ]
        );
    }

    #[tokio::test]
    async fn runs_subprocess_and_reads_hits() {
        let tmp = TempDir::new().unwrap();
        // $1 = dictionary file, $2 = input file
        let t = tagger(
            &tmp,
            "test -s \"$1\" && grep -q lung \"$2\" && printf '7\\t0\\t4\\n'; echo noise >&2; echo '#done'",
        );
        let hits = t.tag("lung tissue", &dict()).await.unwrap();
        assert_eq!(hits, vec![TermHit { term_id: 7, from: 0, to: 4 }]);
    }

    #[tokio::test]
    async fn marker_without_hits_is_an_empty_result() {
        let tmp = TempDir::new().unwrap();
        let counter = tmp.path().join("count");
        let script = format!("echo x >> {}; echo '#done'", counter.display());
        let t = tagger(&tmp, &script);
        assert!(t.tag("nothing to see", &dict()).await.unwrap().is_empty());
        let runs = std::fs::read_to_string(&counter).unwrap();
        assert_eq!(runs.lines().count(), 1);
    }

    #[tokio::test]
    async fn output_without_marker_is_retried_then_fails() {
        let tmp = TempDir::new().unwrap();
        let counter = tmp.path().join("count");
        let script = format!("echo x >> {}; printf '7\\t0\\t4\\n'", counter.display());
        let t = tagger(&tmp, &script);
        let err = t.tag("lung", &dict()).await.unwrap_err();
        assert!(err.to_string().contains("incomplete after 3 attempts"));
        let runs = std::fs::read_to_string(&counter).unwrap();
        assert_eq!(runs.lines().count(), 3);
    }

    #[tokio::test]
    async fn nonzero_exit_is_retried_then_reported() {
        let tmp = TempDir::new().unwrap();
        let t = tagger(&tmp, "echo boom >&2; exit 3");
        let err = t.tag("lung", &dict()).await.unwrap_err();
        assert!(err.to_string().contains("boom"));
    }

    #[tokio::test]
    async fn flaky_run_recovers_on_retry() {
        let tmp = TempDir::new().unwrap();
        let seen = tmp.path().join("seen");
        let script = format!(
            "if [ -e {0} ]; then printf '7\\t0\\t4\\n#done\\n'; else touch {0}; exit 1; fi",
            seen.display()
        );
        let t = tagger(&tmp, &script);
        assert_eq!(t.tag("lung", &dict()).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn large_stderr_does_not_deadlock() {
        let tmp = TempDir::new().unwrap();
        // ~1 MiB on stderr, far beyond a pipe buffer, before any stdout.
        let t = tagger(
            &tmp,
            "head -c 1048576 /dev/zero | tr '\\0' x >&2; printf '7\\t0\\t4\\n#done\\n'",
        );
        let hits = t.tag("lung", &dict()).await.unwrap();
        assert_eq!(hits.len(), 1);
    }
}
