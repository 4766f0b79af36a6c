//! Bounded pool around the external headless document converter.
//!
//! The semaphore here is the only hard admission-control gate in the system:
//! batch and interactive rendering both pass through it, because the
//! underlying converter process is the scarce resource.

use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::Duration;

use tokio::process::Command;
use tokio::sync::Semaphore;

use docforge_core::{CorrelationId, GenerationError, OutputFormat};

/// External converter invocation.
///
/// Argument templates may use `{input}`, `{output}`, `{outdir}` and
/// `{format}` placeholders; a join argument equal to `{inputs}` expands to
/// one argument per part file, in order.
#[derive(Debug, Clone)]
pub struct ConverterConfig {
    pub binary: String,
    pub convert_args: Vec<String>,
    pub join_binary: String,
    pub join_args: Vec<String>,
    /// Bytes inserted as a separator document between concatenated parts
    /// when a section break is requested.
    pub section_break_bytes: Option<Vec<u8>>,
    /// Hard per-job deadline; the child process is killed on expiry.
    pub timeout: Duration,
    /// Parent directory for per-job working directories (system temp when
    /// unset).
    pub work_root: Option<PathBuf>,
}

impl Default for ConverterConfig {
    fn default() -> Self {
        Self {
            binary: "soffice".to_string(),
            convert_args: vec![
                "--headless".to_string(),
                "--convert-to".to_string(),
                "{format}".to_string(),
                "--outdir".to_string(),
                "{outdir}".to_string(),
                "{input}".to_string(),
            ],
            join_binary: "pdfunite".to_string(),
            join_args: vec!["{inputs}".to_string(), "{output}".to_string()],
            section_break_bytes: None,
            timeout: Duration::from_secs(60),
            work_root: None,
        }
    }
}

/// Pool observability counters.
#[derive(Debug, Clone, Default, serde::Serialize)]
pub struct PoolStats {
    pub active_jobs: usize,
    pub queued_jobs: usize,
    pub completed_jobs: u64,
    pub failed_jobs: u64,
}

/// Concurrency-bounded converter pool.
pub struct ConversionPool {
    config: ConverterConfig,
    semaphore: Semaphore,
    stats: Mutex<PoolStats>,
}

impl ConversionPool {
    pub fn new(config: ConverterConfig, max_concurrent: usize) -> Self {
        Self {
            config,
            semaphore: Semaphore::new(max_concurrent),
            stats: Mutex::new(PoolStats::default()),
        }
    }

    pub fn stats(&self) -> PoolStats {
        self.stats.lock().unwrap().clone()
    }

    /// Convert a merged document to the target format.
    pub async fn convert(
        &self,
        input: &[u8],
        target: OutputFormat,
        cid: CorrelationId,
    ) -> Result<Vec<u8>, GenerationError> {
        self.with_slot(cid, async {
            let dir = self.workdir()?;
            let input_path = dir.path().join("input.docx");
            tokio::fs::write(&input_path, input).await.map_err(|e| {
                GenerationError::ConversionFailed(format!("failed to stage input: {e}"))
            })?;

            let output_path = dir.path().join(format!("output.{}", target.extension()));
            let args = build_args(
                &self.config.convert_args,
                &[
                    ("{input}", path_str(&input_path)),
                    ("{output}", path_str(&output_path)),
                    ("{outdir}", path_str(dir.path())),
                    ("{format}", target.extension().to_string()),
                ],
                None,
            );

            self.run_command(&self.config.binary, &args, cid).await?;

            // Converters either honour {output} or write the input stem
            // into the outdir.
            let fallback = dir.path().join(format!("input.{}", target.extension()));
            read_first_existing(&[output_path, fallback]).await
        })
        .await
    }

    /// Join already-rendered parts, in the given order, into one document.
    pub async fn concatenate(
        &self,
        parts: Vec<Vec<u8>>,
        target: OutputFormat,
        section_break: bool,
        cid: CorrelationId,
    ) -> Result<Vec<u8>, GenerationError> {
        if parts.is_empty() {
            return Err(GenerationError::ConversionFailed(
                "nothing to concatenate".to_string(),
            ));
        }
        if parts.len() == 1 {
            return Ok(parts.into_iter().next().unwrap());
        }

        self.with_slot(cid, async {
            let dir = self.workdir()?;
            let separator = self
                .config
                .section_break_bytes
                .as_ref()
                .filter(|_| section_break);

            let mut inputs = Vec::new();
            for (i, part) in parts.iter().enumerate() {
                if i > 0 {
                    if let Some(sep) = separator {
                        let sep_path = dir
                            .path()
                            .join(format!("break-{i:03}.{}", target.extension()));
                        tokio::fs::write(&sep_path, sep).await.map_err(|e| {
                            GenerationError::ConversionFailed(format!(
                                "failed to stage section break: {e}"
                            ))
                        })?;
                        inputs.push(sep_path);
                    }
                }
                let part_path = dir
                    .path()
                    .join(format!("part-{i:03}.{}", target.extension()));
                tokio::fs::write(&part_path, part).await.map_err(|e| {
                    GenerationError::ConversionFailed(format!("failed to stage part: {e}"))
                })?;
                inputs.push(part_path);
            }

            let output_path = dir.path().join(format!("output.{}", target.extension()));
            let args = build_args(
                &self.config.join_args,
                &[
                    ("{output}", path_str(&output_path)),
                    ("{outdir}", path_str(dir.path())),
                    ("{format}", target.extension().to_string()),
                ],
                Some(&inputs),
            );

            self.run_command(&self.config.join_binary, &args, cid).await?;
            read_first_existing(&[output_path]).await
        })
        .await
    }

    /// Run `work` holding one pool slot, keeping the counters honest on
    /// every exit path.
    async fn with_slot<F>(
        &self,
        cid: CorrelationId,
        work: F,
    ) -> Result<Vec<u8>, GenerationError>
    where
        F: Future<Output = Result<Vec<u8>, GenerationError>>,
    {
        self.stats.lock().unwrap().queued_jobs += 1;
        let permit = self.semaphore.acquire().await.map_err(|_| {
            self.stats.lock().unwrap().queued_jobs -= 1;
            GenerationError::unknown("conversion pool closed")
        })?;
        {
            let mut stats = self.stats.lock().unwrap();
            stats.queued_jobs -= 1;
            stats.active_jobs += 1;
        }

        let result = work.await;

        {
            let mut stats = self.stats.lock().unwrap();
            stats.active_jobs -= 1;
            match &result {
                Ok(_) => stats.completed_jobs += 1,
                Err(e) => {
                    stats.failed_jobs += 1;
                    tracing::warn!(correlation_id = %cid, error = %e, "conversion failed");
                }
            }
        }
        drop(permit);
        result
    }

    /// Per-job working directory, removed on drop on every exit path
    /// (success, failure, timeout).
    fn workdir(&self) -> Result<tempfile::TempDir, GenerationError> {
        let dir = match &self.config.work_root {
            Some(root) => tempfile::TempDir::new_in(root),
            None => tempfile::TempDir::new(),
        };
        dir.map_err(|e| {
            GenerationError::ConversionFailed(format!("failed to create working dir: {e}"))
        })
    }

    async fn run_command(
        &self,
        binary: &str,
        args: &[String],
        cid: CorrelationId,
    ) -> Result<(), GenerationError> {
        tracing::debug!(correlation_id = %cid, binary, ?args, "invoking converter");

        let child = Command::new(binary)
            .args(args)
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| {
                GenerationError::ConversionFailed(format!("failed to spawn {binary}: {e}"))
            })?;

        // Dropping the output future on timeout kills the child
        // (kill_on_drop above).
        let output = match tokio::time::timeout(self.config.timeout, child.wait_with_output())
            .await
        {
            Err(_) => {
                tracing::warn!(correlation_id = %cid, timeout_ms = self.config.timeout.as_millis() as u64, "converter timed out, killing process");
                return Err(GenerationError::ConversionTimeout {
                    timeout_ms: self.config.timeout.as_millis() as u64,
                });
            }
            Ok(Err(e)) => {
                return Err(GenerationError::ConversionFailed(format!(
                    "converter did not run: {e}"
                )));
            }
            Ok(Ok(output)) => output,
        };

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(GenerationError::ConversionFailed(format!(
                "converter exited with {:?}: {}",
                output.status.code(),
                stderr.trim()
            )));
        }
        Ok(())
    }
}

fn path_str(path: &Path) -> String {
    path.to_string_lossy().into_owned()
}

/// Substitute placeholders in an argument template. An argument that is
/// exactly `{inputs}` expands to one argument per input path.
fn build_args(
    template: &[String],
    vars: &[(&str, String)],
    inputs: Option<&[PathBuf]>,
) -> Vec<String> {
    let joined_inputs =
        inputs.map(|paths| paths.iter().map(|p| path_str(p)).collect::<Vec<_>>());

    let mut args = Vec::new();
    for arg in template {
        if arg == "{inputs}" {
            if let Some(paths) = &joined_inputs {
                args.extend(paths.iter().cloned());
            }
            continue;
        }
        let mut rendered = arg.clone();
        for (key, value) in vars {
            rendered = rendered.replace(key, value);
        }
        if let Some(paths) = &joined_inputs {
            rendered = rendered.replace("{inputs}", &paths.join(" "));
        }
        args.push(rendered);
    }
    args
}

async fn read_first_existing(candidates: &[PathBuf]) -> Result<Vec<u8>, GenerationError> {
    for path in candidates {
        if tokio::fs::try_exists(path).await.unwrap_or(false) {
            return tokio::fs::read(path).await.map_err(|e| {
                GenerationError::ConversionFailed(format!("failed to read output: {e}"))
            });
        }
    }
    Err(GenerationError::ConversionFailed(
        "converter produced no output".to_string(),
    ))
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Instant;

    use super::*;

    fn sh_config(script: &str, timeout: Duration, work_root: &Path) -> ConverterConfig {
        ConverterConfig {
            binary: "/bin/sh".to_string(),
            convert_args: vec!["-c".to_string(), script.to_string()],
            join_binary: "/bin/sh".to_string(),
            join_args: vec!["-c".to_string(), "cat {inputs} > {output}".to_string()],
            section_break_bytes: None,
            timeout,
            work_root: Some(work_root.to_path_buf()),
        }
    }

    fn cid() -> CorrelationId {
        CorrelationId::new()
    }

    #[tokio::test]
    async fn convert_runs_the_external_command() {
        let root = tempfile::tempdir().unwrap();
        let config = sh_config("cp {input} {output}", Duration::from_secs(5), root.path());
        let pool = ConversionPool::new(config, 2);

        let out = pool
            .convert(b"rendered content", OutputFormat::Pdf, cid())
            .await
            .unwrap();
        assert_eq!(out, b"rendered content");
        assert_eq!(pool.stats().completed_jobs, 1);
        assert_eq!(pool.stats().active_jobs, 0);
    }

    #[tokio::test]
    async fn pool_admits_at_most_max_concurrent() {
        let root = tempfile::tempdir().unwrap();
        let config = sh_config(
            "sleep 0.15 && cp {input} {output}",
            Duration::from_secs(5),
            root.path(),
        );
        let pool = Arc::new(ConversionPool::new(config, 2));

        let started = Instant::now();
        let mut handles = Vec::new();
        for _ in 0..6 {
            let pool = pool.clone();
            handles.push(tokio::spawn(async move {
                pool.convert(b"x", OutputFormat::Pdf, cid()).await
            }));
        }
        for handle in handles {
            handle.await.unwrap().unwrap();
        }

        // 6 jobs of ~150ms at concurrency 2 need at least three waves.
        assert!(started.elapsed() >= Duration::from_millis(400));
        let stats = pool.stats();
        assert_eq!(stats.completed_jobs, 6);
        assert_eq!(stats.active_jobs, 0);
        assert_eq!(stats.queued_jobs, 0);
    }

    #[tokio::test]
    async fn timeout_kills_the_process_and_cleans_up() {
        let root = tempfile::tempdir().unwrap();
        let config = sh_config("sleep 30", Duration::from_millis(150), root.path());
        let pool = ConversionPool::new(config, 1);

        let err = pool
            .convert(b"x", OutputFormat::Pdf, cid())
            .await
            .unwrap_err();
        assert!(matches!(err, GenerationError::ConversionTimeout { .. }));
        assert_eq!(pool.stats().failed_jobs, 1);

        // No working directory survives the timeout.
        let leftovers: Vec<_> = std::fs::read_dir(root.path()).unwrap().collect();
        assert!(leftovers.is_empty());
    }

    #[tokio::test]
    async fn nonzero_exit_is_a_conversion_failure() {
        let root = tempfile::tempdir().unwrap();
        let config = sh_config("exit 3", Duration::from_secs(5), root.path());
        let pool = ConversionPool::new(config, 1);

        let err = pool
            .convert(b"x", OutputFormat::Pdf, cid())
            .await
            .unwrap_err();
        assert!(matches!(err, GenerationError::ConversionFailed(_)));
        assert!(err.is_retryable());
    }

    #[tokio::test]
    async fn missing_output_is_a_conversion_failure() {
        let root = tempfile::tempdir().unwrap();
        let config = sh_config("true", Duration::from_secs(5), root.path());
        let pool = ConversionPool::new(config, 1);

        let err = pool
            .convert(b"x", OutputFormat::Pdf, cid())
            .await
            .unwrap_err();
        assert!(matches!(err, GenerationError::ConversionFailed(_)));
    }

    #[tokio::test]
    async fn concatenate_preserves_part_order() {
        let root = tempfile::tempdir().unwrap();
        let config = sh_config("cp {input} {output}", Duration::from_secs(5), root.path());
        let pool = ConversionPool::new(config, 2);

        let out = pool
            .concatenate(
                vec![b"first".to_vec(), b"second".to_vec(), b"third".to_vec()],
                OutputFormat::Pdf,
                false,
                cid(),
            )
            .await
            .unwrap();
        assert_eq!(out, b"firstsecondthird");
    }

    #[tokio::test]
    async fn concatenate_inserts_section_breaks_between_parts() {
        let root = tempfile::tempdir().unwrap();
        let mut config =
            sh_config("cp {input} {output}", Duration::from_secs(5), root.path());
        config.section_break_bytes = Some(b"|BREAK|".to_vec());
        let pool = ConversionPool::new(config, 2);

        let out = pool
            .concatenate(
                vec![b"a".to_vec(), b"b".to_vec()],
                OutputFormat::Docx,
                true,
                cid(),
            )
            .await
            .unwrap();
        assert_eq!(out, b"a|BREAK|b");
    }

    #[tokio::test]
    async fn single_part_concatenation_is_passthrough() {
        let root = tempfile::tempdir().unwrap();
        let config = sh_config("cp {input} {output}", Duration::from_secs(5), root.path());
        let pool = ConversionPool::new(config, 1);

        let out = pool
            .concatenate(vec![b"only".to_vec()], OutputFormat::Pdf, true, cid())
            .await
            .unwrap();
        assert_eq!(out, b"only");
    }
}
