use std::io::{self, Read, Write};
use std::path::Path;
use std::process::{Child, Command, Stdio};
use std::thread;

use crate::errors::CreationReason;
use crate::model_files::validate_model;

use super::{EngineError, EngineFactory, EngineOptions, InferenceEngine, TokenStream};

const STDERR_TAIL_BYTES: usize = 4096;
const PROMPT_PLACEHOLDER: &str = "{prompt}";

/// Drives the external engine's command-line runner, one child process per
/// generation, streaming its stdout back as partial chunks.
#[derive(Debug, Clone)]
pub struct ProcessEngineFactory {
    program: String,
    args: Vec<String>,
}

impl ProcessEngineFactory {
    pub fn new(program: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            args,
        }
    }
}

impl EngineFactory for ProcessEngineFactory {
    fn create(&self, options: &EngineOptions) -> Result<Box<dyn InferenceEngine>, EngineError> {
        if self.program.trim().is_empty() {
            return Err(EngineError::new(
                CreationReason::Unknown,
                "No engine program configured ([engine].program)",
            ));
        }

        let info = validate_model(Path::new(&options.model_path))?;
        tracing::info!(
            model = %info.path.display(),
            size_mb = info.size_mb(),
            format = info.format.as_str(),
            program = %self.program,
            "process engine ready"
        );
        for rec in &info.recommendations {
            tracing::debug!(model = %info.path.display(), "{}", rec);
        }

        Ok(Box::new(ProcessEngine {
            program: self.program.clone(),
            args: self.args.clone(),
            options: options.clone(),
            runs: 0,
        }))
    }
}

pub struct ProcessEngine {
    program: String,
    args: Vec<String>,
    options: EngineOptions,
    runs: u64,
}

impl ProcessEngine {
    fn render_args(&self, prompt: &str) -> Vec<String> {
        render_args(&self.args, &self.options, prompt)
    }

    fn prompt_via_stdin(&self) -> bool {
        !self.args.iter().any(|a| a.contains(PROMPT_PLACEHOLDER))
    }
}

impl InferenceEngine for ProcessEngine {
    fn generate(&mut self, prompt: &str, stream: &mut TokenStream<'_>) -> Result<(), EngineError> {
        self.runs += 1;
        let use_stdin = self.prompt_via_stdin();

        let mut child = Command::new(&self.program)
            .args(self.render_args(prompt))
            .stdin(if use_stdin { Stdio::piped() } else { Stdio::null() })
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| {
                EngineError::from_message(format!(
                    "Failed to spawn engine '{}': {}",
                    self.program, e
                ))
            })?;

        let stdin_writer = if use_stdin {
            child.stdin.take().map(|mut stdin| {
                let body = prompt.to_string();
                thread::spawn(move || {
                    let _ = stdin.write_all(body.as_bytes());
                })
            })
        } else {
            None
        };

        let stderr_reader = child.stderr.take().map(|mut stderr| {
            thread::spawn(move || {
                let mut buf = Vec::new();
                let _ = stderr.read_to_end(&mut buf);
                let start = buf.len().saturating_sub(STDERR_TAIL_BYTES);
                String::from_utf8_lossy(&buf[start..]).trim().to_string()
            })
        });

        let mut stdout = child
            .stdout
            .take()
            .ok_or_else(|| EngineError::from_message("Engine stdout not captured"))?;

        let mut decoder = Utf8Chunker::default();
        let mut buf = [0u8; 1024];
        loop {
            match stdout.read(&mut buf) {
                Ok(0) => break,
                Ok(n) => {
                    let text = decoder.feed(&buf[..n]);
                    if !text.is_empty() && !stream.push(&text) {
                        tracing::debug!(program = %self.program, "listener gone, stopping engine run");
                        stop_child(&mut child);
                        return Ok(());
                    }
                }
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    stop_child(&mut child);
                    return Err(EngineError::from_message(format!(
                        "Engine output read failed: {}",
                        e
                    )));
                }
            }
        }

        let tail = decoder.finish();
        if !tail.is_empty() {
            stream.push(&tail);
        }

        let status = child
            .wait()
            .map_err(|e| EngineError::from_message(format!("Engine wait failed: {}", e)))?;
        if let Some(writer) = stdin_writer {
            let _ = writer.join();
        }
        let stderr_text = stderr_reader
            .and_then(|h| h.join().ok())
            .unwrap_or_default();

        if status.success() {
            Ok(())
        } else if stderr_text.is_empty() {
            Err(EngineError::from_message(match status.code() {
                Some(code) => format!("Engine exited with code {}", code),
                None => "Engine was terminated by a signal".to_string(),
            }))
        } else {
            Err(EngineError::from_message(stderr_text))
        }
    }

    fn close(&mut self) {
        tracing::debug!(
            model = %self.options.model_path,
            runs = self.runs,
            "process engine closed"
        );
    }
}

fn stop_child(child: &mut Child) {
    let _ = child.kill();
    let _ = child.wait();
}

fn render_args(template: &[String], options: &EngineOptions, prompt: &str) -> Vec<String> {
    template
        .iter()
        .map(|arg| {
            arg.replace("{model_path}", &options.model_path)
                .replace("{max_tokens}", &options.max_tokens.to_string())
                .replace("{top_k}", &options.top_k.to_string())
                .replace("{temperature}", &options.temperature.to_string())
                .replace("{random_seed}", &options.random_seed.to_string())
                .replace(PROMPT_PLACEHOLDER, prompt)
        })
        .collect()
}

/// Re-joins multi-byte characters split across pipe reads.
#[derive(Default)]
struct Utf8Chunker {
    pending: Vec<u8>,
}

impl Utf8Chunker {
    fn feed(&mut self, bytes: &[u8]) -> String {
        self.pending.extend_from_slice(bytes);
        match std::str::from_utf8(&self.pending) {
            Ok(text) => {
                let out = text.to_string();
                self.pending.clear();
                out
            }
            Err(e) if e.error_len().is_none() => {
                let valid = e.valid_up_to();
                let out = String::from_utf8_lossy(&self.pending[..valid]).into_owned();
                self.pending.drain(..valid);
                out
            }
            Err(_) => {
                let out = String::from_utf8_lossy(&self.pending).into_owned();
                self.pending.clear();
                out
            }
        }
    }

    fn finish(&mut self) -> String {
        let out = String::from_utf8_lossy(&self.pending).into_owned();
        self.pending.clear();
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use std::path::PathBuf;
    use std::sync::atomic::AtomicBool;
    use std::time::{SystemTime, UNIX_EPOCH};

    fn options(model_path: &str) -> EngineOptions {
        EngineOptions {
            model_path: model_path.to_string(),
            max_tokens: 64,
            top_k: 40,
            temperature: 0.8,
            random_seed: 7,
        }
    }

    fn scratch_model() -> PathBuf {
        let now_ns = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_nanos())
            .unwrap_or(0);
        let dir = std::env::temp_dir().join(format!("mpllm_proc_{}", now_ns));
        fs::create_dir_all(&dir).expect("create dir");
        let path = dir.join("model.task");
        fs::write(&path, b"weights").expect("write model");
        path
    }

    fn run(engine: &mut dyn InferenceEngine, prompt: &str) -> (Result<(), EngineError>, String) {
        let cancelled = AtomicBool::new(false);
        let mut collected = String::new();
        let mut sink = |chunk: &str| {
            collected.push_str(chunk);
            true
        };
        let result = {
            let mut stream = TokenStream::new(&mut sink, &cancelled);
            engine.generate(prompt, &mut stream)
        };
        (result, collected)
    }

    #[test]
    fn render_args_substitutes_every_placeholder() {
        let template = vec![
            "--model_path={model_path}".to_string(),
            "--max_tokens={max_tokens}".to_string(),
            "--topk={top_k}".to_string(),
            "--temperature={temperature}".to_string(),
            "--seed={random_seed}".to_string(),
            "--prompt={prompt}".to_string(),
        ];
        let args = render_args(&template, &options("/m.task"), "hi there");
        assert_eq!(
            args,
            vec![
                "--model_path=/m.task",
                "--max_tokens=64",
                "--topk=40",
                "--temperature=0.8",
                "--seed=7",
                "--prompt=hi there",
            ]
        );
    }

    #[test]
    fn utf8_chunker_rejoins_split_characters() {
        let mut chunker = Utf8Chunker::default();
        let bytes = "ciao è".as_bytes();
        let split = bytes.len() - 1;
        assert_eq!(chunker.feed(&bytes[..split]), "ciao ");
        assert_eq!(chunker.feed(&bytes[split..]), "è");
        assert_eq!(chunker.finish(), "");
    }

    #[test]
    fn factory_rejects_missing_model_file() {
        let factory = ProcessEngineFactory::new("sh", vec![]);
        let err = factory
            .create(&options("/bad/path/model.task"))
            .err()
            .expect("missing model must fail");
        assert_eq!(err.reason, CreationReason::NotFound);
    }

    #[test]
    fn factory_requires_a_program() {
        let model = scratch_model();
        let factory = ProcessEngineFactory::new("  ", vec![]);
        let err = factory
            .create(&options(model.to_str().expect("utf8 path")))
            .err()
            .expect("empty program must fail");
        assert_eq!(err.reason, CreationReason::Unknown);
        let _ = fs::remove_dir_all(model.parent().expect("parent"));
    }

    #[cfg(unix)]
    #[test]
    fn streams_child_stdout_as_partials() {
        let model = scratch_model();
        let factory = ProcessEngineFactory::new(
            "sh",
            vec![
                "-c".to_string(),
                "printf 'Hel'; printf 'lo, %s' \"$0\"".to_string(),
                "{prompt}".to_string(),
            ],
        );
        let mut engine = factory
            .create(&options(model.to_str().expect("utf8 path")))
            .expect("create engine");

        let (result, text) = run(engine.as_mut(), "world");
        assert!(result.is_ok());
        assert_eq!(text, "Hello, world");
        engine.close();
        let _ = fs::remove_dir_all(model.parent().expect("parent"));
    }

    #[cfg(unix)]
    #[test]
    fn prompt_goes_through_stdin_without_placeholder() {
        let model = scratch_model();
        let factory = ProcessEngineFactory::new("sh", vec!["-c".to_string(), "cat".to_string()]);
        let mut engine = factory
            .create(&options(model.to_str().expect("utf8 path")))
            .expect("create engine");

        let (result, text) = run(engine.as_mut(), "echo me");
        assert!(result.is_ok());
        assert_eq!(text, "echo me");
        let _ = fs::remove_dir_all(model.parent().expect("parent"));
    }

    #[cfg(unix)]
    #[test]
    fn failing_child_reports_stderr() {
        let model = scratch_model();
        let factory = ProcessEngineFactory::new(
            "sh",
            vec![
                "-c".to_string(),
                "printf 'partial'; echo 'kv cache exhausted' >&2; exit 3".to_string(),
                "{prompt}".to_string(),
            ],
        );
        let mut engine = factory
            .create(&options(model.to_str().expect("utf8 path")))
            .expect("create engine");

        let (result, text) = run(engine.as_mut(), "x");
        let err = result.expect_err("non-zero exit must fail");
        assert_eq!(err.message, "kv cache exhausted");
        assert_eq!(text, "partial");
        let _ = fs::remove_dir_all(model.parent().expect("parent"));
    }

    #[cfg(unix)]
    #[test]
    fn silent_failure_reports_exit_code() {
        let model = scratch_model();
        let factory = ProcessEngineFactory::new(
            "sh",
            vec!["-c".to_string(), "exit 3".to_string(), "{prompt}".to_string()],
        );
        let mut engine = factory
            .create(&options(model.to_str().expect("utf8 path")))
            .expect("create engine");

        let (result, text) = run(engine.as_mut(), "x");
        let err = result.expect_err("non-zero exit must fail");
        assert_eq!(err.message, "Engine exited with code 3");
        assert!(text.is_empty());
        let _ = fs::remove_dir_all(model.parent().expect("parent"));
    }
}
