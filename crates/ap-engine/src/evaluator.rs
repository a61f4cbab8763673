//! The evaluation boundary: run a config, get a time back.

use ap_queue::{collect_completions, Completion, CompletionFile, SweepDefinition};
use ap_types::{config_error, ApResult, EvaluationError, KnobSpace, RuntimeConfig};
use async_trait::async_trait;
use regex::Regex;
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::{Duration, Instant};
use tokio::process::Command;
use tracing::{debug, warn};

/// Result of one evaluation.
#[derive(Debug, Clone, PartialEq)]
pub struct Evaluation {
    /// Seconds. For a timed-out run this is the timeout itself.
    pub time: f64,
    pub timed_out: bool,
    /// Evaluator-specific details kept alongside the measurement.
    pub record: BTreeMap<String, String>,
}

impl Evaluation {
    pub fn measured(time: f64) -> Self {
        Self {
            time,
            timed_out: false,
            record: BTreeMap::new(),
        }
    }

    pub fn timeout(limit: Duration) -> Self {
        Self {
            time: limit.as_secs_f64(),
            timed_out: true,
            record: BTreeMap::new(),
        }
    }

    pub fn with_detail(mut self, key: impl Into<String>, value: impl ToString) -> Self {
        self.record.insert(key.into(), value.to_string());
        self
    }
}

/// Runs a program under a config and reports its execution time.
#[async_trait]
pub trait Evaluator: Send {
    async fn evaluate(&mut self, config: &RuntimeConfig) -> ApResult<Evaluation>;

    fn describe(&self) -> String;
}

/// Pulls a timing value out of program output.
pub trait TimingExtractor: Send + Sync {
    fn extract(&self, output: &str) -> Option<f64>;
}

/// Floating-point literal as programs print it: `12`, `12.31`, `.5`, `3e-2`.
const NUMBER_PATTERN: &str = r"[-+]?(?:\d+\.?\d*|\.\d+)(?:[eE][-+]?\d+)?";

/// Marker the NAS and LULESH style drivers print before their timing.
pub const DEFAULT_TIMING_MARKER: &str = "Elapsed time in seconds";

/// Reads the first capture group of the last match in the output.
#[derive(Debug, Clone)]
pub struct RegexExtractor {
    regex: Regex,
}

impl RegexExtractor {
    pub fn new(pattern: &str) -> ApResult<Self> {
        let regex = Regex::new(pattern)
            .map_err(|e| config_error!("invalid timing pattern {:?}: {}", pattern, e))?;
        if regex.captures_len() < 2 {
            return Err(config_error!(
                "timing pattern {:?} needs a capture group around the value",
                pattern
            ));
        }
        Ok(Self { regex })
    }

    /// The number that follows a literal marker, e.g.
    /// `Elapsed time in seconds = 12.31`.
    pub fn marker(marker: &str) -> ApResult<Self> {
        Self::new(&format!(
            r"{}[\s:=]*({})",
            regex::escape(marker),
            NUMBER_PATTERN
        ))
    }
}

impl TimingExtractor for RegexExtractor {
    fn extract(&self, output: &str) -> Option<f64> {
        self.regex
            .captures_iter(output)
            .filter_map(|caps| caps.get(1)?.as_str().parse::<f64>().ok())
            .last()
    }
}

/// Launches `sh -c <command>` with the config applied as environment
/// variables.
pub struct CommandEvaluator {
    space: KnobSpace,
    command: String,
    working_dir: Option<PathBuf>,
    timeout: Duration,
    env: BTreeMap<String, String>,
    extractor: Box<dyn TimingExtractor>,
}

impl std::fmt::Debug for CommandEvaluator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CommandEvaluator")
            .field("command", &self.command)
            .field("working_dir", &self.working_dir)
            .field("timeout", &self.timeout)
            .finish()
    }
}

impl CommandEvaluator {
    pub fn new(
        space: KnobSpace,
        command: impl Into<String>,
        timeout: Duration,
    ) -> ApResult<Self> {
        Ok(Self {
            space,
            command: command.into(),
            working_dir: None,
            timeout,
            env: BTreeMap::new(),
            extractor: Box::new(RegexExtractor::marker(DEFAULT_TIMING_MARKER)?),
        })
    }

    pub fn with_working_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.working_dir = Some(dir.into());
        self
    }

    /// Fixed variables set for every run, before the config's own.
    pub fn with_env(mut self, env: BTreeMap<String, String>) -> Self {
        self.env = env;
        self
    }

    pub fn with_extractor(mut self, extractor: Box<dyn TimingExtractor>) -> Self {
        self.extractor = extractor;
        self
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }
}

#[async_trait]
impl Evaluator for CommandEvaluator {
    async fn evaluate(&mut self, config: &RuntimeConfig) -> ApResult<Evaluation> {
        let env = config.environment(&self.space)?;
        let mut command = Command::new("sh");
        command
            .arg("-c")
            .arg(&self.command)
            .envs(&self.env)
            .envs(env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(dir) = &self.working_dir {
            command.current_dir(dir);
        }

        debug!("Running {:?} with {:?}", self.command, env);
        let started = Instant::now();
        let child = command.spawn().map_err(|e| EvaluationError::LaunchFailed {
            command: self.command.clone(),
            message: e.to_string(),
        })?;

        // Dropping the wait future on timeout drops the child, which kills it.
        let output = match tokio::time::timeout(self.timeout, child.wait_with_output()).await {
            Err(_) => {
                warn!(
                    "{} timed out after {:.1}s for {}",
                    self.command,
                    self.timeout.as_secs_f64(),
                    config
                );
                return Ok(Evaluation::timeout(self.timeout));
            }
            Ok(result) => result.map_err(|e| EvaluationError::LaunchFailed {
                command: self.command.clone(),
                message: e.to_string(),
            })?,
        };
        let wall = started.elapsed().as_secs_f64();

        if !output.status.success() {
            return Err(EvaluationError::ProcessFailed {
                command: self.command.clone(),
                status: output.status.code().unwrap_or(-1),
            }
            .into());
        }

        let mut text = String::from_utf8_lossy(&output.stdout).into_owned();
        text.push_str(&String::from_utf8_lossy(&output.stderr));
        let time = self.extractor.extract(&text).ok_or_else(|| {
            EvaluationError::MeasurementFailure {
                config: config.to_string(),
                message: format!("no timing found in {} bytes of output", text.len()),
            }
        })?;

        Ok(Evaluation::measured(time).with_detail("wallSeconds", format!("{wall:.3}")))
    }

    fn describe(&self) -> String {
        format!("command {:?}", self.command)
    }
}

/// Answers from previously measured sweep data instead of running anything.
///
/// Repeated measurements of a config are averaged; failed rows are ignored.
#[derive(Debug, Clone)]
pub struct LookupEvaluator {
    table: HashMap<RuntimeConfig, (f64, usize)>,
    source: String,
}

impl LookupEvaluator {
    pub fn from_completions(completions: &[Completion], source: impl Into<String>) -> Self {
        let mut sums: HashMap<RuntimeConfig, (f64, usize)> = HashMap::new();
        for completion in completions {
            if !completion.time.is_finite() || completion.time < 0.0 {
                continue;
            }
            let entry = sums.entry(completion.config.clone()).or_default();
            entry.0 += completion.time;
            entry.1 += 1;
        }
        let table = sums
            .into_iter()
            .map(|(config, (sum, n))| (config, (sum / n as f64, n)))
            .collect();
        Self {
            table,
            source: source.into(),
        }
    }

    /// Load from a single completion file or a sweep directory.
    pub fn load(sweep: &SweepDefinition, path: &Path) -> ApResult<Self> {
        let completions = if path.is_dir() {
            collect_completions(path, sweep)?
        } else {
            CompletionFile::new(path).read(sweep)?
        };
        let evaluator = Self::from_completions(&completions, path.display().to_string());
        tracing::info!(
            "Lookup table from {}: {} configs",
            path.display(),
            evaluator.len()
        );
        Ok(evaluator)
    }

    pub fn len(&self) -> usize {
        self.table.len()
    }

    pub fn is_empty(&self) -> bool {
        self.table.is_empty()
    }
}

#[async_trait]
impl Evaluator for LookupEvaluator {
    async fn evaluate(&mut self, config: &RuntimeConfig) -> ApResult<Evaluation> {
        let (mean, samples) = self.table.get(config).copied().ok_or_else(|| {
            EvaluationError::MeasurementFailure {
                config: config.to_string(),
                message: format!("no measurement in {}", self.source),
            }
        })?;
        Ok(Evaluation::measured(mean).with_detail("samples", samples))
    }

    fn describe(&self) -> String {
        format!("lookup {}", self.source)
    }
}
