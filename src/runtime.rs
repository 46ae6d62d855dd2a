use std::{
    fs,
    path::{Path, PathBuf},
    process::{Command, Output},
};

use anyhow::{Context, Result, bail};
use tracing::debug;

use crate::config::{BenchSettings, RuntimeSettings};
use crate::error::BenchError;
use crate::targets::Target;

/// `docker stats` template producing `cpu|mem usage|mem percent|net io`.
pub const STATS_FORMAT: &str = "{{.CPUPerc}}|{{.MemUsage}}|{{.MemPerc}}|{{.NetIO}}";

/// Materialised command specification ready to be spawned or logged.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandSpec {
    binary: PathBuf,
    args: Vec<String>,
    env: Vec<(String, String)>,
    cwd: Option<PathBuf>,
}

impl CommandSpec {
    pub fn new(binary: PathBuf, args: Vec<String>) -> Self {
        Self {
            binary,
            args,
            env: Vec::new(),
            cwd: None,
        }
    }

    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }

    pub fn in_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.cwd = Some(dir.into());
        self
    }

    pub fn binary(&self) -> &PathBuf {
        &self.binary
    }

    pub fn args(&self) -> &[String] {
        &self.args
    }

    pub fn env(&self) -> &[(String, String)] {
        &self.env
    }

    pub fn to_command(&self) -> Command {
        let mut command = Command::new(&self.binary);
        command.args(&self.args);
        for (key, value) in &self.env {
            command.env(key, value);
        }
        if let Some(dir) = &self.cwd {
            command.current_dir(dir);
        }
        command
    }

    pub fn describe(&self) -> String {
        let args = self.args.join(" ");
        format!("{} {}", self.binary.display(), args)
    }

    /// Run to completion, capturing stdout and stderr.
    pub fn output(&self) -> Result<Output> {
        self.to_command()
            .output()
            .with_context(|| format!("failed to execute {}", self.describe()))
    }
}

/// Merge captured stdout and stderr into a single diagnostic message.
pub fn combined_output(output: &Output) -> String {
    let mut message = String::new();
    if !output.stdout.is_empty() {
        message.push_str(&String::from_utf8_lossy(&output.stdout));
    }
    if !output.stderr.is_empty() {
        if !message.is_empty() && !message.ends_with('\n') {
            message.push('\n');
        }
        message.push_str(&String::from_utf8_lossy(&output.stderr));
    }
    message
}

fn tail_lines(message: &str, count: usize) -> String {
    let lines: Vec<&str> = message.lines().collect();
    let start = lines.len().saturating_sub(count);
    lines[start..].join("\n")
}

/// Source of raw container stats lines.
pub trait StatsSource: Send + Sync {
    fn query_stats(&self) -> Result<String>;
}

/// Lifecycle of isolated target instances.
pub trait InstanceRuntime: Send + Sync {
    fn build_and_start(&self, target: &Target) -> Result<(), BenchError>;
    fn stop(&self, target: &Target) -> Result<()>;
    fn logs(&self, target: &Target) -> Result<String>;
    /// One stats line in the [`STATS_FORMAT`] layout.
    fn query_stats(&self, target: &Target) -> Result<String>;
    /// Copy the served bundle of a running instance into `dest` and return
    /// the directory holding it.
    fn export_bundle(&self, target: &Target, dest: &Path) -> Result<PathBuf>;
}

/// Binds a runtime to one target so it can feed the sampler.
pub struct InstanceStats<'a> {
    runtime: &'a dyn InstanceRuntime,
    target: &'a Target,
}

impl<'a> InstanceStats<'a> {
    pub fn new(runtime: &'a dyn InstanceRuntime, target: &'a Target) -> Self {
        Self { runtime, target }
    }
}

impl StatsSource for InstanceStats<'_> {
    fn query_stats(&self) -> Result<String> {
        self.runtime.query_stats(self.target)
    }
}

/// Docker compose backed instances, one service per target.
#[derive(Debug, Clone)]
pub struct ComposeRuntime {
    docker: PathBuf,
    project_root: PathBuf,
    compose_file: Option<PathBuf>,
    container_prefix: String,
}

impl ComposeRuntime {
    pub fn new(docker: PathBuf, project_root: PathBuf, runtime: &RuntimeSettings) -> Self {
        Self {
            docker,
            project_root,
            compose_file: runtime.compose_file.clone(),
            container_prefix: runtime.container_prefix.clone(),
        }
    }

    pub fn from_settings(settings: &BenchSettings) -> Result<Self> {
        let docker = match &settings.runtime.docker_binary {
            Some(path) => path.clone(),
            None => which::which("docker")
                .context("docker binary not found; install docker or set runtime.docker_binary")?,
        };
        let project_root = settings.resolve_project_root()?;
        if let Some(path) = &settings.runtime.compose_file {
            let resolved = if path.is_absolute() {
                path.clone()
            } else {
                project_root.join(path)
            };
            if !resolved.exists() {
                bail!("docker compose file missing: {}", resolved.display());
            }
        }
        Ok(Self::new(docker, project_root, &settings.runtime))
    }

    fn compose(&self, args: &[&str]) -> CommandSpec {
        let mut full = vec!["compose".to_string()];
        if let Some(path) = &self.compose_file {
            full.push("--file".into());
            full.push(path.display().to_string());
        }
        full.extend(args.iter().map(|arg| arg.to_string()));
        CommandSpec::new(self.docker.clone(), full).in_dir(&self.project_root)
    }

    fn docker(&self, args: Vec<String>) -> CommandSpec {
        CommandSpec::new(self.docker.clone(), args).in_dir(&self.project_root)
    }

    pub fn build_command(&self, target: &Target) -> CommandSpec {
        self.compose(&["up", "-d", "--build", target.service()])
    }

    pub fn stop_command(&self, target: &Target) -> CommandSpec {
        self.compose(&["down", target.service()])
    }

    pub fn logs_command(&self, target: &Target) -> CommandSpec {
        self.compose(&["logs", "--no-color", "--tail", "200", target.service()])
    }

    pub fn stats_command(&self, target: &Target) -> CommandSpec {
        self.docker(vec![
            "stats".into(),
            target.container_name(&self.container_prefix),
            "--no-stream".into(),
            "--format".into(),
            STATS_FORMAT.into(),
        ])
    }

    pub fn copy_command(&self, target: &Target, dest: &Path) -> CommandSpec {
        let source = format!(
            "{}:{}/.",
            target.container_name(&self.container_prefix),
            target.bundle_path().trim_end_matches('/')
        );
        self.docker(vec!["cp".into(), source, dest.display().to_string()])
    }
}

impl InstanceRuntime for ComposeRuntime {
    fn build_and_start(&self, target: &Target) -> Result<(), BenchError> {
        let spec = self.build_command(target);
        debug!(command = %spec.describe(), "building target instance");
        let output = spec.output().map_err(|err| BenchError::BuildFailure {
            service: target.service().to_string(),
            reason: format!("{err:#}"),
        })?;
        let message = combined_output(&output);
        debug!(output = %message, "docker compose up finished");
        if output.status.success() {
            Ok(())
        } else {
            Err(BenchError::BuildFailure {
                service: target.service().to_string(),
                reason: format!("{}\n{}", output.status, tail_lines(&message, 20)),
            })
        }
    }

    fn stop(&self, target: &Target) -> Result<()> {
        let spec = self.stop_command(target);
        let output = spec.output()?;
        if !output.status.success() {
            bail!(
                "{} exited with {}: {}",
                spec.describe(),
                output.status,
                combined_output(&output).trim()
            );
        }
        Ok(())
    }

    fn logs(&self, target: &Target) -> Result<String> {
        let output = self.logs_command(target).output()?;
        Ok(combined_output(&output))
    }

    fn query_stats(&self, target: &Target) -> Result<String> {
        let spec = self.stats_command(target);
        let output = spec.output()?;
        if !output.status.success() {
            bail!(
                "docker stats exited with {}: {}",
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            );
        }
        Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
    }

    fn export_bundle(&self, target: &Target, dest: &Path) -> Result<PathBuf> {
        let bundle = dest.join("bundle");
        fs::create_dir_all(&bundle)
            .with_context(|| format!("Failed to create staging directory {}", bundle.display()))?;
        let spec = self.copy_command(target, &bundle);
        let output = spec.output()?;
        if !output.status.success() {
            bail!(
                "{} exited with {}: {}",
                spec.describe(),
                output.status,
                combined_output(&output).trim()
            );
        }
        Ok(bundle)
    }
}
