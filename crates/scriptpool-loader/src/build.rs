//! Build steps turning `<project>/src` into `<project>/out`

use parking_lot::Mutex;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::process::Command;

use crate::config::BuildConfig;

/// A failed install or build
#[derive(Debug, Clone, thiserror::Error)]
#[error("`{command}` failed{}", exit_suffix(.status))]
pub struct BuildFailure {
    pub command: String,
    pub status: Option<i32>,
    pub stdout: String,
    pub stderr: String,
    /// Sources the step could attribute the failure to. Empty when unknown.
    pub failed_sources: Vec<PathBuf>,
}

fn exit_suffix(status: &Option<i32>) -> String {
    match status {
        Some(code) => format!(" with exit code {code}"),
        None => String::new(),
    }
}

impl BuildFailure {
    /// Whether this failure affects `source`. Failures that name no source
    /// affect every source.
    pub fn involves(&self, source: &Path) -> bool {
        self.failed_sources.is_empty() || self.failed_sources.iter().any(|s| s == source)
    }
}

/// External build/bundling tool
pub trait BuildStep: Send + Sync {
    /// Install dependencies after a manifest changed
    fn install(&self, project_dir: &Path) -> Result<(), BuildFailure>;

    /// Produce `out/` from `src/`
    fn build(&self, project_dir: &Path) -> Result<(), BuildFailure>;
}

/// Pick the step described by `config`: shell commands when a build command is
/// set, the native step otherwise
pub fn from_config(config: &BuildConfig, script_extensions: &[String]) -> Box<dyn BuildStep> {
    match &config.build_command {
        Some(build) => Box::new(CommandBuildStep::new(
            config.install_command.clone(),
            build.clone(),
        )),
        None => Box::new(NativeBuildStep::new(script_extensions.to_vec())),
    }
}

/// Runs configured shell commands inside the project directory
#[derive(Debug)]
pub struct CommandBuildStep {
    install_command: Option<String>,
    build_command: String,
    // Build tools generally do not tolerate two runs in one directory
    running: Mutex<()>,
}

impl CommandBuildStep {
    pub fn new(install_command: Option<String>, build_command: impl Into<String>) -> Self {
        Self {
            install_command,
            build_command: build_command.into(),
            running: Mutex::new(()),
        }
    }

    fn run(&self, command_line: &str, project_dir: &Path) -> Result<(), BuildFailure> {
        let _running = self.running.lock();

        let mut parts = command_line.split_whitespace();
        let Some(program) = parts.next() else {
            return Err(BuildFailure {
                command: command_line.to_string(),
                status: None,
                stdout: String::new(),
                stderr: "empty command".to_string(),
                failed_sources: Vec::new(),
            });
        };

        tracing::info!(
            target: "loader",
            "Running `{}` in {}",
            command_line,
            project_dir.display()
        );

        let output = Command::new(program)
            .args(parts)
            .current_dir(project_dir)
            .output()
            .map_err(|e| BuildFailure {
                command: command_line.to_string(),
                status: None,
                stdout: String::new(),
                stderr: e.to_string(),
                failed_sources: Vec::new(),
            })?;

        let stdout = String::from_utf8_lossy(&output.stdout).into_owned();
        let stderr = String::from_utf8_lossy(&output.stderr).into_owned();

        if !stdout.is_empty() {
            tracing::debug!(target: "loader", "{}", stdout.trim_end());
        }

        if output.status.success() {
            if !stderr.is_empty() {
                tracing::warn!(target: "loader", "{}", stderr.trim_end());
            }
            return Ok(());
        }

        tracing::error!(
            target: "loader",
            "`{}` exited with {}: {}",
            command_line,
            output.status,
            stderr.trim_end()
        );

        Err(BuildFailure {
            command: command_line.to_string(),
            status: output.status.code(),
            stdout,
            stderr,
            failed_sources: Vec::new(),
        })
    }
}

impl BuildStep for CommandBuildStep {
    fn install(&self, project_dir: &Path) -> Result<(), BuildFailure> {
        match &self.install_command {
            Some(command) => self.run(command, project_dir),
            None => Ok(()),
        }
    }

    fn build(&self, project_dir: &Path) -> Result<(), BuildFailure> {
        self.run(&self.build_command, project_dir)
    }
}

/// Build step that needs no external tool
///
/// Every source newer than its `out/` counterpart is parsed with Rhai and, if
/// it parses, copied over. Sources that fail to parse are reported in
/// [`BuildFailure::failed_sources`] and left out of `out/`.
#[derive(Debug, Clone)]
pub struct NativeBuildStep {
    script_extensions: Vec<String>,
}

impl NativeBuildStep {
    pub fn new(script_extensions: Vec<String>) -> Self {
        Self { script_extensions }
    }

    fn is_script(&self, path: &Path) -> bool {
        path.extension()
            .and_then(|ext| ext.to_str())
            .map(|ext| {
                self.script_extensions
                    .iter()
                    .any(|e| e.trim_start_matches('.') == ext)
            })
            .unwrap_or(false)
    }

    fn collect(dir: &Path, files: &mut Vec<PathBuf>) -> io::Result<()> {
        for entry in fs::read_dir(dir)? {
            let entry = entry?;
            let path = entry.path();
            if entry.file_type()?.is_dir() {
                Self::collect(&path, files)?;
            } else {
                files.push(path);
            }
        }
        Ok(())
    }

    fn needs_build(source: &Path, output: &Path) -> io::Result<bool> {
        let source_modified = fs::metadata(source)?.modified()?;
        let output_modified = match fs::metadata(output) {
            Ok(metadata) => metadata.modified()?,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(true),
            Err(e) => return Err(e),
        };
        Ok(output_modified < source_modified)
    }

    fn io_failure(e: io::Error) -> BuildFailure {
        BuildFailure {
            command: "native build".to_string(),
            status: None,
            stdout: String::new(),
            stderr: e.to_string(),
            failed_sources: Vec::new(),
        }
    }
}

impl BuildStep for NativeBuildStep {
    fn install(&self, project_dir: &Path) -> Result<(), BuildFailure> {
        tracing::debug!(
            target: "loader",
            "Native build step has nothing to install in {}",
            project_dir.display()
        );
        Ok(())
    }

    fn build(&self, project_dir: &Path) -> Result<(), BuildFailure> {
        let src_dir = project_dir.join("src");
        let out_dir = project_dir.join("out");

        let mut sources = Vec::new();
        if src_dir.is_dir() {
            Self::collect(&src_dir, &mut sources).map_err(Self::io_failure)?;
        }

        let engine = rhai::Engine::new_raw();
        let mut failed_sources = Vec::new();
        let mut stderr = String::new();
        let mut built = 0usize;

        for source in sources {
            let Ok(relative) = source.strip_prefix(&src_dir) else {
                continue;
            };
            let output = out_dir.join(relative);

            if !Self::needs_build(&source, &output).map_err(Self::io_failure)? {
                continue;
            }

            if self.is_script(&source) {
                let text = fs::read_to_string(&source).map_err(Self::io_failure)?;
                if let Err(e) = engine.compile(&text) {
                    stderr.push_str(&format!("{}: {}\n", relative.display(), e));
                    failed_sources.push(source);
                    continue;
                }
            }

            if let Some(parent) = output.parent() {
                fs::create_dir_all(parent).map_err(Self::io_failure)?;
            }
            fs::copy(&source, &output).map_err(Self::io_failure)?;
            built += 1;
        }

        tracing::debug!(target: "loader", "Native build copied {} file(s)", built);

        if failed_sources.is_empty() {
            Ok(())
        } else {
            Err(BuildFailure {
                command: "native build".to_string(),
                status: None,
                stdout: String::new(),
                stderr,
                failed_sources,
            })
        }
    }
}
