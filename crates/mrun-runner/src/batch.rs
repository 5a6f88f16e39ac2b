//! Batch-scheduler backend: drives a Slurm login node over a remote shell.
//!
//! A run walks `Connected -> Provisioned -> Submitted`; the first failing
//! step leaves the backend `Aborted`. Nothing is retried here.

use crate::context::{BackendConfig, BackendKind, BackendSettings, BatchSettings, SubmitStyle};
use crate::error::{DeployError, Result};
use crate::experiment::{check_env_names, slugify, Experiment};
use crate::packaging;
use crate::resources;
use crate::shell::{shell_join, shell_quote, RemoteShell, SshSession};
use crate::{Backend, RunReceipt};
use chrono::Utc;
use std::collections::BTreeMap;
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

pub const SCRATCH_SUBDIR: &str = "mrunner_scratch";
pub const CACHE_SUBDIR: &str = ".cache";
pub const DEFAULT_LOG_NAME: &str = "slurm.log";

/// A backend value exists only once its session is connected.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BatchState {
    Connected,
    Provisioned,
    Submitted,
    Aborted,
}

/// Remote directory layout of one run. Derived, never stored remotely.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScratchLayout {
    pub scratch_root: PathBuf,
    pub cache_dir: PathBuf,
    pub project_scratch_dir: PathBuf,
    pub experiment_scratch_dir: PathBuf,
}

impl ScratchLayout {
    pub fn new(scratch_dir: &str, user_id: &str, experiment: &Experiment) -> Self {
        let scratch_root = Path::new(scratch_dir).join(SCRATCH_SUBDIR);
        let project = experiment
            .project()
            .rsplit('/')
            .next()
            .unwrap_or(experiment.project());
        let project_scratch_dir =
            scratch_root.join(format!("{}_{}", slugify(user_id), slugify(project)));
        let experiment_scratch_dir = project_scratch_dir.join(experiment.unique_name());
        Self {
            cache_dir: scratch_root.join(CACHE_SUBDIR),
            scratch_root,
            project_scratch_dir,
            experiment_scratch_dir,
        }
    }

    /// Script name relative to the project scratch dir.
    pub fn script_name(&self) -> String {
        let rel = self
            .experiment_scratch_dir
            .strip_prefix(&self.project_scratch_dir)
            .unwrap_or(&self.experiment_scratch_dir);
        format!("{}.sh", rel.display())
    }

    pub fn script_path(&self) -> PathBuf {
        self.project_scratch_dir.join(self.script_name())
    }

    pub fn archive_path(&self, experiment: &Experiment) -> PathBuf {
        self.cache_dir
            .join(format!("{}.tar.gz", experiment.unique_name()))
    }

    pub fn default_log_path(&self) -> PathBuf {
        self.experiment_scratch_dir.join(DEFAULT_LOG_NAME)
    }
}

pub struct BatchBackend<S: RemoteShell> {
    settings: BatchSettings,
    user_id: String,
    context_env: BTreeMap<String, String>,
    shell: S,
    state: BatchState,
    cache_dir_ready: bool,
}

impl BatchBackend<SshSession> {
    pub fn connect(config: &BackendConfig) -> Result<Self> {
        let settings = batch_settings(config)?;
        let shell = SshSession::connect(settings)?;
        info!(destination = shell.destination(), "connected to batch cluster");
        Self::with_shell(config, shell)
    }
}

impl<S: RemoteShell> BatchBackend<S> {
    /// Wraps an already authenticated session.
    pub fn with_shell(config: &BackendConfig, shell: S) -> Result<Self> {
        let settings = batch_settings(config)?.clone();
        Ok(Self {
            settings,
            user_id: config.user_id.clone(),
            context_env: config.env.clone(),
            shell,
            state: BatchState::Connected,
            cache_dir_ready: false,
        })
    }

    pub fn state(&self) -> BatchState {
        self.state
    }

    pub fn shell(&self) -> &S {
        &self.shell
    }

    pub fn layout(&self, experiment: &Experiment) -> ScratchLayout {
        ScratchLayout::new(&self.settings.scratch_dir, &self.user_id, experiment)
    }

    pub fn run_experiment(&mut self, experiment: &Experiment) -> Result<RunReceipt> {
        if self.state == BatchState::Aborted {
            return Err(DeployError::configuration(format!(
                "batch backend is {:?}; open a new session",
                self.state
            )));
        }
        let result = self.submit_pipeline(experiment);
        if result.is_err() {
            self.state = BatchState::Aborted;
        }
        result
    }

    fn submit_pipeline(&mut self, experiment: &Experiment) -> Result<RunReceipt> {
        // Everything that can be rejected locally is checked before the
        // first remote call.
        let style = self.settings.submit_style()?;
        let ntasks = experiment
            .ntasks()
            .or(self.settings.ntasks)
            .unwrap_or(1);
        let resource_flags = resources::batch_flags(
            experiment.resources(),
            ntasks,
            self.settings.recommended_cpus,
        )?;
        check_env_names(&self.context_env)?;
        let layout = self.layout(experiment);
        debug!(?layout, "scratch layout");

        self.ensure_directories(&layout)?;
        self.state = BatchState::Provisioned;

        self.sync_code(experiment, &layout)?;

        let script = render_script(&self.settings, &self.context_env, &layout, experiment);
        let script_path = layout.script_path();
        self.send_script(&script, &script_path)?;

        let command = submit_command(style, &self.settings, &layout, &resource_flags, &script_path);
        info!(command = %command, "submitting");
        let output = self.shell.run(&command)?;
        self.state = BatchState::Submitted;

        Ok(RunReceipt {
            backend: BackendKind::Batch,
            experiment: experiment.unique_name(),
            target: layout.experiment_scratch_dir.display().to_string(),
            submission: command,
            output: output.trim().to_string(),
            submitted_at: Utc::now(),
        })
    }

    /// `mkdir -p` the run directory, and the shared cache directory once per
    /// backend instance.
    pub fn ensure_directories(&mut self, layout: &ScratchLayout) -> Result<()> {
        self.ensure_dir(&layout.experiment_scratch_dir)?;
        if !self.cache_dir_ready {
            self.ensure_dir(&layout.cache_dir)?;
            self.cache_dir_ready = true;
        }
        Ok(())
    }

    fn ensure_dir(&mut self, dir: &Path) -> Result<()> {
        let path = dir.display().to_string();
        self.shell.run(&format!("mkdir -p {}", shell_quote(&path)))?;
        Ok(())
    }

    /// Ships the code tree as one archive and unpacks it in the run directory.
    pub fn sync_code(&mut self, experiment: &Experiment, layout: &ScratchLayout) -> Result<()> {
        let archive = layout.archive_path(experiment).display().to_string();
        let cached = self.settings.reuse_archive && self.shell.exists(&archive)?;
        if cached {
            info!(archive = %archive, "reusing code archive already on the cluster");
        } else {
            let entries = packaging::paths_to_ship(
                experiment.working_directory(),
                experiment.exclude(),
                experiment.paths_to_copy(),
            )?;
            let local = tempfile::Builder::new()
                .prefix("mrun_")
                .suffix(".tar.gz")
                .tempfile()?;
            packaging::build_archive(experiment.working_directory(), &entries, local.path())?;
            // The cache path only ever holds a complete upload.
            let partial = format!("{}.part", archive);
            self.shell.upload(local.path(), &partial)?;
            self.shell
                .run(&format!(
                    "mv -f {} {}",
                    shell_quote(&partial),
                    shell_quote(&archive)
                ))
                .map_err(into_transfer)?;
            debug!(archive = %archive, entries = entries.len(), "code archive uploaded");
        }

        let run_dir = layout.experiment_scratch_dir.display().to_string();
        self.shell
            .run(&format!(
                "cd {} && tar xzf {}",
                shell_quote(&run_dir),
                shell_quote(&archive)
            ))
            .map_err(into_transfer)?;
        if !self.settings.reuse_archive {
            self.shell.run(&format!("rm -f {}", shell_quote(&archive)))?;
        }
        Ok(())
    }

    fn send_script(&mut self, script: &str, remote_path: &Path) -> Result<()> {
        let mut local = tempfile::Builder::new()
            .prefix("mrun_")
            .suffix(".sh")
            .tempfile()?;
        local.write_all(script.as_bytes())?;
        local.flush()?;
        let remote = remote_path.display().to_string();
        self.shell.upload(local.path(), &remote)?;
        self.shell.run(&format!("chmod +x {}", shell_quote(&remote)))?;
        Ok(())
    }
}

impl<S: RemoteShell> Backend for BatchBackend<S> {
    fn kind(&self) -> BackendKind {
        BackendKind::Batch
    }

    fn run(&mut self, experiment: &Experiment) -> Result<RunReceipt> {
        self.run_experiment(experiment)
    }
}

fn batch_settings(config: &BackendConfig) -> Result<&BatchSettings> {
    match &config.backend {
        BackendSettings::Batch(settings) => Ok(settings),
        BackendSettings::Orchestrated(_) => Err(DeployError::configuration(
            "context is not a batch-scheduler context",
        )),
    }
}

fn into_transfer(err: DeployError) -> DeployError {
    match err {
        DeployError::RemoteCommand {
            command,
            exit_status,
            stderr,
        } => DeployError::transfer(format!(
            "`{}` exited with {}: {}",
            command,
            exit_status,
            stderr.trim()
        )),
        other => other,
    }
}

pub fn render_script(
    settings: &BatchSettings,
    context_env: &BTreeMap<String, String>,
    layout: &ScratchLayout,
    experiment: &Experiment,
) -> String {
    let mut lines = vec![
        "#!/usr/bin/env sh".to_string(),
        "set -e".to_string(),
        format!(
            "cd {}",
            shell_quote(&layout.experiment_scratch_dir.display().to_string())
        ),
    ];
    for module in &settings.modules_to_load {
        lines.push(format!("module load {}", module));
    }
    if let Some(hook) = settings.after_module_load_cmd.as_deref() {
        if !hook.trim().is_empty() {
            lines.push(hook.to_string());
        }
    }
    if let Some(venv) = settings.venv.as_deref() {
        lines.push(format!(
            "source {}/bin/activate",
            shell_quote(venv.trim_end_matches('/'))
        ));
    }
    let mut env = context_env.clone();
    env.extend(experiment.merged_env());
    for (key, value) in &env {
        lines.push(format!("export {}={}", key, shell_quote(value)));
    }
    lines.push(experiment.command().text.clone());
    let mut script = lines.join("\n");
    script.push('\n');
    script
}

/// `<verb> [-A account] [-o log] [-p partition] [-t time] <flags> <script>`.
pub fn submit_command(
    style: SubmitStyle,
    settings: &BatchSettings,
    layout: &ScratchLayout,
    resource_flags: &[String],
    script_path: &Path,
) -> String {
    let mut items = vec![style.verb().to_string()];
    let log_path = settings.log_output_path.clone().or_else(|| match style {
        SubmitStyle::Batched => Some(layout.default_log_path().display().to_string()),
        SubmitStyle::Interactive => None,
    });
    for (flag, value) in [
        ("-A", settings.account.clone()),
        ("-o", log_path),
        ("-p", settings.partition.clone()),
        ("-t", settings.time.clone()),
    ] {
        if let Some(value) = value.filter(|v| !v.is_empty()) {
            items.push(flag.to_string());
            items.push(value);
        }
    }
    items.extend(resource_flags.iter().cloned());
    items.push(script_path.display().to_string());
    shell_join(&items)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::BackendConfig;
    use crate::experiment::{CommandLine, ExperimentSpec};
    use std::collections::BTreeSet;
    use std::fs;

    /// Records every call; paths listed in `existing` answer `exists`.
    #[derive(Default, Clone)]
    struct RecordingShell {
        commands: Vec<String>,
        uploads: Vec<(String, String)>,
        existing: BTreeSet<String>,
        fail_on: Option<String>,
        /// Next upload to a matching path leaves the file behind, then fails.
        break_upload: Option<String>,
        exists_calls: usize,
    }

    impl RemoteShell for RecordingShell {
        fn run(&mut self, command: &str) -> Result<String> {
            self.commands.push(command.to_string());
            if let Some(pattern) = &self.fail_on {
                if command.contains(pattern.as_str()) {
                    return Err(DeployError::RemoteCommand {
                        command: command.to_string(),
                        exit_status: 1,
                        stderr: "boom".to_string(),
                    });
                }
            }
            let words: Vec<&str> = command.split_whitespace().collect();
            if let ["mv", "-f", from, to] = words.as_slice() {
                if self.existing.remove(*from) {
                    self.existing.insert((*to).to_string());
                }
            }
            if command.starts_with("sbatch") {
                return Ok("Submitted batch job 4242\n".to_string());
            }
            Ok(String::new())
        }

        fn exists(&mut self, remote_path: &str) -> Result<bool> {
            self.exists_calls += 1;
            Ok(self.existing.contains(remote_path))
        }

        fn upload(&mut self, local: &Path, remote_path: &str) -> Result<()> {
            assert!(local.exists(), "uploaded file must exist locally");
            self.uploads
                .push((local.display().to_string(), remote_path.to_string()));
            self.existing.insert(remote_path.to_string());
            if let Some(pattern) = &self.break_upload {
                if remote_path.contains(pattern.as_str()) {
                    self.break_upload = None;
                    return Err(DeployError::transfer("connection reset during upload"));
                }
            }
            Ok(())
        }
    }

    fn config(settings: BatchSettings) -> BackendConfig {
        BackendConfig {
            storage_dir: "/net/storage/jj".to_string(),
            user_id: "jj".to_string(),
            env: [("CONTEXT_VAR".to_string(), "1".to_string())]
                .into_iter()
                .collect(),
            backend: BackendSettings::Batch(settings),
        }
    }

    fn settings() -> BatchSettings {
        let mut s = BatchSettings::new("jj@login.cluster.example", "/net/scratch/jj");
        s.partition = Some("plgrid-testing".to_string());
        s.modules_to_load = vec![
            "plgrid/tools/python/3.6.0".to_string(),
            "plgrid/tools/imagemagick/6.9.1".to_string(),
        ];
        s.after_module_load_cmd = Some("echo loaded".to_string());
        s.venv = Some("/home/jj/.venvs/project/".to_string());
        s
    }

    fn experiment(workdir: &Path, spec: ExperimentSpec) -> Experiment {
        let cmd = CommandLine::new("python experiment1.py --foo bar").with_env("CMD_VAR", "2");
        Experiment::with_suffix(spec, cmd, workdir, "ab12cd".to_string()).expect("experiment")
    }

    fn workdir() -> tempfile::TempDir {
        let dir = tempfile::tempdir().expect("tempdir");
        fs::write(dir.path().join("experiment1.py"), "print('hi')\n").expect("write");
        dir
    }

    #[test]
    fn layout_follows_user_project_and_run() {
        let dir = workdir();
        let exp = experiment(
            dir.path(),
            ExperimentSpec::new("Experiment Name").project("group/project-name"),
        );
        let layout = ScratchLayout::new("/net/scratch/jj", "jj", &exp);
        assert_eq!(
            layout.experiment_scratch_dir,
            PathBuf::from("/net/scratch/jj/mrunner_scratch/jj_project-name/experiment-name_ab12cd")
        );
        assert_eq!(
            layout.cache_dir,
            PathBuf::from("/net/scratch/jj/mrunner_scratch/.cache")
        );
        assert_eq!(layout.script_name(), "experiment-name_ab12cd.sh");
        assert_eq!(
            layout.script_path(),
            PathBuf::from("/net/scratch/jj/mrunner_scratch/jj_project-name/experiment-name_ab12cd.sh")
        );
    }

    #[test]
    fn script_has_expected_shape() {
        let dir = workdir();
        let exp = experiment(dir.path(), ExperimentSpec::new("exp").env("EXPERIMENT_VAR", "3"));
        let layout = ScratchLayout::new("/net/scratch/jj", "jj", &exp);
        let mut ctx_env = BTreeMap::new();
        ctx_env.insert("CONTEXT_VAR".to_string(), "1".to_string());
        ctx_env.insert("CMD_VAR".to_string(), "from-context".to_string());
        let script = render_script(&settings(), &ctx_env, &layout, &exp);
        let lines: Vec<&str> = script.lines().collect();
        assert_eq!(lines[0], "#!/usr/bin/env sh");
        assert_eq!(lines[1], "set -e");
        assert_eq!(
            lines[2],
            format!("cd {}", layout.experiment_scratch_dir.display())
        );
        assert_eq!(lines[3], "module load plgrid/tools/python/3.6.0");
        assert_eq!(lines[4], "module load plgrid/tools/imagemagick/6.9.1");
        assert_eq!(lines[5], "echo loaded");
        assert_eq!(lines[6], "source /home/jj/.venvs/project/bin/activate");
        assert_eq!(lines[7], "export CMD_VAR=2");
        assert_eq!(lines[8], "export CONTEXT_VAR=1");
        assert_eq!(lines[9], "export EXPERIMENT_VAR=3");
        assert_eq!(lines[10], "python experiment1.py --foo bar");
        assert_eq!(lines.len(), 11);
    }

    #[test]
    fn interactive_submission_without_ntasks_flag() {
        let dir = workdir();
        let exp = experiment(dir.path(), ExperimentSpec::new("Foo Bar").resource("cpu", "8"));
        let mut backend =
            BatchBackend::with_shell(&config(settings()), RecordingShell::default()).expect("backend");
        let receipt = backend.run(&exp).expect("run");
        let submit = receipt.submission;
        assert!(submit.starts_with("srun -p plgrid-testing -c 8 "), "{}", submit);
        assert!(!submit.contains(" -n "), "{}", submit);
        assert!(!submit.contains(" -o "), "interactive runs have no default log: {}", submit);
        assert!(submit.ends_with("foo-bar_ab12cd.sh"), "{}", submit);
        assert_eq!(backend.state(), BatchState::Submitted);
    }

    #[test]
    fn batched_submission_rounds_cpu_and_logs_under_run_dir() {
        let dir = workdir();
        let exp = experiment(
            dir.path(),
            ExperimentSpec::new("exp").resource("cpu", "10").ntasks(3),
        );
        let mut s = settings();
        s.interactive = false;
        s.batched = true;
        s.account = Some("grant-42".to_string());
        s.time = Some("1:00:00".to_string());
        let mut backend =
            BatchBackend::with_shell(&config(s), RecordingShell::default()).expect("backend");
        let receipt = backend.run(&exp).expect("run");
        let layout = backend.layout(&exp);
        assert_eq!(
            receipt.submission,
            format!(
                "sbatch -A grant-42 -o {} -p plgrid-testing -t 1:00:00 -c 3 -n 3 {}",
                layout.default_log_path().display(),
                layout.script_path().display()
            )
        );
        assert_eq!(receipt.output, "Submitted batch job 4242");
    }

    #[test]
    fn provisioning_order_and_cache_dir_created_once() {
        let dir = workdir();
        let mut backend =
            BatchBackend::with_shell(&config(settings()), RecordingShell::default()).expect("backend");
        assert_eq!(backend.state(), BatchState::Connected);
        let first = experiment(dir.path(), ExperimentSpec::new("first"));
        let second = experiment(dir.path(), ExperimentSpec::new("second"));
        backend.run(&first).expect("first run");
        backend.run(&second).expect("second run");

        let layout = backend.layout(&first);
        let cache_mkdir = format!("mkdir -p {}", layout.cache_dir.display());
        let commands = &backend.shell().commands;
        assert_eq!(
            commands.iter().filter(|c| **c == cache_mkdir).count(),
            1,
            "cache dir must be created once per backend: {:?}",
            commands
        );
        assert_eq!(
            commands[0],
            format!("mkdir -p {}", layout.experiment_scratch_dir.display())
        );
        assert_eq!(commands[1], cache_mkdir);
        let archive = layout.archive_path(&first).display().to_string();
        assert_eq!(commands[2], format!("mv -f {}.part {}", archive, archive));
        assert!(commands[3].starts_with("cd ") && commands[3].contains("tar xzf"));
        assert!(commands[4].starts_with("chmod +x "));
        assert!(commands[5].starts_with("srun "));

        let uploads = &backend.shell().uploads;
        assert_eq!(uploads.len(), 4, "archive and script per run: {:?}", uploads);
        assert_eq!(uploads[0].1, format!("{}.part", archive));
        assert_eq!(uploads[1].1, layout.script_path().display().to_string());
    }

    #[test]
    fn existing_archive_is_not_uploaded_again() {
        let dir = workdir();
        let exp = experiment(dir.path(), ExperimentSpec::new("exp"));
        let mut shell = RecordingShell::default();
        let layout = ScratchLayout::new("/net/scratch/jj", "jj", &exp);
        shell
            .existing
            .insert(layout.archive_path(&exp).display().to_string());
        let mut backend = BatchBackend::with_shell(&config(settings()), shell).expect("backend");
        backend.run(&exp).expect("run");
        let uploads = &backend.shell().uploads;
        assert_eq!(uploads.len(), 1, "only the script is uploaded: {:?}", uploads);
        assert!(uploads[0].1.ends_with(".sh"));
    }

    #[test]
    fn ephemeral_archive_is_removed_after_extraction() {
        let dir = workdir();
        let exp = experiment(dir.path(), ExperimentSpec::new("exp"));
        let mut s = settings();
        s.reuse_archive = false;
        let mut backend =
            BatchBackend::with_shell(&config(s), RecordingShell::default()).expect("backend");
        backend.run(&exp).expect("run");
        let archive = backend.layout(&exp).archive_path(&exp).display().to_string();
        let shell = backend.shell();
        assert_eq!(shell.exists_calls, 0, "no cache lookup when reuse is off");
        let extract = shell
            .commands
            .iter()
            .position(|c| c.contains("tar xzf"))
            .expect("extract");
        assert_eq!(shell.commands[extract + 1], format!("rm -f {}", archive));
    }

    #[test]
    fn unsupported_resource_aborts_before_remote_calls() {
        let dir = workdir();
        let exp = experiment(dir.path(), ExperimentSpec::new("exp").resource("tpu", "1"));
        let mut backend =
            BatchBackend::with_shell(&config(settings()), RecordingShell::default()).expect("backend");
        let err = backend.run(&exp).expect_err("tpu");
        assert!(matches!(err, DeployError::UnsupportedResource { .. }));
        assert!(backend.shell().commands.is_empty());
        assert!(backend.shell().uploads.is_empty());
        assert_eq!(backend.state(), BatchState::Aborted);
    }

    #[test]
    fn ambiguous_submission_style_aborts_before_remote_calls() {
        let dir = workdir();
        let exp = experiment(dir.path(), ExperimentSpec::new("exp"));
        let mut s = settings();
        s.batched = true;
        let mut backend =
            BatchBackend::with_shell(&config(s), RecordingShell::default()).expect("backend");
        let err = backend.run(&exp).expect_err("both styles");
        assert!(err.is_configuration());
        assert!(backend.shell().commands.is_empty());
    }

    #[test]
    fn remote_failure_surfaces_and_aborts() {
        let dir = workdir();
        let exp = experiment(dir.path(), ExperimentSpec::new("exp"));
        let shell = RecordingShell {
            fail_on: Some("srun".to_string()),
            ..Default::default()
        };
        let mut backend = BatchBackend::with_shell(&config(settings()), shell).expect("backend");
        let err = backend.run(&exp).expect_err("submit fails");
        match err {
            DeployError::RemoteCommand {
                command,
                exit_status,
                ..
            } => {
                assert!(command.starts_with("srun"));
                assert_eq!(exit_status, 1);
            }
            other => panic!("unexpected error: {}", other),
        }
        assert_eq!(backend.state(), BatchState::Aborted);
        let again = backend.run(&exp).expect_err("aborted backend");
        assert!(again.is_configuration());
    }

    #[test]
    fn failed_extraction_is_a_transfer_error() {
        let dir = workdir();
        let exp = experiment(dir.path(), ExperimentSpec::new("exp"));
        let shell = RecordingShell {
            fail_on: Some("tar xzf".to_string()),
            ..Default::default()
        };
        let mut backend = BatchBackend::with_shell(&config(settings()), shell).expect("backend");
        let err = backend.run(&exp).expect_err("extract fails");
        assert!(matches!(err, DeployError::Transfer(_)), "unexpected: {}", err);
    }

    #[test]
    fn orchestrated_context_is_rejected() {
        let cfg = BackendConfig {
            storage_dir: "/storage".to_string(),
            user_id: "jj".to_string(),
            env: BTreeMap::new(),
            backend: BackendSettings::Orchestrated(crate::context::OrchestratedSettings::new(
                "https://gcr.io",
            )),
        };
        let err = BatchBackend::with_shell(&cfg, RecordingShell::default())
            .err()
            .expect("wrong context");
        assert!(err.is_configuration());
    }

    #[test]
    fn interrupted_archive_upload_is_shipped_again_on_retry() {
        let dir = workdir();
        let exp = experiment(dir.path(), ExperimentSpec::new("exp"));
        let archive = ScratchLayout::new("/net/scratch/jj", "jj", &exp)
            .archive_path(&exp)
            .display()
            .to_string();
        let shell = RecordingShell {
            break_upload: Some(".tar.gz".to_string()),
            ..Default::default()
        };
        let mut backend = BatchBackend::with_shell(&config(settings()), shell).expect("backend");
        let err = backend.run(&exp).expect_err("upload interrupted");
        assert!(matches!(err, DeployError::Transfer(_)), "unexpected: {}", err);
        assert!(
            !backend.shell().existing.contains(&archive),
            "a broken upload must not land on the cache path"
        );

        let mut remote = backend.shell().clone();
        remote.uploads.clear();
        remote.commands.clear();
        let mut retry = BatchBackend::with_shell(&config(settings()), remote).expect("backend");
        retry.run(&exp).expect("retry");
        let archive_uploads = retry
            .shell()
            .uploads
            .iter()
            .filter(|(_, remote)| remote.contains(".tar.gz"))
            .count();
        assert_eq!(archive_uploads, 1, "retry must ship the archive again");
        assert!(retry.shell().existing.contains(&archive));
        assert_eq!(retry.state(), BatchState::Submitted);
    }

    #[test]
    fn invalid_context_env_name_fails_before_remote_calls() {
        let dir = workdir();
        let exp = experiment(dir.path(), ExperimentSpec::new("exp"));
        let mut cfg = config(settings());
        cfg.env
            .insert("X; touch /tmp/owned; Y".to_string(), "1".to_string());
        let mut backend = BatchBackend::with_shell(&cfg, RecordingShell::default()).expect("backend");
        let err = backend.run(&exp).expect_err("bad env name");
        assert!(err.is_configuration(), "unexpected: {}", err);
        assert!(backend.shell().commands.is_empty());
        assert!(backend.shell().uploads.is_empty());
        assert_eq!(backend.state(), BatchState::Aborted);
    }
}
