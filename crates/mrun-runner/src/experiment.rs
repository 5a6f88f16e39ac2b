use crate::error::{DeployError, Result};
use rand::distributions::Alphanumeric;
use rand::Rng;
use serde::{Deserialize, Deserializer, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

pub const DEFAULT_PROJECT: &str = "sandbox";
pub const RUN_SUFFIX_LEN: usize = 6;
pub const DNS_LABEL_MAX: usize = 63;

/// Command line handed over by the command wrapper. Opaque to the backends
/// apart from the `--` split between program and parameters.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandLine {
    pub text: String,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
}

impl CommandLine {
    pub fn new(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            env: BTreeMap::new(),
        }
    }

    pub fn with_env(mut self, key: &str, value: &str) -> Self {
        self.env.insert(key.to_string(), value.to_string());
        self
    }

    /// Tokens up to and including the `--` separator.
    pub fn program(&self) -> Vec<String> {
        let tokens: Vec<&str> = self.text.split_whitespace().collect();
        let end = match tokens.iter().position(|t| *t == "--") {
            Some(pos) => pos + 1,
            None => tokens.len(),
        };
        tokens[..end].iter().map(|t| t.to_string()).collect()
    }

    /// Tokens after the `--` separator; empty when there is none.
    pub fn params(&self) -> Vec<String> {
        let tokens: Vec<&str> = self.text.split_whitespace().collect();
        match tokens.iter().position(|t| *t == "--") {
            Some(pos) => tokens[pos + 1..].iter().map(|t| t.to_string()).collect(),
            None => Vec::new(),
        }
    }
}

/// One record of an experiment file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExperimentSpec {
    pub name: String,
    #[serde(default = "default_project")]
    pub project: String,
    #[serde(default, deserialize_with = "quantities")]
    pub resources: BTreeMap<String, String>,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    #[serde(default)]
    pub paths_to_copy: Vec<String>,
    #[serde(default)]
    pub exclude: Vec<String>,
    #[serde(default)]
    pub ntasks: Option<u32>,
    #[serde(default)]
    pub cmd: Option<String>,
}

fn default_project() -> String {
    DEFAULT_PROJECT.to_string()
}

/// Accepts `cpu: 4` as well as `cpu: "4"`.
fn quantities<'de, D>(deserializer: D) -> std::result::Result<BTreeMap<String, String>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Quantity {
        Text(String),
        Int(u64),
        Float(f64),
    }
    let raw = BTreeMap::<String, Quantity>::deserialize(deserializer)?;
    Ok(raw
        .into_iter()
        .map(|(kind, qty)| {
            let qty = match qty {
                Quantity::Text(s) => s,
                Quantity::Int(n) => n.to_string(),
                Quantity::Float(f) => f.to_string(),
            };
            (kind, qty)
        })
        .collect())
}

impl ExperimentSpec {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            project: default_project(),
            resources: BTreeMap::new(),
            env: BTreeMap::new(),
            paths_to_copy: Vec::new(),
            exclude: Vec::new(),
            ntasks: None,
            cmd: None,
        }
    }

    pub fn project(mut self, project: &str) -> Self {
        self.project = project.to_string();
        self
    }

    pub fn resource(mut self, kind: &str, quantity: &str) -> Self {
        self.resources.insert(kind.to_string(), quantity.to_string());
        self
    }

    pub fn env(mut self, key: &str, value: &str) -> Self {
        self.env.insert(key.to_string(), value.to_string());
        self
    }

    pub fn ntasks(mut self, ntasks: u32) -> Self {
        self.ntasks = Some(ntasks);
        self
    }

    pub fn exclude(mut self, path: &str) -> Self {
        self.exclude.push(path.to_string());
        self
    }

    pub fn copy_path(mut self, path: &str) -> Self {
        self.paths_to_copy.push(path.to_string());
        self
    }

    pub fn build(self, command: CommandLine, working_directory: &Path) -> Result<Experiment> {
        Experiment::new(self, command, working_directory)
    }
}

/// One resolved run. The run suffix is drawn once at construction, so
/// retrying a run with the same value reuses the same scratch paths.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Experiment {
    name: String,
    slug: String,
    project: String,
    command: CommandLine,
    resources: BTreeMap<String, String>,
    env: BTreeMap<String, String>,
    paths_to_copy: Vec<String>,
    exclude: Vec<String>,
    working_directory: PathBuf,
    ntasks: Option<u32>,
    run_suffix: String,
}

impl Experiment {
    pub fn new(spec: ExperimentSpec, command: CommandLine, working_directory: &Path) -> Result<Self> {
        Self::with_suffix(spec, command, working_directory, random_suffix(RUN_SUFFIX_LEN))
    }

    pub fn with_suffix(
        spec: ExperimentSpec,
        command: CommandLine,
        working_directory: &Path,
        run_suffix: String,
    ) -> Result<Self> {
        let slug = slugify(&spec.name);
        if slug.is_empty() {
            return Err(DeployError::configuration(format!(
                "experiment name {:?} has no alphanumeric characters",
                spec.name
            )));
        }
        if slugify(&spec.project).is_empty() {
            return Err(DeployError::configuration(format!(
                "project name {:?} has no alphanumeric characters",
                spec.project
            )));
        }
        if !working_directory.is_absolute() {
            return Err(DeployError::configuration(format!(
                "working directory must be absolute: {}",
                working_directory.display()
            )));
        }
        if spec.ntasks == Some(0) {
            return Err(DeployError::configuration("ntasks must be at least 1"));
        }
        check_env_names(&command.env)?;
        check_env_names(&spec.env)?;
        Ok(Self {
            name: spec.name,
            slug,
            project: spec.project,
            command,
            resources: spec.resources,
            env: spec.env,
            paths_to_copy: spec.paths_to_copy,
            exclude: spec.exclude,
            working_directory: working_directory.to_path_buf(),
            ntasks: spec.ntasks,
            run_suffix,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn slug(&self) -> &str {
        &self.slug
    }

    pub fn project(&self) -> &str {
        &self.project
    }

    pub fn command(&self) -> &CommandLine {
        &self.command
    }

    pub fn resources(&self) -> &BTreeMap<String, String> {
        &self.resources
    }

    pub fn env(&self) -> &BTreeMap<String, String> {
        &self.env
    }

    pub fn paths_to_copy(&self) -> &[String] {
        &self.paths_to_copy
    }

    pub fn exclude(&self) -> &[String] {
        &self.exclude
    }

    pub fn working_directory(&self) -> &Path {
        &self.working_directory
    }

    pub fn ntasks(&self) -> Option<u32> {
        self.ntasks
    }

    pub fn run_suffix(&self) -> &str {
        &self.run_suffix
    }

    /// `<slug>_<suffix>`: identifies this logical run across retries.
    pub fn unique_name(&self) -> String {
        format!("{}_{}", self.slug, self.run_suffix)
    }

    /// Command-wrapper env overlaid by the experiment env.
    pub fn merged_env(&self) -> BTreeMap<String, String> {
        let mut merged = self.command.env.clone();
        for (k, v) in &self.env {
            merged.insert(k.clone(), v.clone());
        }
        merged
    }
}

/// Lowercase DNS-1123 label: runs of anything outside `[a-z0-9]` collapse to
/// one `-`, at most 63 characters, no leading or trailing `-`.
pub fn slugify(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    let mut pending_dash = false;
    for c in raw.chars() {
        let c = c.to_ascii_lowercase();
        if c.is_ascii_lowercase() || c.is_ascii_digit() {
            if pending_dash && !out.is_empty() {
                out.push('-');
            }
            pending_dash = false;
            out.push(c);
        } else {
            pending_dash = true;
        }
    }
    out.truncate(DNS_LABEL_MAX);
    out.trim_end_matches('-').to_string()
}

/// Every key must be a portable variable name, `[A-Za-z_][A-Za-z0-9_]*`.
pub fn check_env_names(env: &BTreeMap<String, String>) -> Result<()> {
    for key in env.keys() {
        let mut chars = key.chars();
        let valid = matches!(chars.next(), Some(c) if c.is_ascii_alphabetic() || c == '_')
            && chars.all(|c| c.is_ascii_alphanumeric() || c == '_');
        if !valid {
            return Err(DeployError::configuration(format!(
                "invalid environment variable name {:?}",
                key
            )));
        }
    }
    Ok(())
}

pub fn random_suffix(len: usize) -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(len)
        .map(|b| (b as char).to_ascii_lowercase())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn workdir() -> PathBuf {
        PathBuf::from("/home/jj/project")
    }

    #[test]
    fn slugify_collapses_separators_and_lowercases() {
        assert_eq!(slugify("Foo Bar"), "foo-bar");
        assert_eq!(slugify("  lr=0.1, bs: 32 "), "lr-0-1-bs-32");
        assert_eq!(slugify("my_project/sub"), "my-project-sub");
        assert_eq!(slugify("--__--"), "");
    }

    #[test]
    fn slugify_respects_dns_label_length() {
        let long = format!("{}-{}", "a".repeat(62), "b".repeat(10));
        let slug = slugify(&long);
        assert!(slug.len() <= 63, "slug too long: {}", slug.len());
        assert!(!slug.ends_with('-'), "trailing dash in {}", slug);
    }

    #[test]
    fn experiment_defaults_project_and_ntasks() {
        let exp = ExperimentSpec::new("Foo Bar")
            .build(CommandLine::new("python train.py"), &workdir())
            .expect("experiment");
        assert_eq!(exp.project(), DEFAULT_PROJECT);
        assert_eq!(exp.slug(), "foo-bar");
        assert_eq!(exp.ntasks(), None);
        assert_eq!(exp.run_suffix().len(), RUN_SUFFIX_LEN);
        assert!(exp
            .run_suffix()
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit()));
        assert_eq!(exp.unique_name(), format!("foo-bar_{}", exp.run_suffix()));
    }

    #[test]
    fn suffix_is_fixed_for_the_lifetime_of_an_experiment() {
        let exp = ExperimentSpec::new("exp")
            .build(CommandLine::new("true"), &workdir())
            .expect("experiment");
        let copy = exp.clone();
        assert_eq!(exp.unique_name(), copy.unique_name());
    }

    #[test]
    fn experiment_rejects_bad_inputs() {
        let err = ExperimentSpec::new("???")
            .build(CommandLine::new("true"), &workdir())
            .expect_err("empty slug");
        assert!(err.is_configuration());

        let err = ExperimentSpec::new("exp")
            .build(CommandLine::new("true"), Path::new("relative/dir"))
            .expect_err("relative workdir");
        assert!(err.to_string().contains("absolute"), "{}", err);

        let err = ExperimentSpec::new("exp")
            .ntasks(0)
            .build(CommandLine::new("true"), &workdir())
            .expect_err("zero ntasks");
        assert!(err.is_configuration());
    }

    #[test]
    fn merged_env_prefers_experiment_values() {
        let cmd = CommandLine::new("python train.py")
            .with_env("SHARED", "from-cmd")
            .with_env("CMD_ONLY", "1");
        let exp = ExperimentSpec::new("exp")
            .env("SHARED", "from-exp")
            .env("EXP_ONLY", "2")
            .build(cmd, &workdir())
            .expect("experiment");
        let env = exp.merged_env();
        assert_eq!(env.get("SHARED").map(String::as_str), Some("from-exp"));
        assert_eq!(env.get("CMD_ONLY").map(String::as_str), Some("1"));
        assert_eq!(env.get("EXP_ONLY").map(String::as_str), Some("2"));
    }

    #[test]
    fn command_line_splits_on_separator() {
        let cmd = CommandLine::new("python train.py --config c.yaml -- --lr 0.1 --bs 32");
        assert_eq!(
            cmd.program(),
            vec!["python", "train.py", "--config", "c.yaml", "--"]
        );
        assert_eq!(cmd.params(), vec!["--lr", "0.1", "--bs", "32"]);

        let trailing = CommandLine::new("python train.py --");
        assert_eq!(trailing.program(), vec!["python", "train.py", "--"]);
        assert!(trailing.params().is_empty());

        let bare = CommandLine::new("python train.py");
        assert_eq!(bare.program(), vec!["python", "train.py"]);
        assert!(bare.params().is_empty());
    }

    #[test]
    fn spec_record_deserializes_with_defaults() {
        let spec: ExperimentSpec = serde_yaml::from_str(
            "name: Foo Bar\nresources:\n  cpu: '8'\nexclude: [data]\n",
        )
        .expect("parse");
        assert_eq!(spec.project, "sandbox");
        assert_eq!(spec.resources.get("cpu").map(String::as_str), Some("8"));
        assert_eq!(spec.exclude, vec!["data"]);
        assert_eq!(spec.ntasks, None);
    }

    #[test]
    fn numeric_quantities_read_as_text() {
        let spec: ExperimentSpec =
            serde_yaml::from_str("name: n\nresources:\n  cpu: 8\n  gpu: 0.5\n  mem: 8G\n")
                .expect("parse");
        assert_eq!(spec.resources.get("cpu").map(String::as_str), Some("8"));
        assert_eq!(spec.resources.get("gpu").map(String::as_str), Some("0.5"));
        assert_eq!(spec.resources.get("mem").map(String::as_str), Some("8G"));
    }

    #[test]
    fn env_names_must_be_portable_identifiers() {
        let bad = ExperimentSpec::new("exp")
            .env("X; touch /tmp/owned; Y", "1")
            .build(CommandLine::new("python train.py"), &workdir())
            .expect_err("shell code in key");
        assert!(bad.is_configuration(), "unexpected: {}", bad);

        let dashed = ExperimentSpec::new("exp")
            .build(
                CommandLine::new("python train.py").with_env("A-B", "1"),
                &workdir(),
            )
            .expect_err("dash in command env key");
        assert!(dashed.is_configuration());

        let env: BTreeMap<String, String> = [("_OK_1", "x"), ("CUDA_VISIBLE_DEVICES", "0")]
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        check_env_names(&env).expect("valid names");
        let leading_digit: BTreeMap<String, String> =
            [("1X".to_string(), "v".to_string())].into_iter().collect();
        assert!(check_env_names(&leading_digit).is_err());
    }
}
