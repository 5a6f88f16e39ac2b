//! Remote shell seam for the batch backend.
//!
//! `RemoteShell` is what the backend talks to; `SshSession` is the production
//! implementation that drives the system `ssh`/`scp` binaries in batch mode.

use crate::context::BatchSettings;
use crate::error::{DeployError, Result};
use std::path::Path;
use std::process::{Command, Output};
use tracing::debug;

pub trait RemoteShell {
    /// Runs `command` remotely; non-zero exit is a `RemoteCommand` error.
    fn run(&mut self, command: &str) -> Result<String>;

    fn exists(&mut self, remote_path: &str) -> Result<bool>;

    fn upload(&mut self, local: &Path, remote_path: &str) -> Result<()>;
}

const SSH_AUTH_FAILURE: i32 = 255;

pub struct SshSession {
    destination: String,
    port: Option<u16>,
    identity_file: Option<String>,
}

impl SshSession {
    /// Verifies that an identity is available before touching the network,
    /// then checks the session once.
    pub fn connect(settings: &BatchSettings) -> Result<Self> {
        let (user, host) = settings.user_and_host()?;
        check_identity(settings.identity_file.as_deref())?;
        let mut session = Self {
            destination: format!("{}@{}", user, host),
            port: settings.ssh_port,
            identity_file: settings.identity_file.clone(),
        };
        session.run("true").map_err(|e| match e {
            DeployError::RemoteCommand {
                exit_status, stderr, ..
            } if exit_status == SSH_AUTH_FAILURE => DeployError::Authentication(format!(
                "cannot open session to {}: {}",
                session.destination,
                stderr.trim()
            )),
            other => other,
        })?;
        debug!(destination = %session.destination, "ssh session established");
        Ok(session)
    }

    pub fn destination(&self) -> &str {
        &self.destination
    }

    fn common_options(&self) -> Vec<String> {
        let mut args = vec![
            "-o".to_string(),
            "BatchMode=yes".to_string(),
            "-o".to_string(),
            "ConnectTimeout=60".to_string(),
            "-o".to_string(),
            "ConnectionAttempts=5".to_string(),
        ];
        if let Some(key) = &self.identity_file {
            args.push("-i".to_string());
            args.push(key.clone());
        }
        args
    }

    pub fn ssh_args(&self, command: &str) -> Vec<String> {
        let mut args = Vec::new();
        if let Some(port) = self.port {
            args.push("-p".to_string());
            args.push(port.to_string());
        }
        args.extend(self.common_options());
        args.push(self.destination.clone());
        args.push(command.to_string());
        args
    }

    pub fn scp_args(&self, local: &Path, remote_path: &str) -> Vec<String> {
        let mut args = vec!["-q".to_string()];
        if let Some(port) = self.port {
            args.push("-P".to_string());
            args.push(port.to_string());
        }
        args.extend(self.common_options());
        args.push(local.display().to_string());
        args.push(format!("{}:{}", self.destination, remote_path));
        args
    }

    fn exec(&self, command: &str) -> Result<Output> {
        debug!(destination = %self.destination, command, "ssh");
        Ok(Command::new("ssh").args(self.ssh_args(command)).output()?)
    }
}

impl RemoteShell for SshSession {
    fn run(&mut self, command: &str) -> Result<String> {
        let output = self.exec(command)?;
        if !output.status.success() {
            return Err(DeployError::RemoteCommand {
                command: command.to_string(),
                exit_status: output.status.code().unwrap_or(-1),
                stderr: String::from_utf8_lossy(&output.stderr).to_string(),
            });
        }
        Ok(String::from_utf8_lossy(&output.stdout).to_string())
    }

    fn exists(&mut self, remote_path: &str) -> Result<bool> {
        let command = format!("test -e {}", shell_quote(remote_path));
        let output = self.exec(&command)?;
        match output.status.code() {
            Some(0) => Ok(true),
            Some(1) => Ok(false),
            code => Err(DeployError::RemoteCommand {
                command,
                exit_status: code.unwrap_or(-1),
                stderr: String::from_utf8_lossy(&output.stderr).to_string(),
            }),
        }
    }

    fn upload(&mut self, local: &Path, remote_path: &str) -> Result<()> {
        debug!(local = %local.display(), remote_path, "scp");
        let output = Command::new("scp")
            .args(self.scp_args(local, remote_path))
            .output()
            .map_err(|e| DeployError::transfer(format!("cannot start scp: {}", e)))?;
        if !output.status.success() {
            return Err(DeployError::transfer(format!(
                "upload of {} to {} failed: {}",
                local.display(),
                remote_path,
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }
        Ok(())
    }
}

/// Fails unless a configured key file is readable or the ssh agent holds at
/// least one key.
pub fn check_identity(identity_file: Option<&str>) -> Result<()> {
    if let Some(key) = identity_file {
        let path = Path::new(key);
        return if path.is_file() {
            Ok(())
        } else {
            Err(DeployError::Authentication(format!(
                "identity file {} is not readable",
                path.display()
            )))
        };
    }
    if std::env::var_os("SSH_AUTH_SOCK").is_none() {
        return Err(DeployError::Authentication(
            "no ssh agent running; start one and add your key with `ssh-add`".to_string(),
        ));
    }
    let listed = Command::new("ssh-add")
        .arg("-l")
        .output()
        .map(|o| o.status.success())
        .unwrap_or(false);
    if !listed {
        return Err(DeployError::Authentication(
            "ssh agent holds no keys; add your private key with `ssh-add`".to_string(),
        ));
    }
    Ok(())
}

pub fn shell_join(parts: &[String]) -> String {
    parts
        .iter()
        .map(|p| shell_quote(p))
        .collect::<Vec<_>>()
        .join(" ")
}

pub fn shell_quote(s: &str) -> String {
    if s.is_empty() {
        "''".to_string()
    } else if s
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || "-_./:=@%+,".contains(c))
    {
        s.to_string()
    } else {
        format!("'{}'", s.replace('\'', "'\"'\"'"))
    }
}
