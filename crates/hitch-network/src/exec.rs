//! Host command execution.
//!
//! Every change to kernel or Open vSwitch state goes through a
//! [`ControlPlane`]. Callers build typed commands ([`LinkCommand`],
//! [`EbtablesCommand`], ...); turning them into argument vectors happens only
//! here, so the rest of the crate never formats shell strings.

use std::fmt;
use std::process::Command;

use hitch_common::{HitchError, HitchResult};

use crate::ebtables::EbtablesCommand;
use crate::iptables::IptablesCommand;
use crate::link::LinkCommand;
use crate::ovsctl::OvsCommand;

/// A typed host command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HostCommand {
    /// `ip` / `bridge` link, address, route and neighbour commands.
    Link(LinkCommand),
    /// `ebtables` nat table commands.
    Ebtables(EbtablesCommand),
    /// `iptables` commands.
    Iptables(IptablesCommand),
    /// `ovs-vsctl` / `ovs-ofctl` commands.
    Ovs(OvsCommand),
}

impl HostCommand {
    /// Program to execute.
    #[must_use]
    pub const fn program(&self) -> &'static str {
        match self {
            Self::Link(cmd) => cmd.program(),
            Self::Ebtables(_) => "ebtables",
            Self::Iptables(_) => "iptables",
            Self::Ovs(cmd) => cmd.program(),
        }
    }

    /// Program arguments.
    #[must_use]
    pub fn args(&self) -> Vec<String> {
        match self {
            Self::Link(cmd) => cmd.args(),
            Self::Ebtables(cmd) => cmd.args(),
            Self::Iptables(cmd) => cmd.args(),
            Self::Ovs(cmd) => cmd.args(),
        }
    }
}

impl fmt::Display for HostCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.program())?;
        for arg in self.args() {
            write!(f, " {arg}")?;
        }
        Ok(())
    }
}

impl From<LinkCommand> for HostCommand {
    fn from(cmd: LinkCommand) -> Self {
        Self::Link(cmd)
    }
}

impl From<EbtablesCommand> for HostCommand {
    fn from(cmd: EbtablesCommand) -> Self {
        Self::Ebtables(cmd)
    }
}

impl From<IptablesCommand> for HostCommand {
    fn from(cmd: IptablesCommand) -> Self {
        Self::Iptables(cmd)
    }
}

impl From<OvsCommand> for HostCommand {
    fn from(cmd: OvsCommand) -> Self {
        Self::Ovs(cmd)
    }
}

/// Captured result of a host command.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOutput {
    /// Exit status, `None` if killed by a signal.
    pub status: Option<i32>,
    /// Standard output.
    pub stdout: String,
    /// Standard error.
    pub stderr: String,
}

impl CommandOutput {
    /// Successful output with the given stdout.
    #[must_use]
    pub fn ok(stdout: impl Into<String>) -> Self {
        Self {
            status: Some(0),
            stdout: stdout.into(),
            stderr: String::new(),
        }
    }

    /// Failed output with the given stderr.
    #[must_use]
    pub fn failed(status: i32, stderr: impl Into<String>) -> Self {
        Self {
            status: Some(status),
            stdout: String::new(),
            stderr: stderr.into(),
        }
    }

    /// Whether the command exited with status 0.
    #[must_use]
    pub const fn success(&self) -> bool {
        matches!(self.status, Some(0))
    }
}

/// Executes host commands.
pub trait ControlPlane: Send + Sync {
    /// Execute a command and capture its output, whatever the exit status.
    ///
    /// # Errors
    ///
    /// Returns an error only if the command could not be started.
    fn execute(&self, command: &HostCommand) -> HitchResult<CommandOutput>;

    /// Execute a command, treating a non-zero exit as an error.
    ///
    /// # Errors
    ///
    /// Returns [`HitchError::KernelCommandFailed`] carrying stderr on failure.
    fn run(&self, command: HostCommand) -> HitchResult<String> {
        let output = self.execute(&command)?;
        if output.success() {
            Ok(output.stdout)
        } else {
            Err(HitchError::KernelCommandFailed {
                command: command.to_string(),
                status: output.status,
                stderr: output.stderr.trim().to_string(),
            })
        }
    }
}

/// Control plane that runs real binaries on the host.
#[derive(Debug, Default, Clone, Copy)]
pub struct ShellControlPlane;

impl ControlPlane for ShellControlPlane {
    fn execute(&self, command: &HostCommand) -> HitchResult<CommandOutput> {
        tracing::debug!(command = %command, "Executing host command");

        let output = Command::new(command.program())
            .args(command.args())
            .output()
            .map_err(|e| HitchError::KernelCommandFailed {
                command: command.to_string(),
                status: None,
                stderr: format!("failed to execute {}: {e}", command.program()),
            })?;

        Ok(CommandOutput {
            status: output.status.code(),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        })
    }
}

/// Whether a command failure only says the object already exists.
#[must_use]
pub fn is_exists_error(err: &HitchError) -> bool {
    matches!(err, HitchError::KernelCommandFailed { stderr, .. }
        if stderr.to_lowercase().contains("file exists"))
}

/// Whether a command failure only says the object does not exist.
#[must_use]
pub fn is_missing_error(err: &HitchError) -> bool {
    matches!(err, HitchError::KernelCommandFailed { stderr, .. }
        if {
            let stderr = stderr.to_lowercase();
            stderr.contains("cannot find device")
                || stderr.contains("does not exist")
                || stderr.contains("no such")
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn output_success() {
        assert!(CommandOutput::ok("").success());
        assert!(!CommandOutput::failed(1, "boom").success());
        assert!(
            !CommandOutput {
                status: None,
                ..CommandOutput::default()
            }
            .success()
        );
    }

    #[test]
    fn display_joins_program_and_args() {
        let cmd = HostCommand::from(LinkCommand::Delete {
            name: "azv1234567".to_string(),
        });
        assert_eq!(cmd.to_string(), "ip link delete azv1234567");
    }

    #[test]
    fn error_classification() {
        let exists = HitchError::KernelCommandFailed {
            command: "ip addr add".to_string(),
            status: Some(2),
            stderr: "RTNETLINK answers: File exists".to_string(),
        };
        assert!(is_exists_error(&exists));
        assert!(!is_missing_error(&exists));

        let missing = HitchError::KernelCommandFailed {
            command: "ip link delete x".to_string(),
            status: Some(1),
            stderr: "Cannot find device \"x\"".to_string(),
        };
        assert!(is_missing_error(&missing));
    }
}
