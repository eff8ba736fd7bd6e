//! Address management.
//!
//! Addresses come from an IPAM plugin found on `CNI_PATH`, invoked with the
//! same network configuration and environment as this plugin.

use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};

use hitch_common::{HitchError, HitchResult};

use crate::config::NetConf;
use crate::request::PluginRequest;
use crate::result::{CniError, CniResult};

/// Source of container addresses.
pub trait Ipam {
    /// Reserve addresses for the request's container from the configured pool.
    ///
    /// # Errors
    ///
    /// Returns an error if no address could be reserved.
    fn reserve_address(&mut self, conf: &NetConf, request: &PluginRequest) -> HitchResult<CniResult>;

    /// Release whatever was reserved for the request's container.
    ///
    /// Releasing an address that is not reserved succeeds.
    ///
    /// # Errors
    ///
    /// Returns an error if the IPAM backend fails.
    fn release_address(&mut self, conf: &NetConf, request: &PluginRequest) -> HitchResult<()>;
}

/// IPAM through a delegated CNI plugin binary.
#[derive(Debug, Clone, Default)]
pub struct DelegatedIpam;

impl DelegatedIpam {
    /// Locate the plugin named by `ipam.type`.
    fn find_plugin(conf: &NetConf, paths: &[PathBuf]) -> HitchResult<PathBuf> {
        let name = &conf.ipam.ipam_type;
        if name.is_empty() {
            return Err(HitchError::Config {
                message: "missing ipam type".to_string(),
            });
        }

        paths
            .iter()
            .map(|dir| dir.join(name))
            .find(|candidate| candidate.is_file())
            .ok_or_else(|| HitchError::Config {
                message: format!("IPAM plugin {name} not found in CNI_PATH"),
            })
    }

    fn invoke(plugin: &Path, command: &str, conf: &NetConf, request: &PluginRequest) -> HitchResult<Vec<u8>> {
        tracing::debug!(plugin = %plugin.display(), command, "Invoking IPAM plugin");

        let netns = request
            .netns
            .as_ref()
            .map(|p| p.display().to_string())
            .unwrap_or_default();
        let cni_path = std::env::join_paths(&request.plugin_paths).map_err(|e| HitchError::Config {
            message: format!("invalid CNI_PATH: {e}"),
        })?;

        let mut child = Command::new(plugin)
            .env("CNI_COMMAND", command)
            .env("CNI_CONTAINERID", &request.container_id)
            .env("CNI_NETNS", netns)
            .env("CNI_IFNAME", &request.if_name)
            .env("CNI_ARGS", request.args.as_raw())
            .env("CNI_PATH", cni_path)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()?;

        if let Some(mut stdin) = child.stdin.take() {
            stdin.write_all(&request.stdin)?;
        }
        let output = child.wait_with_output()?;

        if output.status.success() {
            return Ok(output.stdout);
        }

        let message = serde_json::from_slice::<CniError>(&output.stdout).map_or_else(
            |_| String::from_utf8_lossy(&output.stderr).trim().to_string(),
            |err| format!("code {}: {}", err.code, err.msg),
        );
        Err(HitchError::Internal {
            message: format!("IPAM plugin {} {command} failed: {message}", conf.ipam.ipam_type),
        })
    }
}

impl Ipam for DelegatedIpam {
    fn reserve_address(&mut self, conf: &NetConf, request: &PluginRequest) -> HitchResult<CniResult> {
        let plugin = Self::find_plugin(conf, &request.plugin_paths)?;
        let stdout = Self::invoke(&plugin, "ADD", conf, request)?;
        let result: CniResult = serde_json::from_slice(&stdout)?;

        if result.ips.is_empty() {
            return Err(HitchError::Internal {
                message: format!("IPAM plugin {} returned no addresses", conf.ipam.ipam_type),
            });
        }
        tracing::info!(
            container_id = %request.container_id,
            addresses = ?result.ips.iter().map(|ip| ip.address).collect::<Vec<_>>(),
            "Reserved addresses"
        );
        Ok(result)
    }

    fn release_address(&mut self, conf: &NetConf, request: &PluginRequest) -> HitchResult<()> {
        let plugin = Self::find_plugin(conf, &request.plugin_paths)?;
        Self::invoke(&plugin, "DEL", conf, request)?;
        tracing::info!(container_id = %request.container_id, "Released addresses");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::request::{CniArgs, CniCommand};
    use std::os::unix::fs::PermissionsExt;
    use tempfile::TempDir;

    fn conf(ipam_type: &str) -> NetConf {
        let mut conf = NetConf::parse(br#"{"name":"n1"}"#).unwrap();
        conf.ipam.ipam_type = ipam_type.to_string();
        conf
    }

    fn request(dir: &Path) -> PluginRequest {
        PluginRequest {
            command: CniCommand::Add,
            container_id: "1a2b3c4d5e6f".to_string(),
            netns: None,
            if_name: "eth0".to_string(),
            args: CniArgs::default(),
            plugin_paths: vec![dir.to_path_buf()],
            stdin: br#"{"name":"n1"}"#.to_vec(),
        }
    }

    fn install(dir: &Path, name: &str, script: &str) {
        let path = dir.join(name);
        std::fs::write(&path, script).unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
    }

    #[test]
    fn missing_plugin_is_config_error() {
        let dir = TempDir::new().unwrap();
        let err = DelegatedIpam.reserve_address(&conf("nope"), &request(dir.path())).unwrap_err();
        assert!(matches!(err, HitchError::Config { .. }));
    }

    #[test]
    fn empty_type_is_config_error() {
        let dir = TempDir::new().unwrap();
        let err = DelegatedIpam.release_address(&conf(""), &request(dir.path())).unwrap_err();
        assert!(matches!(err, HitchError::Config { .. }));
    }

    #[test]
    fn reserve_parses_plugin_result() {
        let dir = TempDir::new().unwrap();
        install(
            dir.path(),
            "fake-ipam",
            "#!/bin/sh\ncat > /dev/null\n[ \"$CNI_COMMAND\" = ADD ] || exit 1\n\
             echo '{\"cniVersion\":\"0.3.0\",\"ips\":[{\"version\":\"4\",\"address\":\"10.0.0.5/24\",\"gateway\":\"10.0.0.1\"}]}'\n",
        );

        let result = DelegatedIpam
            .reserve_address(&conf("fake-ipam"), &request(dir.path()))
            .unwrap();
        assert_eq!(result.ips[0].address.to_string(), "10.0.0.5/24");
        assert_eq!(result.first_gateway(), Some("10.0.0.1".parse().unwrap()));
    }

    #[test]
    fn plugin_error_is_reported() {
        let dir = TempDir::new().unwrap();
        install(
            dir.path(),
            "fake-ipam",
            "#!/bin/sh\ncat > /dev/null\necho '{\"code\":11,\"msg\":\"pool exhausted\"}'\nexit 1\n",
        );

        let err = DelegatedIpam
            .reserve_address(&conf("fake-ipam"), &request(dir.path()))
            .unwrap_err();
        assert!(err.to_string().contains("pool exhausted"));
    }
}
