//! Plugin orchestration.
//!
//! Every invocation runs the same frame: take the store lock, load the
//! network state, run the command, persist the state, release the lock and
//! report. Commands mutate the kernel and the in-memory state together, so
//! the state is persisted even when a command fails halfway; whatever the
//! command left behind on the host is then recorded.

use std::sync::Arc;
use std::time::Instant;

use hitch_common::{HitchError, HitchResult, KeyValueStore, Metric, Report, TelemetrySink};
use hitch_network::{DnsConfig, EndpointInfo, HostContext, NetworkInfo, NetworkManager, Route};

use crate::config::{NetConf, PluginConfig};
use crate::ipam::Ipam;
use crate::monitor;
use crate::request::{CniCommand, PluginRequest};
use crate::result::CniResult;

/// The network plugin, generic over its state store and address source.
pub struct NetPlugin<S: KeyValueStore, I: Ipam> {
    config: PluginConfig,
    host: HostContext,
    store: S,
    ipam: I,
    telemetry: Arc<dyn TelemetrySink>,
}

impl<S: KeyValueStore, I: Ipam> NetPlugin<S, I> {
    /// Assemble a plugin.
    pub fn new(config: PluginConfig, host: HostContext, store: S, ipam: I, telemetry: Arc<dyn TelemetrySink>) -> Self {
        Self {
            config,
            host,
            store,
            ipam,
            telemetry,
        }
    }

    /// The state store.
    pub const fn store(&self) -> &S {
        &self.store
    }

    /// The address source.
    pub const fn ipam(&self) -> &I {
        &self.ipam
    }

    /// Run a request under the store lock and report the outcome.
    ///
    /// `DEL` produces no result.
    ///
    /// # Errors
    ///
    /// Returns the first error of validation, locking, the command itself or
    /// persisting the state.
    pub fn execute(&mut self, request: &PluginRequest) -> HitchResult<Option<CniResult>> {
        let started = Instant::now();
        let mut report = Report::new(
            crate::PLUGIN_NAME,
            &self.config.version,
            request.command.as_str(),
            &request.container_id,
        );

        let result = NetConf::parse(&request.stdin).and_then(|conf| self.locked(request, &conf));

        let elapsed = started.elapsed();
        report.finish(result.as_ref().err().map(ToString::to_string), elapsed);
        self.telemetry.track_log(&report);
        self.telemetry.track_metric(
            &Metric::new("cni_operation_duration_ms", elapsed.as_secs_f64() * 1000.0)
                .with_dimension("operation", request.command.as_str())
                .with_dimension("succeeded", report.succeeded.to_string()),
        );
        self.telemetry.flush(self.config.telemetry_flush_timeout);

        result
    }

    fn locked(&mut self, request: &PluginRequest, conf: &NetConf) -> HitchResult<Option<CniResult>> {
        self.acquire_lock(conf)?;
        let result = self.run(request, conf);
        if let Err(e) = self.store.unlock(false) {
            tracing::error!(error = %e, "Failed to release store lock");
        }
        result
    }

    /// Take the store lock, clearing it once if its owner is gone.
    ///
    /// The plugin and the network monitor share the lock, so a live process
    /// running either of them keeps it.
    fn acquire_lock(&mut self, conf: &NetConf) -> HitchResult<()> {
        let Err(err) = self.store.lock(true) else {
            return Ok(());
        };

        let mut holders = vec![self.config.process_name.as_str(), crate::MONITOR_NAME];
        if let Some(monitor) = conf.network_monitor.as_ref().filter(|m| !m.name.is_empty()) {
            holders.push(monitor.name.as_str());
        }
        if !self.store.is_lock_stale(&holders) {
            return Err(err);
        }

        tracing::warn!(error = %err, "Removing lock left behind by an exited process");
        self.store.unlock(true)?;
        self.store.lock(true)
    }

    fn run(&mut self, request: &PluginRequest, conf: &NetConf) -> HitchResult<Option<CniResult>> {
        let mut manager = NetworkManager::restore(self.host.clone(), &mut self.store)?;

        let result = match request.command {
            CniCommand::Add => self.add(&mut manager, request, conf).map(Some),
            CniCommand::Del => self.delete(&mut manager, request, conf).map(|()| None),
            CniCommand::Get => Self::get(&manager, request, conf).map(Some),
            CniCommand::Update => Self::update(&mut manager, request, conf).map(Some),
            CniCommand::Version => Err(HitchError::Unsupported {
                feature: "VERSION as a stateful command".to_string(),
            }),
        };

        match manager.save(&mut self.store) {
            Ok(()) => result,
            Err(e) if result.is_ok() => Err(e),
            Err(e) => {
                tracing::error!(error = %e, "Failed to save state after failed command");
                result
            }
        }
    }

    fn add(&mut self, manager: &mut NetworkManager, request: &PluginRequest, conf: &NetConf) -> HitchResult<CniResult> {
        let endpoint_id = request.endpoint_id()?;
        if manager.get_endpoint(&conf.name, &endpoint_id).is_ok() {
            return Err(HitchError::DuplicateEndpoint {
                network: conf.name.clone(),
                endpoint: endpoint_id,
            });
        }

        tracing::info!(
            network = %conf.name,
            container_id = %request.container_id,
            pool = ?conf.pool_id(),
            "Reserving address"
        );
        let reserved = self.ipam.reserve_address(conf, request)?;

        match Self::attach(manager, request, conf, &endpoint_id, &reserved) {
            Ok(result) => {
                self.ensure_monitor(conf);
                Ok(result)
            }
            Err(e) => {
                tracing::error!(endpoint = %endpoint_id, error = %e, "Add failed, releasing address");
                if let Err(release) = self.ipam.release_address(conf, request) {
                    tracing::warn!(error = %release, "Failed to release address");
                }
                Err(e)
            }
        }
    }

    fn attach(
        manager: &mut NetworkManager,
        request: &PluginRequest,
        conf: &NetConf,
        endpoint_id: &str,
        reserved: &CniResult,
    ) -> HitchResult<CniResult> {
        let ip_addresses: Vec<_> = reserved.ips.iter().map(|ip| ip.address).collect();

        if manager.network(&conf.name).is_none() {
            let subnets = match conf.pool_id() {
                Some(subnet) => vec![subnet],
                None => ip_addresses.iter().map(ipnet::IpNet::trunc).collect(),
            };
            let info = NetworkInfo {
                id: conf.name.clone(),
                mode: conf.network_mode()?,
                master_if_name: conf.master.clone().unwrap_or_default(),
                bridge_name: conf.bridge.clone(),
                subnets,
                vlan_id: conf.vlan_id,
                dns: conf.dns_config(),
                snat_bridge_ip: conf.snat_bridge_ip,
                enable_snat_on_host: conf.enable_snat_on_host,
            };
            manager.create_network(&info)?;
        }

        let mut routes: Vec<Route> = reserved.routes.iter().map(Route::from).collect();
        if !routes.iter().any(Route::is_default) {
            if let Some(gateway) = reserved.first_gateway() {
                routes.push(Route::default_via(gateway));
            }
        }

        let dns = if conf.dns.is_empty() {
            DnsConfig::from(&reserved.dns)
        } else {
            conf.dns_config()
        };

        let info = EndpointInfo {
            id: endpoint_id.to_string(),
            container_id: request.container_id.clone(),
            netns_path: request.netns.clone(),
            if_name: request.if_name.clone(),
            veth_key: request.veth_key(),
            ip_addresses,
            routes,
            dns,
            enable_snat_on_host: conf.enable_snat_on_host,
            allow_inbound_host_to_nc: conf.allow_inbound_host_to_nc,
            allow_inbound_nc_to_host: conf.allow_inbound_nc_to_host,
            local_ip: conf.local_ip,
        };
        let ep = manager.create_endpoint(&conf.name, &info)?;
        Ok(CniResult::for_endpoint(conf.result_version(), &ep))
    }

    fn ensure_monitor(&self, conf: &NetConf) {
        let Some(monitor_conf) = conf.network_monitor.as_ref() else {
            return;
        };
        let bin_dir = self
            .config
            .bin_dir
            .clone()
            .or_else(|| std::env::current_exe().ok()?.parent().map(std::path::Path::to_path_buf));
        let Some(bin_dir) = bin_dir else {
            tracing::warn!("Cannot locate network monitor binary");
            return;
        };

        if let Err(e) = monitor::start_monitor_if_not_running(monitor_conf, &self.config.paths, &bin_dir) {
            tracing::warn!(error = %e, "Failed to start network monitor");
        }
    }

    fn delete(&mut self, manager: &mut NetworkManager, request: &PluginRequest, conf: &NetConf) -> HitchResult<()> {
        let endpoint_id = request.endpoint_id()?;
        tracing::info!(network = %conf.name, endpoint = %endpoint_id, "Deleting endpoint");

        manager.delete_endpoint(&conf.name, &endpoint_id)?;
        if conf.ipam.ipam_type.is_empty() {
            return Ok(());
        }
        if let Err(e) = self.ipam.release_address(conf, request) {
            tracing::warn!(endpoint = %endpoint_id, error = %e, "Failed to release address");
        }
        Ok(())
    }

    fn get(manager: &NetworkManager, request: &PluginRequest, conf: &NetConf) -> HitchResult<CniResult> {
        let endpoint_id = request.endpoint_id()?;
        let ep = manager.get_endpoint(&conf.name, &endpoint_id)?;
        Ok(CniResult::for_endpoint(conf.result_version(), ep))
    }

    fn update(manager: &mut NetworkManager, request: &PluginRequest, conf: &NetConf) -> HitchResult<CniResult> {
        let endpoint_id = request.endpoint_id()?;
        tracing::info!(network = %conf.name, endpoint = %endpoint_id, "Updating endpoint DNS");
        let ep = manager.update_endpoint_dns(&conf.name, &endpoint_id, conf.dns_config())?;
        Ok(CniResult::for_endpoint(conf.result_version(), &ep))
    }
}
