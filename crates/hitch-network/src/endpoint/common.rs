//! Steps shared by the endpoint clients.

use hitch_common::{HitchError, HitchResult, MacAddress};
use ipnet::IpNet;

use crate::exec::ControlPlane;
use crate::link;
use crate::types::Route;

/// Hardware address of an existing link.
///
/// # Errors
///
/// Returns an error if the link is missing or has no MAC.
pub fn link_mac(cp: &dyn ControlPlane, name: &str) -> HitchResult<MacAddress> {
    link::show_link(cp, name)?
        .and_then(|info| info.mac)
        .ok_or_else(|| HitchError::InterfaceCreationFailed {
            name: name.to_string(),
            reason: "interface has no hardware address".to_string(),
        })
}

/// Rename a container veth to its final name and bring it up.
///
/// # Errors
///
/// Returns an error if any step fails.
pub fn setup_container_interface(cp: &dyn ControlPlane, veth: &str, if_name: &str) -> HitchResult<()> {
    tracing::debug!(veth, if_name, "Setting up container interface");
    link::set_link_state(cp, veth, false)?;
    link::rename_link(cp, veth, if_name)?;
    link::set_link_state(cp, if_name, true)
}

/// Assign addresses to an interface.
///
/// # Errors
///
/// Returns an error on the first address the kernel refuses.
pub fn assign_addresses(cp: &dyn ControlPlane, if_name: &str, addresses: &[IpNet]) -> HitchResult<()> {
    for addr in addresses {
        link::add_address(cp, if_name, *addr)?;
    }
    Ok(())
}

/// Install routes on an interface.
///
/// # Errors
///
/// Returns an error on the first route the kernel refuses.
pub fn add_routes(cp: &dyn ControlPlane, if_name: &str, routes: &[Route]) -> HitchResult<()> {
    for route in routes {
        link::add_route(cp, if_name, route)?;
    }
    Ok(())
}

/// Host route to a single container address.
#[must_use]
pub fn host_route(addr: IpNet) -> Route {
    let dst = IpNet::new(addr.addr(), addr.max_prefix_len()).unwrap_or(addr);
    Route::link(dst)
}
