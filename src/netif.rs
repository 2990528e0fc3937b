use std::net::IpAddr;

use anyhow::{Context, Result, bail};
use local_ip_address::list_afinet_netifas;

/// Pick the address decoy listeners bind on.
///
/// With `name`, the address of that interface; otherwise the address of
/// the first non-loopback interface that is up. No usable interface is a
/// startup-fatal condition.
pub fn bind_address(name: Option<&str>) -> Result<IpAddr> {
	let netifas = list_afinet_netifas().context("enumerating network interfaces")?;
	select_address(&netifas, name)
}

fn select_address(netifas: &[(String, IpAddr)], name: Option<&str>) -> Result<IpAddr> {
	match name {
		Some(want) => netifas
			.iter()
			.find(|(ifname, _)| ifname.as_str() == want)
			.map(|(_, ip)| *ip)
			.with_context(|| format!("interface {:?} not found", want)),
		None => {
			for (_, ip) in netifas {
				if !ip.is_loopback() {
					return Ok(*ip);
				}
			}
			bail!("no non-loopback interface found");
		}
	}
}
