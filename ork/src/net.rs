//! Link enumeration and traffic-control surface.
//!
//! Link operations (listing vxlan overlays, administrative down) go through
//! rtnetlink; queueing-discipline manipulation goes through the `tc` binary,
//! which is the stable CLI for tbf/netem configuration. The netlink
//! connection is owned by a private current-thread tokio runtime so the
//! calling monitor threads stay synchronous.

use std::process::Command;

use futures_util::TryStreamExt;
use netlink_packet_route::link::{InfoKind, LinkAttribute, LinkInfo};

use crate::error::NetError;

/// Root qdisc kinds installed by the kernel itself; anything else was put
/// there by a previous shaping pass (or an operator) and must be removed
/// before a new rung is applied.
const DEFAULT_QDISCS: &[&str] = &["noop", "noqueue", "pfifo_fast", "mq", "fq_codel"];

/// The link operations the NIC sampler and shaper consume.
pub trait LinkControl: Send + Sync {
    /// Names of all vxlan overlay interfaces.
    ///
    /// # Errors
    ///
    /// Fails when the link dump cannot be read.
    fn vxlan_links(&self) -> Result<Vec<String>, NetError>;

    /// Administratively sets a link down. Terminal for the interface.
    ///
    /// # Errors
    ///
    /// Fails when the link does not exist or the flag change is rejected.
    fn set_down(&self, iface: &str) -> Result<(), NetError>;

    /// Applies one shaping rung: clears any non-default root qdisc, installs
    /// a token-bucket filter at `rate_bytes_per_s`, and, when `delay_us` is
    /// non-zero, a network-emulator delay beneath it.
    ///
    /// # Errors
    ///
    /// Fails when any of the tc invocations fail; the interface may be left
    /// with only the bandwidth rule applied.
    fn apply_rate(&self, iface: &str, rate_bytes_per_s: u64, delay_us: u64) -> Result<(), NetError>;
}

/// Production [`LinkControl`] over rtnetlink + `tc`.
pub struct NetlinkLinkControl {
    rt: tokio::runtime::Runtime,
    handle: rtnetlink::Handle,
    tc: String,
}

impl NetlinkLinkControl {
    /// Opens the netlink connection on a private current-thread runtime.
    ///
    /// # Errors
    ///
    /// Fails when the runtime or the netlink socket cannot be created.
    pub fn new() -> Result<Self, NetError> {
        let rt = tokio::runtime::Builder::new_current_thread()
            .enable_io()
            .enable_time()
            .build()
            .map_err(NetError::Connection)?;

        let (conn, handle, _) = rt
            .block_on(async { rtnetlink::new_connection() })
            .map_err(NetError::Connection)?;
        rt.spawn(conn);

        Ok(Self {
            rt,
            handle,
            tc: "tc".to_string(),
        })
    }

    fn link_index(&self, iface: &str) -> Result<u32, NetError> {
        self.rt.block_on(async {
            let mut links = self
                .handle
                .link()
                .get()
                .match_name(iface.to_string())
                .execute();
            match links.try_next().await? {
                Some(link) => Ok(link.header.index),
                None => Err(NetError::LinkNotFound {
                    name: iface.to_string(),
                }),
            }
        })
    }

    fn tc_qdisc(&self, iface: &str, verb: &'static str, args: &[&str]) -> Result<String, NetError> {
        let output = Command::new(&self.tc)
            .args(["qdisc", verb, "dev", iface])
            .args(args)
            .output()
            .map_err(|e| NetError::Tc {
                verb,
                iface: iface.to_string(),
                detail: e.to_string(),
            })?;

        if !output.status.success() {
            return Err(NetError::Tc {
                verb,
                iface: iface.to_string(),
                detail: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }

    fn clear_root_qdisc(&self, iface: &str) -> Result<(), NetError> {
        let listing = self.tc_qdisc(iface, "show", &[])?;
        if let Some(kind) = non_default_root_qdisc(&listing) {
            tracing::debug!("removing root qdisc '{kind}' from {iface}");
            self.tc_qdisc(iface, "del", &["root"])?;
        }
        Ok(())
    }
}

impl LinkControl for NetlinkLinkControl {
    fn vxlan_links(&self) -> Result<Vec<String>, NetError> {
        self.rt.block_on(async {
            let mut names = Vec::new();
            let mut links = self.handle.link().get().execute();
            while let Some(link) = links.try_next().await? {
                let mut name = None;
                let mut vxlan = false;
                for attr in &link.attributes {
                    match attr {
                        LinkAttribute::IfName(n) => name = Some(n.clone()),
                        LinkAttribute::LinkInfo(infos) => {
                            vxlan = infos
                                .iter()
                                .any(|i| matches!(i, LinkInfo::Kind(InfoKind::Vxlan)));
                        }
                        _ => {}
                    }
                }
                if vxlan {
                    if let Some(name) = name {
                        names.push(name);
                    }
                }
            }
            Ok(names)
        })
    }

    fn set_down(&self, iface: &str) -> Result<(), NetError> {
        let index = self.link_index(iface)?;
        self.rt
            .block_on(async { self.handle.link().set(index).down().execute().await })?;
        Ok(())
    }

    fn apply_rate(&self, iface: &str, rate_bytes_per_s: u64, delay_us: u64) -> Result<(), NetError> {
        self.clear_root_qdisc(iface)?;

        // Bandwidth rule first; it becomes the parent of the delay rule.
        let rate = format!("{rate_bytes_per_s}bps");
        self.tc_qdisc(
            iface,
            "add",
            &[
                "root", "handle", "1:", "tbf", "rate", &rate, "buffer", "1600", "limit", "3000",
            ],
        )?;

        if delay_us > 0 {
            let delay = format!("{delay_us}us");
            self.tc_qdisc(
                iface,
                "add",
                &["parent", "1:", "handle", "10:", "netem", "delay", &delay],
            )?;
        }
        Ok(())
    }
}

/// Returns the kind of the root qdisc in a `tc qdisc show` listing when it
/// is not one the kernel installs by default.
fn non_default_root_qdisc(listing: &str) -> Option<String> {
    for line in listing.lines() {
        let mut parts = line.split_whitespace();
        if parts.next() != Some("qdisc") {
            continue;
        }
        let Some(kind) = parts.next() else { continue };
        let _handle = parts.next();
        if parts.next() != Some("root") {
            continue;
        }
        if !DEFAULT_QDISCS.contains(&kind) {
            return Some(kind.to_string());
        }
    }
    None
}
