//! Platform network configuration via shell utilities.
//!
//! The contract with the OS is narrow: after setup, packets written to the
//! TUN fd appear on the wire to the specified destinations, and packets
//! destined to the assigned VPN address arrive via TUN reads. Best-effort
//! steps (DNS override, MSS clamping, queue tuning) log warnings on
//! failure; the tunnel proceeds without them.

use std::net::Ipv4Addr;
use std::process::Command;

use crate::error::{Error, Result};
use crate::{CLAMPED_MSS, VPN_NETMASK, VPN_SERVER_ADDR};

fn run_checked(program: &str, args: &[&str]) -> Result<()> {
    let output = Command::new(program)
        .args(args)
        .output()
        .map_err(Error::Io)?;

    if output.status.success() {
        Ok(())
    } else {
        let stderr = String::from_utf8_lossy(&output.stderr);
        Err(Error::Config(format!(
            "{program} {} failed: {}",
            args.join(" "),
            stderr.trim()
        )))
    }
}

fn run_best_effort(program: &str, args: &[&str]) {
    if let Err(e) = run_checked(program, args) {
        tracing::warn!(error = %e, "best-effort network command failed");
    }
}

/// Configure the server side: assign the gateway address, enable
/// forwarding and clamp TCP MSS on the forwarding chain.
pub fn server_setup(tun_name: &str) -> Result<()> {
    #[cfg(target_os = "linux")]
    {
        let cidr = format!("{VPN_SERVER_ADDR}/{VPN_NETMASK}");

        // A stale address from a previous run is not an error.
        run_best_effort("ip", &["addr", "flush", "dev", tun_name]);
        run_checked("ip", &["addr", "add", &cidr, "dev", tun_name])?;

        // The default qlen of 500 drops packets during bursts.
        run_best_effort(
            "ip",
            &["link", "set", "dev", tun_name, "txqueuelen", "10000"],
        );
        run_checked("ip", &["link", "set", "dev", tun_name, "up"])?;

        run_checked("sysctl", &["-w", "net.ipv4.ip_forward=1"])?;

        // MSS = MTU - IP header - TCP header, so downstream TCP segments
        // survive the encryption overhead without fragmenting.
        let mss = CLAMPED_MSS.to_string();
        run_best_effort(
            "iptables",
            &[
                "-t", "mangle", "-A", "FORWARD", "-p", "tcp", "--tcp-flags", "SYN,RST", "SYN",
                "-j", "TCPMSS", "--set-mss", &mss,
            ],
        );

        tracing::info!(tun = tun_name, addr = %VPN_SERVER_ADDR, "server TUN configured");
        Ok(())
    }

    #[cfg(not(target_os = "linux"))]
    {
        let _ = tun_name;
        Err(Error::Config(
            "the server requires Linux for forwarding and MSS clamping".into(),
        ))
    }
}

/// Client-side routing state, kept for restoration at teardown.
pub struct ClientRouting {
    tun_name: String,
    assigned: Ipv4Addr,
    server_host: String,
    original_gateway: Option<String>,
    routes_applied: bool,
}

impl ClientRouting {
    pub fn new(tun_name: &str, assigned: Ipv4Addr, server_host: &str) -> Self {
        Self {
            tun_name: tun_name.to_string(),
            assigned,
            server_host: server_host.to_string(),
            original_gateway: None,
            routes_applied: false,
        }
    }

    /// Assign the address and route all traffic through the tunnel: the
    /// server's public address stays reachable via the original gateway,
    /// everything else goes through the TUN.
    pub fn setup(&mut self) -> Result<()> {
        self.assign_address()?;

        let gateway = default_gateway()?;
        tracing::info!(gateway = %gateway, "saved original default gateway");
        self.original_gateway = Some(gateway.clone());

        #[cfg(target_os = "macos")]
        {
            run_best_effort("route", &["-n", "add", "-host", &self.server_host, &gateway]);
            run_checked("route", &["-n", "delete", "default"])?;
            let server_ip = VPN_SERVER_ADDR.to_string();
            run_checked("route", &["-n", "add", "-net", "default", &server_ip])?;

            // Pin public resolvers so DNS follows the tunnel.
            run_best_effort(
                "networksetup",
                &["-setdnsservers", "Wi-Fi", "1.1.1.1", "8.8.8.8"],
            );
        }

        #[cfg(target_os = "linux")]
        {
            run_best_effort("ip", &["route", "add", &self.server_host, "via", &gateway]);
            run_checked("ip", &["route", "del", "default"])?;
            let server_ip = VPN_SERVER_ADDR.to_string();
            run_checked(
                "ip",
                &["route", "add", "default", "via", &server_ip, "dev", &self.tun_name],
            )?;
        }

        self.routes_applied = true;
        tracing::info!("all traffic now routed through the tunnel");
        Ok(())
    }

    /// Best-effort restoration of routing and DNS.
    pub fn teardown(&mut self) {
        if !self.routes_applied {
            return;
        }
        self.routes_applied = false;

        #[cfg(target_os = "macos")]
        {
            run_best_effort("route", &["-n", "delete", "default"]);
            if let Some(gateway) = &self.original_gateway {
                run_best_effort("route", &["-n", "add", "-net", "default", gateway]);
            }
            run_best_effort("networksetup", &["-setdnsservers", "Wi-Fi", "Empty"]);
        }

        #[cfg(target_os = "linux")]
        {
            run_best_effort("ip", &["route", "del", "default", "dev", &self.tun_name]);
            if let Some(gateway) = &self.original_gateway {
                run_best_effort("ip", &["route", "add", "default", "via", gateway]);
            }
        }

        tracing::info!("routing restored to original gateway");
    }

    fn assign_address(&self) -> Result<()> {
        let addr = self.assigned.to_string();

        #[cfg(target_os = "macos")]
        {
            // Point-to-point to the server address.
            let server_ip = VPN_SERVER_ADDR.to_string();
            run_checked("ifconfig", &[&self.tun_name, &addr, &server_ip, "up"])?;
        }

        #[cfg(target_os = "linux")]
        {
            let cidr = format!("{addr}/{VPN_NETMASK}");
            run_checked("ip", &["addr", "add", &cidr, "dev", &self.tun_name])?;
            run_checked("ip", &["link", "set", "dev", &self.tun_name, "up"])?;
        }

        tracing::info!(tun = %self.tun_name, addr = %addr, "client TUN configured");
        Ok(())
    }
}

impl Drop for ClientRouting {
    fn drop(&mut self) {
        self.teardown();
    }
}

/// Query the current default gateway.
fn default_gateway() -> Result<String> {
    #[cfg(target_os = "macos")]
    let cmd = "route -n get default | grep gateway | awk '{print $2}'";
    #[cfg(not(target_os = "macos"))]
    let cmd = "ip route | grep default | awk '{print $3}'";

    let output = Command::new("sh")
        .args(["-c", cmd])
        .output()
        .map_err(Error::Io)?;

    let gateway = String::from_utf8_lossy(&output.stdout).trim().to_string();
    if gateway.is_empty() {
        return Err(Error::Config("no default gateway found".into()));
    }
    Ok(gateway)
}
