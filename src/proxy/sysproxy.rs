//! OS-level system proxy registration.
//!
//! External collaborator surface: the bootstrap only needs `enable` and the
//! restore-on-drop guard. macOS goes through `networksetup`, GNOME-based
//! Linux through `gsettings`; everything else reports unsupported.

use std::net::SocketAddr;
use std::process::Command;

use tracing::{debug, warn};

/// Undoes the registration when dropped.
pub struct SystemProxyGuard {
    program: &'static str,
    restore: Vec<Vec<String>>,
}

impl Drop for SystemProxyGuard {
    fn drop(&mut self) {
        for args in &self.restore {
            if let Err(e) = run(self.program, args) {
                warn!(error = %e, "failed restoring system proxy setting");
            }
        }
        debug!("system proxy restored");
    }
}

fn run(program: &str, args: &[String]) -> Result<(), String> {
    let output = Command::new(program)
        .args(args)
        .output()
        .map_err(|e| format!("failed running {program}: {e}"))?;
    if !output.status.success() {
        return Err(format!(
            "{program} {} failed: {}",
            args.join(" "),
            String::from_utf8_lossy(&output.stderr).trim()
        ));
    }
    Ok(())
}

/// Register `addr` as the system HTTP/HTTPS proxy.
#[cfg(target_os = "macos")]
pub fn enable(addr: &SocketAddr) -> Result<SystemProxyGuard, String> {
    let host = addr.ip().to_string();
    let port = addr.port().to_string();

    let services = Command::new("networksetup")
        .arg("-listallnetworkservices")
        .output()
        .map_err(|e| format!("failed listing network services: {e}"))?;
    if !services.status.success() {
        return Err("networksetup -listallnetworkservices failed".to_string());
    }

    let mut restore = Vec::new();
    let listing = String::from_utf8_lossy(&services.stdout);
    // First line is a notice; names prefixed with '*' are disabled services.
    for service in listing.lines().skip(1).filter(|line| !line.starts_with('*')) {
        let service = service.trim();
        if service.is_empty() {
            continue;
        }
        run(
            "networksetup",
            &[
                "-setwebproxy".to_string(),
                service.to_string(),
                host.clone(),
                port.clone(),
            ],
        )?;
        run(
            "networksetup",
            &[
                "-setsecurewebproxy".to_string(),
                service.to_string(),
                host.clone(),
                port.clone(),
            ],
        )?;
        restore.push(vec![
            "-setwebproxystate".to_string(),
            service.to_string(),
            "off".to_string(),
        ]);
        restore.push(vec![
            "-setsecurewebproxystate".to_string(),
            service.to_string(),
            "off".to_string(),
        ]);
    }

    Ok(SystemProxyGuard {
        program: "networksetup",
        restore,
    })
}

/// Register `addr` as the system HTTP/HTTPS proxy (GNOME settings).
#[cfg(target_os = "linux")]
pub fn enable(addr: &SocketAddr) -> Result<SystemProxyGuard, String> {
    let host = addr.ip().to_string();
    let port = addr.port().to_string();

    for schema in ["org.gnome.system.proxy.http", "org.gnome.system.proxy.https"] {
        run(
            "gsettings",
            &[
                "set".to_string(),
                schema.to_string(),
                "host".to_string(),
                host.clone(),
            ],
        )?;
        run(
            "gsettings",
            &[
                "set".to_string(),
                schema.to_string(),
                "port".to_string(),
                port.clone(),
            ],
        )?;
    }
    run(
        "gsettings",
        &[
            "set".to_string(),
            "org.gnome.system.proxy".to_string(),
            "mode".to_string(),
            "manual".to_string(),
        ],
    )?;

    Ok(SystemProxyGuard {
        program: "gsettings",
        restore: vec![vec![
            "set".to_string(),
            "org.gnome.system.proxy".to_string(),
            "mode".to_string(),
            "none".to_string(),
        ]],
    })
}

#[cfg(not(any(target_os = "macos", target_os = "linux")))]
pub fn enable(_addr: &SocketAddr) -> Result<SystemProxyGuard, String> {
    Err("system proxy registration is not supported on this platform".to_string())
}
