//! Guest identity rewriting: hostname, hosts table, network profiles.
//!
//! Two interface-configuration dialects are supported: NetworkManager
//! keyfiles under `etc/NetworkManager/system-connections/` and sysconfig
//! flat files under `etc/sysconfig/network/ifcfg-*`. A guest enables one of
//! them in practice; both rewrite paths run, each gated by the guest's own
//! service-enablement links. Every change is a whole-file read, transform,
//! write-back, so a crash never leaves a file mixed beyond single-file
//! granularity.

use std::path::{Path, PathBuf};
use std::sync::LazyLock;

use regex::{Captures, Regex};

use crate::errors::{DupError, DupResult};

/// What to do to the guest's interface configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NetworkMode {
    /// Static assignments become DHCP.
    ResetToDhcp,
    /// Pin the first interface to this `address/prefix`.
    SetCidr(String),
    /// Operator-supplied literal substitutions across all profiles; no
    /// structural inference.
    SubstitutePairs(Vec<(String, String)>),
    /// Leave interfaces untouched.
    NoChange,
}

/// Rewrite every identity-bearing file under the guest's `etc`.
pub fn rewrite_identity(etc: &Path, name: &str, mode: &NetworkMode) -> DupResult<()> {
    reset_hostname(etc, name)?;

    match mode {
        NetworkMode::ResetToDhcp => {
            let nm = service_enabled(etc, "NetworkManager.service");
            let legacy = legacy_network_enabled(etc);
            if nm {
                keyfiles_reset_dhcp(etc)?;
            }
            if legacy {
                ifcfg_reset_dhcp(etc, name)?;
            }
            if !nm && !legacy {
                tracing::warn!("no enabled network service recognized, interfaces left as-is");
            }
        }
        NetworkMode::SetCidr(cidr) => {
            if service_enabled(etc, "NetworkManager.service") {
                keyfiles_set_cidr(etc, cidr)?;
            }
            if legacy_network_enabled(etc) {
                ifcfg_set_cidr(etc, cidr)?;
            }
            set_hosts_address(etc, name, address_part(cidr))?;
        }
        NetworkMode::SubstitutePairs(pairs) => substitute_everywhere(etc, pairs)?,
        NetworkMode::NoChange => {}
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// hostname / hosts
// ---------------------------------------------------------------------------

fn reset_hostname(etc: &Path, name: &str) -> DupResult<()> {
    let hostname_path = etc.join("hostname");
    let old = std::fs::read_to_string(&hostname_path)
        .map(|s| s.trim().to_string())
        .unwrap_or_default();

    write(&hostname_path, name)?;
    tracing::info!(new = name, old = %old, "reset /etc/hostname");

    let hosts_path = etc.join("hosts");
    if !old.is_empty() && hosts_path.exists() {
        let hosts = read(&hosts_path)?;
        if hosts.contains(&old) {
            write(&hosts_path, &hosts.replace(&old, name))?;
            tracing::info!(name, "reset /etc/hosts");
        }
    }
    Ok(())
}

/// Point the hosts record for `name` at `address`, appending one when none
/// exists. An existing record keeps its aliases; only the address column
/// changes.
fn set_hosts_address(etc: &Path, name: &str, address: &str) -> DupResult<()> {
    let path = etc.join("hosts");
    let text = if path.exists() {
        read(&path)?
    } else {
        String::new()
    };

    let mut found = false;
    let mut lines: Vec<String> = text
        .lines()
        .map(|line| {
            let mut cols = line.split_whitespace();
            let Some(first) = cols.next() else {
                return line.to_string();
            };
            if !first.starts_with('#') && cols.any(|c| c == name) {
                found = true;
                let names: Vec<&str> = line.split_whitespace().skip(1).collect();
                format!("{address} {}", names.join(" "))
            } else {
                line.to_string()
            }
        })
        .collect();

    if !found {
        lines.push(format!("{address} {name}"));
    }
    let mut joined = lines.join("\n");
    joined.push('\n');
    write(&path, &joined)?;
    tracing::info!(name, address, "hosts record calibrated");
    Ok(())
}

/// Address portion of `a.b.c.d/len`.
fn address_part(cidr: &str) -> &str {
    cidr.split('/').next().unwrap_or(cidr)
}

// ---------------------------------------------------------------------------
// dialect gating
// ---------------------------------------------------------------------------

/// Whether the guest enables `unit` at boot.
///
/// The wants entry is a symlink into the guest's own /usr, unresolvable
/// from the host, so presence is judged without following it.
fn service_enabled(etc: &Path, unit: &str) -> bool {
    etc.join("systemd/system/multi-user.target.wants")
        .join(unit)
        .symlink_metadata()
        .is_ok()
}

fn legacy_network_enabled(etc: &Path) -> bool {
    service_enabled(etc, "network.service") || service_enabled(etc, "wicked.service")
}

// ---------------------------------------------------------------------------
// sysconfig dialect (flat KEY=value, one interface per ifcfg-* file)
// ---------------------------------------------------------------------------

static BOOTPROTO_STATIC_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?m)^\s*BOOTPROTO\s*=.*static.*$").expect("valid bootproto pattern")
});
static BOOTPROTO_ANY_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?m)^\s*BOOTPROTO\s*=.*$").expect("valid bootproto pattern"));
static IPADDR_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"(?m)^(\s*IPADDR[_\d]*\s*=)([\s"']*\d+[\d./"']*).*$"#).expect("valid ipaddr pattern")
});

/// Interface profiles of the sysconfig dialect, lexicographically ordered;
/// the loopback profile and templates never count.
fn ifcfg_files(etc: &Path) -> Vec<PathBuf> {
    let dir = etc.join("sysconfig/network");
    let mut files: Vec<PathBuf> = std::fs::read_dir(&dir)
        .map(|entries| {
            entries
                .filter_map(|e| e.ok())
                .map(|e| e.path())
                .filter(|p| {
                    p.file_name()
                        .and_then(|n| n.to_str())
                        .is_some_and(|n| {
                            n.starts_with("ifcfg-")
                                && n != "ifcfg-lo"
                                && !n.ends_with(".template")
                        })
                })
                .collect()
        })
        .unwrap_or_default();
    files.sort();
    files
}

fn ifcfg_reset_dhcp(etc: &Path, name: &str) -> DupResult<()> {
    for path in ifcfg_files(etc) {
        let text = read(&path)?;
        let mut next = text.clone();

        if BOOTPROTO_STATIC_RE.is_match(&next) {
            next = BOOTPROTO_STATIC_RE
                .replace_all(&next, "BOOTPROTO='dhcp'")
                .into_owned();
            tracing::info!(vm = name, file = %display_etc(&path), "BOOTPROTO reset to dhcp, from static");
        }
        if IPADDR_RE.is_match(&next) {
            next = IPADDR_RE.replace_all(&next, "${1}''").into_owned();
            tracing::info!(vm = name, file = %display_etc(&path), "static address assignments blanked");
        }
        if next != text {
            write(&path, &next)?;
        }
    }
    Ok(())
}

/// Pin the first eligible profile to a static `cidr` assignment.
fn ifcfg_set_cidr(etc: &Path, cidr: &str) -> DupResult<()> {
    let Some(path) = ifcfg_files(etc).into_iter().next() else {
        tracing::warn!("no sysconfig interface profile to carry the address");
        return Ok(());
    };
    let text = read(&path)?;

    let mut next = if IPADDR_RE.is_match(&text) {
        IPADDR_RE
            .replacen(&text, 1, |c: &Captures| format!("{}'{cidr}'", &c[1]))
            .into_owned()
    } else {
        let mut t = text.clone();
        if !t.is_empty() && !t.ends_with('\n') {
            t.push('\n');
        }
        t.push_str(&format!("IPADDR='{cidr}'\n"));
        t
    };
    next = if BOOTPROTO_ANY_RE.is_match(&next) {
        BOOTPROTO_ANY_RE
            .replace(&next, "BOOTPROTO='static'")
            .into_owned()
    } else {
        format!("BOOTPROTO='static'\n{next}")
    };

    tracing::info!(file = %display_etc(&path), cidr, "static address pinned");
    write(&path, &next)
}

// ---------------------------------------------------------------------------
// NetworkManager keyfile dialect (section-delimited key=value)
// ---------------------------------------------------------------------------

/// Connection profiles of the keyfile dialect, lexicographically ordered.
fn keyfile_profiles(etc: &Path) -> Vec<PathBuf> {
    let dir = etc.join("NetworkManager/system-connections");
    let mut files: Vec<PathBuf> = std::fs::read_dir(&dir)
        .map(|entries| {
            entries
                .filter_map(|e| e.ok())
                .map(|e| e.path())
                .filter(|p| p.is_file())
                .collect()
        })
        .unwrap_or_default();
    files.sort();
    files
}

fn keyfiles_reset_dhcp(etc: &Path) -> DupResult<()> {
    for path in keyfile_profiles(etc) {
        let text = read(&path)?;
        let next = rewrite_ipv4(&text, "auto", None);
        if next != text {
            tracing::info!(file = %display_etc(&path), "ipv4 method reset to auto");
            write(&path, &next)?;
        }
    }
    Ok(())
}

fn keyfiles_set_cidr(etc: &Path, cidr: &str) -> DupResult<()> {
    let Some(path) = keyfile_profiles(etc).into_iter().next() else {
        tracing::warn!("no connection profile to carry the address");
        return Ok(());
    };
    let text = read(&path)?;
    let next = rewrite_ipv4(&text, "manual", Some(cidr));
    tracing::info!(file = %display_etc(&path), cidr, "static address pinned");
    write(&path, &next)
}

/// Rewrite the `[ipv4]` section: force `method`, optionally force
/// `address1`. Keys missing from an existing section are inserted at its
/// end; a profile without the section gets one appended. Other sections
/// (notably `[ipv6]` with its own `method`) pass through untouched.
fn rewrite_ipv4(text: &str, method: &str, address: Option<&str>) -> String {
    let mut out: Vec<String> = Vec::new();
    let mut in_ipv4 = false;
    let mut saw_section = false;
    let mut method_done = false;
    let mut address_done = false;

    for line in text.lines() {
        let trimmed = line.trim();
        if trimmed.starts_with('[') {
            if in_ipv4 {
                out.extend(pending_ipv4_lines(method, method_done, address, address_done));
                method_done = true;
                address_done = true;
            }
            in_ipv4 = trimmed == "[ipv4]";
            if in_ipv4 {
                saw_section = true;
            }
            out.push(line.to_string());
            continue;
        }
        if in_ipv4 {
            if trimmed.starts_with("method=") {
                out.push(format!("method={method}"));
                method_done = true;
                continue;
            }
            if address.is_some() && trimmed.starts_with("address1=") {
                out.push(format!("address1={}", address.unwrap_or_default()));
                address_done = true;
                continue;
            }
        }
        out.push(line.to_string());
    }

    if in_ipv4 {
        out.extend(pending_ipv4_lines(method, method_done, address, address_done));
    } else if !saw_section {
        out.push("[ipv4]".to_string());
        out.extend(pending_ipv4_lines(method, false, address, false));
    }

    let mut joined = out.join("\n");
    joined.push('\n');
    joined
}

fn pending_ipv4_lines(
    method: &str,
    method_done: bool,
    address: Option<&str>,
    address_done: bool,
) -> Vec<String> {
    let mut lines = Vec::new();
    if !method_done {
        lines.push(format!("method={method}"));
    }
    if let Some(addr) = address {
        if !address_done {
            lines.push(format!("address1={addr}"));
        }
    }
    lines
}

// ---------------------------------------------------------------------------
// operator-driven substitution
// ---------------------------------------------------------------------------

fn substitute_everywhere(etc: &Path, pairs: &[(String, String)]) -> DupResult<()> {
    let mut files = ifcfg_files(etc);
    files.extend(keyfile_profiles(etc));
    let hosts = etc.join("hosts");
    if hosts.exists() {
        files.push(hosts);
    }

    for path in files {
        let text = read(&path)?;
        let mut next = text.clone();
        for (old, new) in pairs {
            next = next.replace(old.as_str(), new.as_str());
        }
        if next != text {
            tracing::info!(file = %display_etc(&path), "applied literal substitutions");
            write(&path, &next)?;
        }
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// helpers
// ---------------------------------------------------------------------------

fn read(path: &Path) -> DupResult<String> {
    std::fs::read_to_string(path).map_err(|e| DupError::io(path, e))
}

fn write(path: &Path, text: &str) -> DupResult<()> {
    std::fs::write(path, text).map_err(|e| DupError::io(path, e))
}

/// Log paths as the guest sees them.
fn display_etc(path: &Path) -> String {
    let s = path.display().to_string();
    match s.rfind("/etc/") {
        Some(i) => s[i..].to_string(),
        None => s,
    }
}
