//! `virt-dup` — duplicate libvirt virtual machines in seconds.
//!
//! The speed comes from deploying VM images on a filesystem with native COW
//! (reflink) support — btrfs, xfs >= 4.16, ocfs2 — so a clone shares data
//! blocks instead of copying them. Each clone gets a fresh identity:
//! domain name, UUID, MAC addresses, hostname, hosts record, and either
//! DHCP or an operator-chosen address.

use std::net::Ipv4Addr;

use anyhow::{Context, bail};
use clap::Parser;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use virtdup::{CloneEngine, CloneRequest, NetworkMode};

const LOG_DIR: &str = "/var/log/virt-dup";

const EXAMPLES: &str = "\
examples:
  virt-dup VMx
  Implies `virt-dup VMx VMx_dup`.

  virt-dup VMx VM1 VM2 VM3
  Creates three clones named VM1 VM2 VM3.

  virt-dup --set-ip 192.168.151.101 VMx VM{1..16}
  16 clones, each with its own address from .101 to .116.

  virt-dup --change-ip 192.168.150:192.168.151,VMx:VMy VMx VMy
  Literal substitution across the clone's network profiles. Use with care!

Tip: to share an image among VMs, keep the VM name out of the image
filename prefix.
";

/// Duplicate libvirt virtual machines in seconds via filesystem-native
/// copy-on-write, resetting each clone's identity on the way.
///
/// An existing domain under a target name is destroyed and replaced.
#[derive(Parser, Debug)]
#[command(name = "virt-dup", version, about, after_help = EXAMPLES)]
struct Cli {
    /// Source VM (must exist in `virsh list --all`) followed by target
    /// names; without targets, `<source>_dup` is created
    #[arg(value_name = "VM_NAME", required = true, num_args = 1..)]
    vm_names: Vec<String>,

    /// Verbose (debug) logging
    #[arg(short, long)]
    verbose: bool,

    /// Assign IPADDR[/PREFIX] to the first NIC (prefix defaults to /24);
    /// with several targets each next clone gets the next address
    #[arg(long, value_name = "IPADDR[/PREFIX]")]
    set_ip: Option<String>,

    /// Literal FROM:TO substring substitutions applied to every network
    /// profile and /etc/hosts of the clone
    #[arg(long, value_name = "FROM:TO[,FROM:TO,...]")]
    change_ip: Option<String>,
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let (source, requests) = build_requests(&cli)?;

    let _log_guard = init_logging(cli.verbose);
    tracing::debug!(source, ?requests, "clone requests resolved");

    if !nix::unistd::geteuid().is_root() {
        bail!("virt-dup must run as root; refer to -h | --help");
    }

    let mut engine = CloneEngine::host_default().context("host staging setup failed")?;
    let report = engine
        .run(&source, &requests)
        .context("cloning aborted")?;

    for outcome in report.failed() {
        if let Err(e) = &outcome.result {
            eprintln!("error: {}: {e}", outcome.name);
        }
    }

    let hints: Vec<String> = report
        .succeeded()
        .map(|o| format!("    virsh start {}", o.name))
        .collect();
    if !hints.is_empty() {
        println!("now have fun:\n{}", hints.join("\n"));
    }

    let failures = report.failed().count();
    if failures > 0 {
        bail!("{failures} of {} clone(s) failed", report.outcomes.len());
    }
    Ok(())
}

/// Split the positional names into source and targets and resolve each
/// target's network treatment.
fn build_requests(cli: &Cli) -> anyhow::Result<(String, Vec<CloneRequest>)> {
    for name in &cli.vm_names {
        if name.contains(char::is_whitespace) {
            bail!("whitespace is prohibited in VM names: \"{name}\"");
        }
    }
    if cli.set_ip.is_some() && cli.change_ip.is_some() {
        bail!("--set-ip and --change-ip are mutually exclusive");
    }

    let source = cli.vm_names[0].clone();
    let targets: Vec<String> = if cli.vm_names.len() > 1 {
        cli.vm_names[1..].to_vec()
    } else {
        vec![format!("{source}_dup")]
    };

    let pairs = cli.change_ip.as_deref().map(parse_change_ip).transpose()?;

    let requests = targets
        .into_iter()
        .enumerate()
        .map(|(index, name)| {
            let network = if let Some(base) = &cli.set_ip {
                NetworkMode::SetCidr(cidr_with_offset(base, index as u32)?)
            } else if let Some(pairs) = &pairs {
                NetworkMode::SubstitutePairs(pairs.clone())
            } else {
                NetworkMode::ResetToDhcp
            };
            Ok(CloneRequest { name, network })
        })
        .collect::<anyhow::Result<Vec<_>>>()?;

    Ok((source, requests))
}

fn parse_change_ip(arg: &str) -> anyhow::Result<Vec<(String, String)>> {
    arg.split(',')
        .map(|pair| match pair.split_once(':') {
            Some((from, to)) if !from.is_empty() && !to.is_empty() => {
                Ok((from.to_string(), to.to_string()))
            }
            _ => bail!("--change-ip expects FROM:TO pairs, got \"{pair}\""),
        })
        .collect()
}

/// `a.b.c.d[/len]` advanced by `offset` addresses; a missing prefix length
/// becomes /24.
fn cidr_with_offset(base: &str, offset: u32) -> anyhow::Result<String> {
    let (addr, prefix) = match base.split_once('/') {
        Some((a, p)) => (a, Some(p)),
        None => (base, None),
    };
    let addr: Ipv4Addr = addr
        .parse()
        .with_context(|| format!("invalid IPv4 address \"{addr}\""))?;
    let prefix = match prefix {
        Some(p) => {
            let len: u8 = p
                .parse()
                .with_context(|| format!("invalid prefix length \"{p}\""))?;
            if len > 32 {
                bail!("invalid prefix length /{len}");
            }
            len
        }
        None => 24,
    };
    let shifted = Ipv4Addr::from(u32::from(addr).wrapping_add(offset));
    Ok(format!("{shifted}/{prefix}"))
}

/// Tracing to stdout plus `/var/log/virt-dup/virt-dup.log` when writable.
///
/// The returned guard keeps the background log writer alive for the rest of
/// `main`.
fn init_logging(verbose: bool) -> Option<tracing_appender::non_blocking::WorkerGuard> {
    let env_filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(if verbose { "debug" } else { "info" }))
        .unwrap();

    let stdout_layer = tracing_subscriber::fmt::layer().with_target(false);

    match std::fs::create_dir_all(LOG_DIR) {
        Ok(()) => {
            let appender = tracing_appender::rolling::never(LOG_DIR, "virt-dup.log");
            let (non_blocking, guard) = tracing_appender::non_blocking(appender);
            let file_layer = tracing_subscriber::fmt::layer()
                .with_writer(non_blocking)
                .with_target(false)
                .with_ansi(false);
            let _ = tracing_subscriber::registry()
                .with(env_filter)
                .with(stdout_layer)
                .with(file_layer)
                .try_init();
            Some(guard)
        }
        Err(_) => {
            let _ = tracing_subscriber::registry()
                .with(env_filter)
                .with(stdout_layer)
                .try_init();
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> Cli {
        Cli::try_parse_from(args).unwrap()
    }

    #[test]
    fn test_lone_source_implies_dup_suffix() {
        let cli = parse(&["virt-dup", "vmx"]);
        let (source, requests) = build_requests(&cli).unwrap();
        assert_eq!(source, "vmx");
        assert_eq!(requests.len(), 1);
        assert_eq!(requests[0].name, "vmx_dup");
        assert_eq!(requests[0].network, NetworkMode::ResetToDhcp);
    }

    #[test]
    fn test_explicit_targets_pass_through() {
        let cli = parse(&["virt-dup", "vmx", "vm1", "vm2", "vm3"]);
        let (_, requests) = build_requests(&cli).unwrap();
        let names: Vec<&str> = requests.iter().map(|r| r.name.as_str()).collect();
        assert_eq!(names, ["vm1", "vm2", "vm3"]);
    }

    #[test]
    fn test_set_ip_increments_per_target() {
        let cli = parse(&["virt-dup", "--set-ip", "192.168.151.101", "vmx", "a", "b", "c"]);
        let (_, requests) = build_requests(&cli).unwrap();
        let cidrs: Vec<&str> = requests
            .iter()
            .map(|r| match &r.network {
                NetworkMode::SetCidr(c) => c.as_str(),
                other => panic!("unexpected mode {other:?}"),
            })
            .collect();
        assert_eq!(
            cidrs,
            ["192.168.151.101/24", "192.168.151.102/24", "192.168.151.103/24"]
        );
    }

    #[test]
    fn test_set_ip_keeps_explicit_prefix() {
        assert_eq!(cidr_with_offset("10.0.0.254/16", 3).unwrap(), "10.0.1.1/16");
    }

    #[test]
    fn test_bad_ip_is_rejected() {
        assert!(cidr_with_offset("999.1.2.3", 0).is_err());
        assert!(cidr_with_offset("10.0.0.1/40", 0).is_err());
    }

    #[test]
    fn test_change_ip_parsing() {
        let pairs = parse_change_ip("192.168.150:192.168.151,vmx:vmy").unwrap();
        assert_eq!(
            pairs,
            vec![
                ("192.168.150".to_string(), "192.168.151".to_string()),
                ("vmx".to_string(), "vmy".to_string()),
            ]
        );
        assert!(parse_change_ip("missing-colon").is_err());
        assert!(parse_change_ip("a:").is_err());
    }

    #[test]
    fn test_whitespace_names_rejected() {
        let cli = parse(&["virt-dup", "bad name"]);
        assert!(build_requests(&cli).unwrap_err().to_string().contains("whitespace"));
    }

    #[test]
    fn test_conflicting_ip_flags_rejected() {
        let cli = parse(&[
            "virt-dup", "--set-ip", "10.0.0.1", "--change-ip", "a:b", "vmx",
        ]);
        assert!(
            build_requests(&cli)
                .unwrap_err()
                .to_string()
                .contains("mutually exclusive")
        );
    }
}
