// Pawnbutler Core — Network Guard
// Defence-in-depth for the container sandbox: refuses container configs
// that would grant network access, scans command strings for an
// enumerated escape catalogue, and verifies at runtime that a live
// container really has no network.

use bollard::Docker;
use log::warn;

use crate::atoms::error::EngineResult;
use crate::sandbox::{NetworkMode, SandboxConfig};

// ── Escape catalogue ───────────────────────────────────────────────────

/// (needle, threat description). Matched case-insensitively against the
/// whole command string; one hit is enough to refuse dispatch.
const ESCAPE_PATTERNS: &[(&str, &str)] = &[
    ("nsenter", "namespace entry into the host (nsenter)"),
    ("--privileged", "privileged container escalation"),
    ("/proc/1/", "host init process access via /proc/1/"),
    ("chroot", "root filesystem pivot (chroot)"),
    ("mount ", "filesystem mount"),
    ("umount", "filesystem unmount"),
    ("--cap-add", "capability escalation (--cap-add)"),
    ("apparmor=unconfined", "AppArmor confinement disable"),
    ("--pid=host", "host PID namespace sharing"),
    ("--net=host", "host network namespace sharing"),
    ("--network=host", "host network namespace sharing"),
    ("docker.sock", "Docker control socket access"),
    ("iptables", "firewall manipulation"),
    ("ip route", "routing table manipulation"),
    ("ip link", "network interface manipulation"),
];

/// One detected escape attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EscapeThreat {
    pub pattern: String,
    pub description: String,
}

// ── NetworkGuard ───────────────────────────────────────────────────────

#[derive(Debug, Default)]
pub struct NetworkGuard;

impl NetworkGuard {
    pub fn new() -> Self {
        NetworkGuard
    }

    /// A container is only created if its config passes this check. The
    /// only acceptable network mode is `none`.
    pub fn validate_config(&self, config: &SandboxConfig) -> EngineResult<()> {
        if config.network_mode != NetworkMode::None {
            return Err(format!(
                "Sandbox config refused: network mode '{}' is not permitted (only 'none')",
                config.network_mode.as_str()
            )
            .into());
        }
        Ok(())
    }

    /// Scan a command for escape patterns. Empty result means clean.
    pub fn scan_command(&self, command: &str) -> Vec<EscapeThreat> {
        let lowered = command.to_lowercase();
        let mut threats = Vec::new();
        for (needle, description) in ESCAPE_PATTERNS {
            if lowered.contains(needle) {
                threats.push(EscapeThreat {
                    pattern: (*needle).to_string(),
                    description: (*description).to_string(),
                });
            }
        }
        if !threats.is_empty() {
            warn!(
                "[netguard] Escape attempt detected in command ({} pattern(s)): {}",
                threats.len(),
                threats
                    .iter()
                    .map(|t| t.pattern.as_str())
                    .collect::<Vec<_>>()
                    .join(", ")
            );
        }
        threats
    }

    /// Inspect a running container and confirm its effective network mode
    /// is `none`. Run after creation; the config alone does not prove
    /// what the daemon actually did.
    pub async fn verify_isolation(&self, docker: &Docker, container_id: &str) -> EngineResult<()> {
        let inspection = docker
            .inspect_container(container_id, None::<bollard::container::InspectContainerOptions>)
            .await?;
        let mode = inspection
            .host_config
            .and_then(|hc| hc.network_mode)
            .unwrap_or_default();
        if mode != "none" {
            return Err(format!(
                "Container {} is not network-isolated (mode '{}')",
                container_id, mode
            )
            .into());
        }
        Ok(())
    }
}

// ── Tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_clean_command_passes() {
        let guard = NetworkGuard::new();
        assert!(guard.scan_command("ls -la /workspace").is_empty());
        assert!(guard.scan_command("python3 analyze.py").is_empty());
    }

    #[test]
    fn test_nsenter_detected() {
        let guard = NetworkGuard::new();
        let threats = guard.scan_command("nsenter --target 1 --mount");
        assert_eq!(threats.len(), 1);
        assert!(threats[0].description.contains("nsenter"));
    }

    #[test]
    fn test_catalogue_coverage() {
        let guard = NetworkGuard::new();
        let samples = [
            "docker run --privileged alpine",
            "cat /proc/1/environ",
            "chroot /host /bin/sh",
            "mount -t proc proc /proc",
            "umount /sys",
            "docker run --cap-add SYS_ADMIN x",
            "docker run --security-opt apparmor=unconfined x",
            "docker run --pid=host x",
            "docker run --net=host x",
            "docker run --network=host x",
            "curl --unix-socket /var/run/docker.sock http://x/",
            "iptables -F",
            "ip route add default via 1.2.3.4",
            "ip link set eth0 up",
        ];
        for sample in samples {
            assert!(
                !guard.scan_command(sample).is_empty(),
                "pattern missed: {}",
                sample
            );
        }
    }

    #[test]
    fn test_case_insensitive() {
        let guard = NetworkGuard::new();
        assert!(!guard.scan_command("NSENTER --target 1").is_empty());
        assert!(!guard.scan_command("IPTABLES -L").is_empty());
    }

    #[test]
    fn test_multiple_threats_all_reported() {
        let guard = NetworkGuard::new();
        let threats = guard.scan_command("nsenter; iptables -F; cat /proc/1/cmdline");
        assert_eq!(threats.len(), 3);
    }

    #[test]
    fn test_config_network_none_required() {
        let guard = NetworkGuard::new();
        let mut config = SandboxConfig::default();
        assert!(guard.validate_config(&config).is_ok());
        config.network_mode = NetworkMode::Bridge;
        assert!(guard.validate_config(&config).is_err());
    }
}
