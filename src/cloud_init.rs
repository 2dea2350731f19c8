//! First-boot configuration for freshly created machines.
//!
//! The rendered cloud-config installs the base toolchain a CI job expects,
//! moves sshd to the custom port, and fetches the architecture-specific
//! runner helper. Two substitution points: the additional authorized keys
//! (block omitted entirely when empty) and the architecture tag.

use crate::ssh::CUSTOM_SSH_PORT;

const RUNNER_DOWNLOAD_BASE: &str =
    "https://gitlab-runner-downloads.s3.amazonaws.com/latest/binaries";

/// Splits a newline-delimited configuration string into individual keys.
/// Blank lines and surrounding whitespace are dropped; an empty input yields
/// an empty sequence.
#[must_use]
pub fn split_authorized_keys(raw: &str) -> Vec<String> {
    raw.lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .map(ToOwned::to_owned)
        .collect()
}

/// Renders the cloud-config payload delivered to a new machine.
#[must_use]
pub fn render_user_data(authorized_keys: &[String], architecture_tag: &str) -> String {
    let mut out = String::from("#cloud-config\n");
    out.push_str("package_update: true\n");
    out.push_str("packages:\n");
    out.push_str("  - git\n");
    out.push_str("  - git-lfs\n");
    out.push_str("  - curl\n");

    if !authorized_keys.is_empty() {
        out.push_str("ssh_authorized_keys:\n");
        for key in authorized_keys {
            out.push_str("  - ");
            out.push_str(key);
            out.push('\n');
        }
    }

    out.push_str("write_files:\n");
    out.push_str("  - path: /etc/ssh/sshd_config.d/builder.conf\n");
    out.push_str("    content: |\n");
    out.push_str(&format!("      Port {CUSTOM_SSH_PORT}\n"));
    out.push_str("runcmd:\n");
    out.push_str(&format!(
        "  - curl -fsSL -o /usr/local/bin/gitlab-runner {RUNNER_DOWNLOAD_BASE}/gitlab-runner-linux-{architecture_tag}\n"
    ));
    out.push_str("  - chmod +x /usr/local/bin/gitlab-runner\n");
    out.push_str("  - systemctl restart ssh\n");
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn renders_authorized_keys_block_when_keys_present() {
        let keys = vec![
            "ecdsa-sha2-nistp256 AAAA... ci".to_owned(),
            "ssh-ed25519 AAAA... ops".to_owned(),
        ];
        let rendered = render_user_data(&keys, "amd64");
        assert!(rendered.contains("ssh_authorized_keys:"));
        assert!(rendered.contains("  - ecdsa-sha2-nistp256 AAAA... ci\n"));
        assert!(rendered.contains("  - ssh-ed25519 AAAA... ops\n"));
    }

    #[test]
    fn omits_authorized_keys_block_when_empty() {
        let rendered = render_user_data(&[], "amd64");
        assert!(!rendered.contains("ssh_authorized_keys"));
        assert!(rendered.starts_with("#cloud-config\n"));
    }

    #[test]
    fn substitutes_the_architecture_tag() {
        let rendered = render_user_data(&[], "arm64");
        assert!(rendered.contains("gitlab-runner-linux-arm64"));
        assert!(!rendered.contains("gitlab-runner-linux-amd64"));
    }

    #[test]
    fn moves_sshd_to_the_custom_port() {
        let rendered = render_user_data(&[], "amd64");
        assert!(rendered.contains(&format!("Port {CUSTOM_SSH_PORT}")));
    }

    #[test]
    fn split_drops_blank_lines_and_whitespace() {
        assert!(split_authorized_keys("").is_empty());
        assert!(split_authorized_keys("\n\n  \n").is_empty());
        assert_eq!(
            split_authorized_keys("ssh-ed25519 AAA one\n\n  ssh-ed25519 BBB two  \n"),
            vec![
                "ssh-ed25519 AAA one".to_owned(),
                "ssh-ed25519 BBB two".to_owned(),
            ]
        );
    }
}
