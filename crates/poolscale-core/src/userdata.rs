//! Default cloud-init document for new agents.

use crate::config::AgentConfig;

/// Render the cloud-init user data that installs Docker and starts the
/// agent container pointed at the build server.
pub fn render_default(agent: &AgentConfig) -> String {
    format!(
        r#"#cloud-config

apt_reboot_if_required: false
package_update: false
package_upgrade: false

runcmd:
  - [ sh, -c, "curl -fsSL https://get.docker.com | sh" ]
  - [ systemctl, enable, --now, docker ]
  - [ docker, run, -d, --restart=always, --name=agent, -v, "/var/run/docker.sock:/var/run/docker.sock", -e, "DRONE_SERVER={host}", -e, "DRONE_SECRET={token}", -e, "DRONE_MAX_PROCS={concurrency}", "{image}" ]
"#,
        host = agent.host,
        token = agent.token,
        concurrency = agent.concurrency,
        image = agent.image,
    )
}
