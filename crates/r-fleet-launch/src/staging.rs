//! ---
//! fleet_section: "02-launch-orchestration"
//! fleet_subsection: "module"
//! fleet_type: "source"
//! fleet_scope: "code"
//! fleet_description: "Per-launch install staging directory."
//! fleet_version: "v0.0.0-prealpha"
//! fleet_owner: "tbd"
//! ---
use std::fmt::Write as _;
use std::fs;
use std::path::{Path, PathBuf};

use r_fleet_model::{Network, Node};
use r_fleet_progress::lines;
use tempfile::TempDir;
use thiserror::Error;
use tracing::debug;

use crate::drivers::ProvisioningContext;

pub const CONTEXT_FILE: &str = "context.json";
pub const HOSTS_FILE: &str = "hosts";
pub const PLAYBOOK_FILE: &str = "playbook.yml";
pub const INSTALL_SCRIPT: &str = "install.sh";
pub const SELF_NODE_FILE: &str = "files/self_node.json";
pub const SAGE_NODE_FILE: &str = "files/sage_node.json";
pub const ADMIN_KEY_FILE: &str = "files/admin_ssh_key.pub";

#[derive(Debug, Error)]
pub enum StagingError {
    #[error("staging io failure at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to encode {file}: {source}")]
    Encode {
        file: &'static str,
        #[source]
        source: serde_json::Error,
    },
}

/// Files a launch attempt hands to the installer. The directory is removed
/// when the value is dropped.
#[derive(Debug)]
pub struct StagedInstall {
    dir: TempDir,
}

impl StagedInstall {
    pub fn prepare(
        root: Option<&Path>,
        network: &Network,
        node: &Node,
        sage: Option<&Node>,
        context: &ProvisioningContext,
    ) -> Result<Self, StagingError> {
        let builder = {
            let mut builder = tempfile::Builder::new();
            builder.prefix("fleet-launch-");
            builder
        };
        let dir = match root {
            Some(root) => {
                create_dir(root)?;
                builder.tempdir_in(root)
            }
            None => builder.tempdir(),
        }
        .map_err(|source| StagingError::Io {
            path: root.map(Path::to_path_buf).unwrap_or_else(std::env::temp_dir),
            source,
        })?;
        let staged = Self { dir };

        create_dir(&staged.path().join("files"))?;
        staged.write_json(CONTEXT_FILE, context)?;
        staged.write(HOSTS_FILE, &inventory(node))?;
        staged.write(PLAYBOOK_FILE, &playbook(&context.roles))?;
        staged.write_json(SELF_NODE_FILE, node)?;
        if let Some(sage) = sage {
            staged.write_json(SAGE_NODE_FILE, sage)?;
        }
        if let Some(key) = &network.ssh_key {
            staged.write(ADMIN_KEY_FILE, &format!("{}\n", key.trim()))?;
        }
        staged.write(INSTALL_SCRIPT, &install_script())?;
        staged.restrict_script()?;
        debug!(node = %node.id, dir = %staged.path().display(), "install files staged");
        Ok(staged)
    }

    pub fn path(&self) -> &Path {
        self.dir.path()
    }

    pub fn script(&self) -> PathBuf {
        self.path().join(INSTALL_SCRIPT)
    }

    fn write(&self, file: &str, contents: &str) -> Result<(), StagingError> {
        let path = self.path().join(file);
        fs::write(&path, contents).map_err(|source| StagingError::Io { path, source })
    }

    fn write_json<T: serde::Serialize>(
        &self,
        file: &'static str,
        value: &T,
    ) -> Result<(), StagingError> {
        let json = serde_json::to_string_pretty(value)
            .map_err(|source| StagingError::Encode { file, source })?;
        self.write(file, &json)
    }

    #[cfg(unix)]
    fn restrict_script(&self) -> Result<(), StagingError> {
        use std::os::unix::fs::PermissionsExt;
        let path = self.script();
        fs::set_permissions(&path, fs::Permissions::from_mode(0o500))
            .map_err(|source| StagingError::Io { path, source })
    }

    #[cfg(not(unix))]
    fn restrict_script(&self) -> Result<(), StagingError> {
        Ok(())
    }
}

fn create_dir(path: &Path) -> Result<(), StagingError> {
    fs::create_dir_all(path).map_err(|source| StagingError::Io {
        path: path.to_path_buf(),
        source,
    })
}

fn inventory(node: &Node) -> String {
    let mut hosts = String::from("[fleet]\n");
    let _ = writeln!(
        hosts,
        "{} ansible_user={} hostname={} fqdn={}",
        node.address().unwrap_or_default(),
        node.ssh_user.as_deref().unwrap_or("root"),
        node.host,
        node.fqdn
    );
    hosts
}

fn playbook(roles: &[String]) -> String {
    let mut playbook = String::from("- hosts: fleet\n  roles:\n");
    for role in roles {
        let _ = writeln!(playbook, "    - {}", role);
    }
    playbook
}

// Progress lines are echoed so the meter sees them even when the remote side
// is silent. Connection settings come from the environment set by the executor.
fn install_script() -> String {
    format!(
        r#"#!/bin/bash
set -euo pipefail
SSH_OPTS="-o StrictHostKeyChecking=no -o ConnectTimeout=30 ${{FLEET_SSH_IDENTITY:+-i $FLEET_SSH_IDENTITY}}"
TARGET="${{FLEET_SSH_USER}}@${{FLEET_NODE_ADDRESS}}"
echo '{copying}'
rsync -az -e "ssh ${{SSH_OPTS}}" ./ "${{TARGET}}:/root/fleet-install/"
echo '{running}'
ssh ${{SSH_OPTS}} "${{TARGET}}" 'cd /root/fleet-install && ansible-playbook -i hosts {playbook}'
"#,
        copying = lines::COPYING_INSTALL_FILES,
        running = lines::RUNNING_INSTALLER,
        playbook = PLAYBOOK_FILE,
    )
}
