//! Remote command groups run during provisioning
//!
//! Each command runs in its own exec channel, so environment set by one
//! command does not carry over to the next. Package commands therefore set
//! `DEBIAN_FRONTEND` inline.

use rc_protocol::Phase;

pub const INSTALL_PACKAGES: &[&str] = &[
    "DEBIAN_FRONTEND=noninteractive apt-get update -qq",
    "DEBIAN_FRONTEND=noninteractive apt-get install -y -qq curl wget git ca-certificates gnupg lsb-release",
];

pub const CREATE_USER: &[&str] = &[
    r#"useradd -m -s /bin/bash -c "RoboClaw system user" roboclaw || true"#,
    r#"echo "roboclaw ALL=(ALL) NOPASSWD:ALL" > /etc/sudoers.d/roboclaw"#,
    "chmod 0440 /etc/sudoers.d/roboclaw",
    "visudo -cf /etc/sudoers.d/roboclaw",
    "loginctl enable-linger roboclaw || true",
];

pub const INSTALL_DOCKER: &[&str] = &[
    "install -m 0755 -d /etc/apt/keyrings",
    "curl -fsSL https://download.docker.com/linux/ubuntu/gpg | gpg --batch --yes --dearmor -o /etc/apt/keyrings/docker.gpg",
    "chmod a+r /etc/apt/keyrings/docker.gpg",
    r#"ARCH=$(dpkg --print-architecture) && CODENAME=$(. /etc/os-release && echo "$VERSION_CODENAME") && echo "deb [arch=${ARCH} signed-by=/etc/apt/keyrings/docker.gpg] https://download.docker.com/linux/ubuntu ${CODENAME} stable" > /etc/apt/sources.list.d/docker.list"#,
    "DEBIAN_FRONTEND=noninteractive apt-get update -qq",
    "DEBIAN_FRONTEND=noninteractive apt-get install -y -qq docker-ce docker-ce-cli containerd.io",
    "usermod -aG docker roboclaw",
    "systemctl start docker",
    "systemctl enable docker",
];

pub const CONFIGURE_FIREWALL: &[&str] = &[
    "DEBIAN_FRONTEND=noninteractive apt-get install -y -qq ufw",
    "ufw default deny incoming",
    "ufw default allow outgoing",
    "ufw allow 22/tcp",
    "ufw --force enable",
];

pub const INSTALL_NODEJS: &[&str] = &[
    "curl -fsSL https://deb.nodesource.com/gpgkey/nodesource-repo.gpg.key | gpg --batch --yes --dearmor -o /usr/share/keyrings/nodesource.gpg",
    r#"echo "deb [signed-by=/usr/share/keyrings/nodesource.gpg] https://deb.nodesource.com/node_22.x nodistro main" > /etc/apt/sources.list.d/nodesource.list"#,
    "DEBIAN_FRONTEND=noninteractive apt-get update -qq",
    "DEBIAN_FRONTEND=noninteractive apt-get install -y -qq nodejs",
    "npm install -g pnpm",
];

pub const INSTALL_ROBOCLAW: &[&str] = &[
    "mkdir -p /home/roboclaw/.roboclaw/sessions",
    "mkdir -p /home/roboclaw/.roboclaw/credentials",
    "mkdir -p /home/roboclaw/.roboclaw/data",
    "mkdir -p /home/roboclaw/.roboclaw/logs",
    "mkdir -p /home/roboclaw/.local/share/pnpm",
    "mkdir -p /home/roboclaw/.local/bin",
    "chown -R roboclaw:roboclaw /home/roboclaw/.roboclaw",
    "chown -R roboclaw:roboclaw /home/roboclaw/.local",
    "chmod 0700 /home/roboclaw/.roboclaw/credentials",
    r#"su - roboclaw -c "pnpm config set global-dir /home/roboclaw/.local/share/pnpm""#,
    r#"su - roboclaw -c "pnpm config set global-bin-dir /home/roboclaw/.local/bin""#,
    r#"su - roboclaw -c "PNPM_HOME=/home/roboclaw/.local/share/pnpm PATH=/home/roboclaw/.local/bin:\$PATH pnpm install -g roboclaw@latest""#,
    r#"grep -q "BEGIN MANAGED BLOCK - RoboClaw" /home/roboclaw/.bashrc || cat >> /home/roboclaw/.bashrc << 'BASHRC_EOF'

# BEGIN MANAGED BLOCK - RoboClaw
export PNPM_HOME="/home/roboclaw/.local/share/pnpm"
export PATH="/home/roboclaw/.local/bin:$PNPM_HOME:$PATH"
# END MANAGED BLOCK - RoboClaw
BASHRC_EOF"#,
    "chown roboclaw:roboclaw /home/roboclaw/.bashrc",
];

pub const VERIFY: &[&str] = &[
    r#"su - roboclaw -c "roboclaw --version""#,
    "docker --version",
    "node --version",
    "pnpm --version",
    "ufw status",
];

/// Command group for a remote phase, with its start and done messages
pub fn group(phase: Phase) -> Option<(&'static [&'static str], &'static str, &'static str)> {
    let group = match phase {
        Phase::InstallPackages => (INSTALL_PACKAGES, "Installing base packages...", "Base packages installed"),
        Phase::CreateUser => (CREATE_USER, "Creating roboclaw user...", "RoboClaw user created"),
        Phase::InstallDocker => (INSTALL_DOCKER, "Installing Docker CE...", "Docker installed"),
        Phase::ConfigureFirewall => (CONFIGURE_FIREWALL, "Configuring UFW firewall...", "Firewall configured"),
        Phase::InstallRuntime => (INSTALL_NODEJS, "Installing Node.js 22 and pnpm...", "Node.js and pnpm installed"),
        Phase::InstallApplication => (INSTALL_ROBOCLAW, "Installing RoboClaw...", "RoboClaw installed"),
        Phase::Verify => (VERIFY, "Verifying installation...", "Installation verified"),
        _ => return None,
    };
    Some(group)
}
