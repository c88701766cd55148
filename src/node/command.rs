//! Typed administrative commands.
//!
//! Cluster-wide operations (create, join, leave, reshard, rebalance, check)
//! run through the store CLI inside a member container. [`AdminCommand`]
//! renders the argument vector in the order the CLI expects, with auth and
//! TLS flags appended last.
//!
//! TLS runs with `--insecure`: members present certificates for ephemeral pod
//! identities, so only the CA is pinned and hostname verification is off.

/// What the command does.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AdminPayload {
    /// Form a cluster from the given leader endpoints.
    Create { endpoints: Vec<String> },
    /// Join `new` through `existing`, optionally as a replica.
    AddNode {
        new: String,
        existing: String,
        as_replica: bool,
    },
    /// Remove `node_id` through `existing`.
    DelNode { existing: String, node_id: String },
    /// Move `slots` slots from one node to another.
    Reshard {
        endpoint: String,
        from: String,
        to: String,
        slots: u32,
    },
    /// Even out slot ownership across masters.
    Rebalance {
        endpoint: String,
        use_empty_masters: bool,
    },
    /// Consistency check.
    Check { endpoint: String },
}

impl AdminPayload {
    pub fn name(&self) -> &'static str {
        match self {
            AdminPayload::Create { .. } => "create",
            AdminPayload::AddNode { .. } => "add-node",
            AdminPayload::DelNode { .. } => "del-node",
            AdminPayload::Reshard { .. } => "reshard",
            AdminPayload::Rebalance { .. } => "rebalance",
            AdminPayload::Check { .. } => "check",
        }
    }

    fn args(&self) -> Vec<String> {
        let mut args = vec!["--cluster".to_string(), self.name().to_string()];
        match self {
            AdminPayload::Create { endpoints } => {
                args.extend(endpoints.iter().cloned());
                args.push("--cluster-yes".to_string());
            }
            AdminPayload::AddNode {
                new,
                existing,
                as_replica,
            } => {
                args.push(new.clone());
                args.push(existing.clone());
                if *as_replica {
                    args.push("--cluster-slave".to_string());
                }
            }
            AdminPayload::DelNode { existing, node_id } => {
                args.push(existing.clone());
                args.push(node_id.clone());
            }
            AdminPayload::Reshard {
                endpoint,
                from,
                to,
                slots,
            } => {
                args.push(endpoint.clone());
                args.extend([
                    "--cluster-from".to_string(),
                    from.clone(),
                    "--cluster-to".to_string(),
                    to.clone(),
                    "--cluster-slots".to_string(),
                    slots.to_string(),
                    "--cluster-yes".to_string(),
                ]);
            }
            AdminPayload::Rebalance {
                endpoint,
                use_empty_masters,
            } => {
                args.push(endpoint.clone());
                if *use_empty_masters {
                    args.push("--cluster-use-empty-masters".to_string());
                }
            }
            AdminPayload::Check { endpoint } => args.push(endpoint.clone()),
        }
        args
    }
}

/// A fully specified administrative invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AdminCommand {
    binary: String,
    payload: AdminPayload,
    password: Option<String>,
    tls_ca: Option<String>,
}

impl AdminCommand {
    pub fn new(binary: impl Into<String>, payload: AdminPayload) -> Self {
        Self {
            binary: binary.into(),
            payload,
            password: None,
            tls_ca: None,
        }
    }

    pub fn with_auth(mut self, password: Option<String>) -> Self {
        self.password = password;
        self
    }

    pub fn with_tls(mut self, ca_path: Option<String>) -> Self {
        self.tls_ca = ca_path;
        self
    }

    pub fn name(&self) -> &'static str {
        self.payload.name()
    }

    /// Argument vector to execute.
    pub fn argv(&self) -> Vec<String> {
        let mut argv = vec![self.binary.clone()];
        argv.extend(self.payload.args());
        if let Some(password) = &self.password {
            argv.push("-a".to_string());
            argv.push(password.clone());
        }
        if let Some(ca) = &self.tls_ca {
            argv.extend([
                "--tls".to_string(),
                "--cacert".to_string(),
                ca.clone(),
                "--insecure".to_string(),
            ]);
        }
        argv
    }

    /// Argument vector with the password masked, for logs and events.
    pub fn masked(&self) -> Vec<String> {
        let mut argv = self.argv();
        if self.password.is_some() {
            if let Some(pos) = argv.iter().position(|a| a == "-a") {
                if let Some(secret) = argv.get_mut(pos + 1) {
                    *secret = "******".to_string();
                }
            }
        }
        argv
    }
}

/// `cluster check` passes when exactly three lines start with `[OK]`.
pub fn check_passed(output: &str) -> bool {
    output
        .lines()
        .filter(|line| line.trim_start().starts_with("[OK]"))
        .count()
        == 3
}
