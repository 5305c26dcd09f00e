// Host identity used as the lease owner

/// Provides a stable string identifying the current process
pub trait HostIdentity: Send + Sync {
    fn host_id(&self) -> String;
}

/// Identity fixed by configuration
#[derive(Debug, Clone)]
pub struct StaticHostIdentity(String);

impl StaticHostIdentity {
    pub fn new(host_id: impl Into<String>) -> Self {
        Self(host_id.into())
    }
}

impl HostIdentity for StaticHostIdentity {
    fn host_id(&self) -> String {
        self.0.clone()
    }
}

/// Identity derived from the machine name and process id.
///
/// The process id keeps several processes on one machine distinct.
#[derive(Debug, Clone)]
pub struct SystemHostIdentity {
    host_id: String,
}

impl SystemHostIdentity {
    pub fn new() -> Self {
        let machine = ["HOSTNAME", "COMPUTERNAME"]
            .iter()
            .find_map(|var| std::env::var(var).ok().filter(|v| !v.trim().is_empty()))
            .unwrap_or_else(|| "unknown-host".to_string());

        Self {
            host_id: format!("{}-{}", machine.trim(), std::process::id()),
        }
    }
}

impl Default for SystemHostIdentity {
    fn default() -> Self {
        Self::new()
    }
}

impl HostIdentity for SystemHostIdentity {
    fn host_id(&self) -> String {
        self.host_id.clone()
    }
}

/// Configured identity when present, otherwise the system one
pub fn resolve_host_identity(configured: Option<&str>) -> Box<dyn HostIdentity> {
    match configured.map(str::trim).filter(|id| !id.is_empty()) {
        Some(id) => Box::new(StaticHostIdentity::new(id)),
        None => Box::new(SystemHostIdentity::new()),
    }
}
