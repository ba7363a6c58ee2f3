/// Values the installer can discover about the host when the config leaves them out.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostFacts {
    pub invoking_user: Option<String>,
    pub cpus: u32,
}

impl HostFacts {
    pub fn detect() -> Self {
        Self {
            invoking_user: detect_invoking_user(|key| std::env::var(key).ok()),
            cpus: std::thread::available_parallelism()
                .map(|n| n.get() as u32)
                .unwrap_or(1),
        }
    }
}

/// The operator account, preferring the account behind `sudo` when the
/// installer itself was (wrongly) started through it.
fn detect_invoking_user(lookup: impl Fn(&str) -> Option<String>) -> Option<String> {
    ["SUDO_USER", "USER", "LOGNAME"]
        .into_iter()
        .filter_map(lookup)
        .map(|v| v.trim().to_owned())
        .find(|v| !v.is_empty() && v != "root")
}
