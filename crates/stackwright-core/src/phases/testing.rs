use crate::context::InstallContext;
use stackwright_runtime::PrivilegedExecutor;
use stackwright_schema::{parse_config_str, InstallConfig};
use std::path::Path;

pub(crate) const ROOT: &str = "/srv/stack";

/// A complete config rooted at [`ROOT`], with `identity_extra` appended to
/// the `[identity]` table.
pub(crate) fn config(identity_extra: &str) -> InstallConfig {
    config_with("", identity_extra)
}

pub(crate) fn config_with(top_level: &str, identity_extra: &str) -> InstallConfig {
    parse_config_str(&format!(
        "{top_level}
[identity]
invoking_user = \"alice\"
install_root = \"{ROOT}\"
{identity_extra}
[network]
domain = \"stack.example.org\"

[credentials]
admin_password = \"admin-secret\"
database_password = \"db-secret-value\"
"
    ))
    .unwrap()
}

pub(crate) fn context_with<'a>(
    config: &'a InstallConfig,
    exec: &'a dyn PrivilegedExecutor,
    staging: &Path,
) -> InstallContext<'a> {
    InstallContext::new(config, exec, staging)
}
