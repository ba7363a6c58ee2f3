use crate::layout::StateLayout;
use crate::{fsync_dir, StoreError};
use std::collections::BTreeMap;
use std::fs;
use std::io::Write;
use tempfile::NamedTempFile;
use tracing::{debug, info};

const SECRET_HEX_LEN: usize = 32;

/// Credentials generated on behalf of the operator.
///
/// A re-run must write the same credentials file it wrote the first time,
/// otherwise an already-initialized database would be locked out. Generated
/// values are therefore cached (0600) next to the checkpoint.
pub struct SecretStore {
    layout: StateLayout,
}

impl SecretStore {
    pub fn new(layout: StateLayout) -> Self {
        Self { layout }
    }

    pub fn get_or_generate(&self, name: &str) -> Result<String, StoreError> {
        let mut secrets = self.read_all()?;
        if let Some(existing) = secrets.get(name) {
            debug!("reusing generated secret '{name}'");
            return Ok(existing.clone());
        }
        let value = generate_secret(name)?;
        secrets.insert(name.to_owned(), value.clone());
        self.write_all(&secrets)?;
        info!("generated new secret '{name}'");
        Ok(value)
    }

    pub fn clear(&self) -> Result<(), StoreError> {
        match fs::remove_file(self.layout.secrets_file()) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    fn read_all(&self) -> Result<BTreeMap<String, String>, StoreError> {
        match fs::read_to_string(self.layout.secrets_file()) {
            Ok(content) => Ok(serde_json::from_str(&content)?),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(BTreeMap::new()),
            Err(e) => Err(e.into()),
        }
    }

    fn write_all(&self, secrets: &BTreeMap<String, String>) -> Result<(), StoreError> {
        let dir = self.layout.root().to_path_buf();
        fs::create_dir_all(&dir)?;
        let content = serde_json::to_string_pretty(secrets)?;
        let mut tmp = NamedTempFile::new_in(&dir)?;
        tmp.write_all(content.as_bytes())?;
        tmp.as_file().sync_all()?;
        tmp.persist(self.layout.secrets_file())
            .map_err(|e| StoreError::Io(e.error))?;
        fsync_dir(&dir)?;
        Ok(())
    }
}

fn generate_secret(name: &str) -> Result<String, StoreError> {
    let mut seed = [0u8; 32];
    getrandom::fill(&mut seed).map_err(|e| StoreError::Entropy(e.to_string()))?;
    let context = format!("stackwright generated credential {name}");
    let key = blake3::derive_key(&context, &seed);
    let hex = blake3::Hash::from(key).to_hex();
    Ok(hex[..SECRET_HEX_LEN].to_owned())
}
