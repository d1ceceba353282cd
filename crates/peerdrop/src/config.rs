use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use camino::{Utf8Path, Utf8PathBuf};
use eyre::{Result as EyreResult, WrapErr};
use libp2p::identity::Keypair;
use serde::{Deserialize, Serialize};
use tokio::fs;
use tracing::info;

pub const SETTINGS_FILE: &str = "config.toml";

/// Persisted node settings. The identity keypair is generated on first
/// run and reused afterwards so the node id stays stable.
#[derive(Debug, Serialize, Deserialize)]
pub struct Settings {
    pub identity: IdentitySettings,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct IdentitySettings {
    /// Base64 of the protobuf-encoded keypair.
    keypair: String,
}

impl Settings {
    pub async fn load_or_create(home: &Utf8Path) -> EyreResult<Self> {
        let path = home.join(SETTINGS_FILE);

        match fs::read_to_string(&path).await {
            Ok(raw) => {
                toml::from_str(&raw).wrap_err_with(|| format!("failed to parse {path}"))
            }
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                let settings = Self::generate()?;
                settings.save(home).await?;
                info!("generated a new identity, stored in {path}");
                Ok(settings)
            }
            Err(err) => Err(err).wrap_err_with(|| format!("failed to read {path}")),
        }
    }

    fn generate() -> EyreResult<Self> {
        let keypair = Keypair::generate_ed25519();
        let encoded = BASE64.encode(keypair.to_protobuf_encoding()?);

        Ok(Self {
            identity: IdentitySettings { keypair: encoded },
        })
    }

    pub async fn save(&self, home: &Utf8Path) -> EyreResult<()> {
        fs::create_dir_all(home)
            .await
            .wrap_err_with(|| format!("failed to create {home}"))?;

        let path = home.join(SETTINGS_FILE);
        fs::write(&path, toml::to_string_pretty(self)?)
            .await
            .wrap_err_with(|| format!("failed to write {path}"))
    }

    pub fn keypair(&self) -> EyreResult<Keypair> {
        let raw = BASE64
            .decode(&self.identity.keypair)
            .wrap_err("identity keypair is not valid base64")?;

        Keypair::from_protobuf_encoding(&raw).wrap_err("identity keypair could not be decoded")
    }

    #[must_use]
    pub fn path(home: &Utf8Path) -> Utf8PathBuf {
        home.join(SETTINGS_FILE)
    }
}
