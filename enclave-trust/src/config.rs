//! TOML configuration for channel tuning and remote attestation policy.
//!
//! ```toml
//! [channel]
//! max-record-plaintext = 65536
//! ratchet-interval = 1000000
//!
//! [remote-attestation]
//! spid = "00112233445566778899aabbccddeeff"
//! quote-type = "linkable"
//! extended-group-ids = [0]
//! accepted-quote-statuses = ["OK"]
//! ```

use std::{fs, path::Path};

use anyhow::Context;
use serde::{Deserialize, Serialize};

use crate::{channel::ChannelConfig, handshake::remote::RaServerConfig};

#[derive(Clone, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
pub struct Config {
    #[serde(default)]
    pub channel: ChannelConfig,
    /// Only needed by service providers.
    #[serde(default)]
    pub remote_attestation: Option<RaServerConfig>,
}

impl Config {
    pub fn from_toml_str(s: &str) -> anyhow::Result<Self> {
        let config = toml::from_str::<Self>(s)
            .context("Failed to deserialize config")?;
        config.validate()?;
        Ok(config)
    }

    /// Read and validate a TOML config file.
    pub fn load(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let s = fs::read_to_string(path)
            .with_context(|| format!("{path:?}"))
            .context("Failed to read config file")?;
        Self::from_toml_str(&s).with_context(|| format!("{path:?}"))
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        self.channel.validate().context("Invalid [channel] config")?;
        if let Some(ra) = &self.remote_attestation {
            anyhow::ensure!(
                !ra.accepted_quote_statuses.is_empty(),
                "[remote-attestation] accepts no quote statuses",
            );
        }
        Ok(())
    }
}
